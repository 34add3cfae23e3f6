// 该文件是 Lanjing （览镜） 项目的一部分。
// src/output/directory_record.rs - 目录记录输出
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;

use ab_glyph::FontArc;
use chrono::{DateTime, Datelike, Utc};
use thiserror::Error;
use tracing::debug;

use crate::{
  FromUrl, FromUrlWithScheme,
  config::ViewportSize,
  output::{DrawingContext, ImageCanvas, OverlaySurface},
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 按日期分目录保存每一帧叠加层；默认只保存有检测框的帧
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  canvas: ImageCanvas,
  frame_counter: u16,
  always: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let always = uri.query_pairs().any(|(k, _)| k == "always");

    Ok(DirectoryRecordOutput {
      directory: PathBuf::from(uri.path()),
      canvas: ImageCanvas::new(),
      frame_counter: 0,
      always,
    })
  }
}

impl DirectoryRecordOutput {
  pub fn with_font(mut self, font: FontArc) -> Self {
    self.canvas = self.canvas.with_font(font);
    self
  }

  fn frame_id(&mut self) -> u16 {
    self.frame_counter = self.frame_counter.wrapping_add(1);
    self.frame_counter
  }

  fn frame_path(&mut self, now: DateTime<Utc>) -> Result<PathBuf, DirectoryRecordOutputError> {
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    if !directory.exists() {
      std::fs::create_dir_all(&directory)?;
    }

    let filename = format!("{}-{:04X}.png", now.format("%H-%M-%S"), self.frame_id());
    Ok(directory.join(filename))
  }
}

impl OverlaySurface for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn attach(&mut self, viewport: ViewportSize) {
    self.canvas.attach(viewport);
  }

  fn width(&self) -> f32 {
    self.canvas.width()
  }

  fn height(&self) -> f32 {
    self.canvas.height()
  }

  fn context(&mut self) -> Option<&mut dyn DrawingContext> {
    self.canvas.context()
  }

  fn present(&mut self) -> Result<(), Self::Error> {
    let strokes = match self.canvas.canvas_context_mut() {
      Some(context) => context.take_stroke_count(),
      None => return Ok(()),
    };
    if strokes == 0 && !self.always {
      return Ok(());
    }

    let path = self.frame_path(Utc::now())?;
    if let Some(image) = self.canvas.image() {
      image.save(&path)?;
      debug!("记录叠加层 {} ({} 个检测框)", path.display(), strokes);
    }
    Ok(())
  }
}
