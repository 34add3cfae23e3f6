// 该文件是 Lanjing （览镜） 项目的一部分。
// src/output/save_image_file.rs - 保存叠加层图像文件
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::path::Path;

use ab_glyph::FontArc;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  config::ViewportSize,
  output::{DrawingContext, ImageCanvas, OverlaySurface},
};

/// 每次 present 覆盖写同一个 PNG 文件
pub struct SaveImageFileOutput {
  path: String,
  canvas: ImageCanvas,
}

#[derive(Error, Debug)]
pub enum SaveImageFileError {
  #[error("I/O 错误: {0}")]
  IoError(std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(image::ImageError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

impl FromUrlWithScheme for SaveImageFileOutput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(SaveImageFileError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }

    Ok(SaveImageFileOutput {
      path: uri.path().to_string(),
      canvas: ImageCanvas::new(),
    })
  }
}

impl SaveImageFileOutput {
  pub fn with_font(mut self, font: FontArc) -> Self {
    self.canvas = self.canvas.with_font(font);
    self
  }
}

impl OverlaySurface for SaveImageFileOutput {
  type Error = SaveImageFileError;

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
    let Some(image) = self.canvas.image() else {
      return Ok(());
    };

    if let Some(parent) = Path::new(&self.path).parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent).map_err(SaveImageFileError::IoError)?;
    }

    image
      .save(&self.path)
      .map_err(SaveImageFileError::ImageError)?;

    debug!("保存叠加层到文件: {}", self.path);

    Ok(())
  }
}
