// 该文件是 Lanjing （览镜） 项目的一部分。
// src/output.rs - 叠加层绘制表面
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use ab_glyph::FontArc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, config::ViewportSize};

pub mod canvas;
pub use self::canvas::{CanvasContext, ImageCanvas, load_font};

pub mod record;
pub use self::record::{CommandRecordError, CommandRecordOutput, CommandRecorder, DrawCommand};

mod save_image_file;
pub use self::save_image_file::{SaveImageFileError, SaveImageFileOutput};

#[cfg(feature = "directory_record")]
mod directory_record;
#[cfg(feature = "directory_record")]
pub use self::directory_record::{DirectoryRecordOutput, DirectoryRecordOutputError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
  pub r: u8,
  pub g: u8,
  pub b: u8,
  pub a: u8,
}

impl Color {
  pub const RED: Color = Color::rgb(255, 0, 0);
  pub const TRANSPARENT: Color = Color {
    r: 0,
    g: 0,
    b: 0,
    a: 0,
  };

  pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
    Color { r, g, b, a: 255 }
  }
}

/// 二维绘图上下文，附着后在帧之间保持状态
pub trait DrawingContext {
  fn clear_rect(&mut self, x: f32, y: f32, width: f32, height: f32);
  fn stroke_rect(&mut self, x: f32, y: f32, width: f32, height: f32);
  fn stroke_text(&mut self, text: &str, x: f32, y: f32);
  fn set_stroke_style(&mut self, color: Color);
  fn set_fill_style(&mut self, color: Color);
  fn set_line_width(&mut self, width: f32);
}

/// 覆盖在摄像头画面上的透明绘制表面
pub trait OverlaySurface {
  type Error: std::error::Error + Send + Sync + 'static;

  /// 按视口尺寸初始化绘图上下文，之前 `context` 返回 None
  fn attach(&mut self, viewport: ViewportSize);
  fn width(&self) -> f32;
  fn height(&self) -> f32;
  fn context(&mut self) -> Option<&mut dyn DrawingContext>;
  /// 一帧绘制完成后调用
  fn present(&mut self) -> Result<(), Self::Error>;
}

/// 附着时的默认画笔：红色描边与填充，线宽 1
pub fn apply_default_style(context: &mut dyn DrawingContext) {
  context.set_stroke_style(Color::RED);
  context.set_fill_style(Color::RED);
  context.set_line_width(1.0);
}

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("保存图像文件错误: {0}")]
  SaveImageFileError(#[from] SaveImageFileError),
  #[cfg(feature = "directory_record")]
  #[error("目录记录输出错误: {0}")]
  DirectoryRecordOutputError(#[from] DirectoryRecordOutputError),
  #[error("绘制命令记录错误: {0}")]
  CommandRecordError(#[from] CommandRecordError),
  #[error("字体加载错误: {0}")]
  FontError(String),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

pub enum OutputWrapper {
  SaveImageFileOutput(SaveImageFileOutput),
  #[cfg(feature = "directory_record")]
  DirectoryRecordOutput(DirectoryRecordOutput),
  CommandRecordOutput(CommandRecordOutput),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      SaveImageFileOutput::SCHEME => {
        let output = SaveImageFileOutput::from_url(url)?;
        Ok(OutputWrapper::SaveImageFileOutput(output))
      }
      #[cfg(feature = "directory_record")]
      DirectoryRecordOutput::SCHEME => {
        let output = DirectoryRecordOutput::from_url(url)?;
        Ok(OutputWrapper::DirectoryRecordOutput(output))
      }
      CommandRecordOutput::SCHEME => {
        let output = CommandRecordOutput::from_url(url)?;
        Ok(OutputWrapper::CommandRecordOutput(output))
      }
      scheme => Err(OutputError::SchemeMismatch(scheme.to_string())),
    }
  }
}

impl OutputWrapper {
  /// 标签文字字体；绘制命令记录不需要字体
  pub fn with_font(self, font: FontArc) -> Self {
    match self {
      OutputWrapper::SaveImageFileOutput(output) => {
        OutputWrapper::SaveImageFileOutput(output.with_font(font))
      }
      #[cfg(feature = "directory_record")]
      OutputWrapper::DirectoryRecordOutput(output) => {
        OutputWrapper::DirectoryRecordOutput(output.with_font(font))
      }
      OutputWrapper::CommandRecordOutput(output) => OutputWrapper::CommandRecordOutput(output),
    }
  }
}

impl OverlaySurface for OutputWrapper {
  type Error = OutputError;

  fn attach(&mut self, viewport: ViewportSize) {
    match self {
      OutputWrapper::SaveImageFileOutput(output) => output.attach(viewport),
      #[cfg(feature = "directory_record")]
      OutputWrapper::DirectoryRecordOutput(output) => output.attach(viewport),
      OutputWrapper::CommandRecordOutput(output) => output.attach(viewport),
    }
  }

  fn width(&self) -> f32 {
    match self {
      OutputWrapper::SaveImageFileOutput(output) => output.width(),
      #[cfg(feature = "directory_record")]
      OutputWrapper::DirectoryRecordOutput(output) => output.width(),
      OutputWrapper::CommandRecordOutput(output) => output.width(),
    }
  }

  fn height(&self) -> f32 {
    match self {
      OutputWrapper::SaveImageFileOutput(output) => output.height(),
      #[cfg(feature = "directory_record")]
      OutputWrapper::DirectoryRecordOutput(output) => output.height(),
      OutputWrapper::CommandRecordOutput(output) => output.height(),
    }
  }

  fn context(&mut self) -> Option<&mut dyn DrawingContext> {
    match self {
      OutputWrapper::SaveImageFileOutput(output) => output.context(),
      #[cfg(feature = "directory_record")]
      OutputWrapper::DirectoryRecordOutput(output) => output.context(),
      OutputWrapper::CommandRecordOutput(output) => output.context(),
    }
  }

  fn present(&mut self) -> Result<(), Self::Error> {
    match self {
      OutputWrapper::SaveImageFileOutput(output) => output.present().map_err(OutputError::from),
      #[cfg(feature = "directory_record")]
      OutputWrapper::DirectoryRecordOutput(output) => {
        output.present().map_err(OutputError::from)
      }
      OutputWrapper::CommandRecordOutput(output) => output.present().map_err(OutputError::from),
    }
  }
}
