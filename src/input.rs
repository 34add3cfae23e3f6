// 该文件是 Lanjing （览镜） 项目的一部分。
// src/input.rs - 摄像头/图像帧源
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

use image::{RgbImage, imageops::FilterType};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::{config::CameraConfig, frame::ImageTensor};

/// 惰性、可重启的图像张量序列
pub trait FrameSource {
  /// 取下一帧；当前没有可用帧时返回 None
  fn next_tensor(&mut self) -> Option<ImageTensor>;
  fn restart(&mut self) -> Result<(), InputError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
  fn next_tensor(&mut self) -> Option<ImageTensor> {
    (**self).next_tensor()
  }

  fn restart(&mut self) -> Result<(), InputError> {
    (**self).restart()
  }
}

/// 帧源不可用（例如摄像头权限被拒绝）时始终没有帧
impl<S: FrameSource> FrameSource for Option<S> {
  fn next_tensor(&mut self) -> Option<ImageTensor> {
    self.as_mut()?.next_tensor()
  }

  fn restart(&mut self) -> Result<(), InputError> {
    match self {
      Some(source) => source.restart(),
      None => Ok(()),
    }
  }
}

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::{ImageDirectoryInput, ImageFileInput, ImageFileInputError};

#[cfg(feature = "v4l_input")]
mod v4l_input;
#[cfg(feature = "v4l_input")]
pub use self::v4l_input::{V4lInput, V4lInputError};

#[derive(Error, Debug)]
pub enum InputError {
  #[cfg(feature = "read_image_file")]
  #[error("Image file input error: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
  #[cfg(feature = "v4l_input")]
  #[error("V4L input error: {0}")]
  V4lInputError(#[from] V4lInputError),
  #[error("URI scheme mismatch: {0}")]
  SchemeMismatch(String),
}

/// 把采集到的整幅图像缩放到模型输入尺寸
pub(crate) fn resize_to_tensor(image: &RgbImage, config: &CameraConfig) -> ImageTensor {
  if image.dimensions() == (config.resize_width, config.resize_height) {
    return ImageTensor::from(image.clone());
  }
  let resized = image::imageops::resize(
    image,
    config.resize_width,
    config.resize_height,
    FilterType::Triangle,
  );
  ImageTensor::from(resized)
}

/// 摄像头权限请求结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraPermission {
  Granted,
  Denied,
}

impl CameraPermission {
  /// 启动时请求一次；被拒绝只记录日志，帧源随后拿不到帧
  pub fn request(url: &Url) -> Self {
    match url.scheme() {
      #[cfg(feature = "v4l_input")]
      scheme if scheme == V4lInput::SCHEME => {
        let path = v4l_input::device_path(url);
        match std::fs::OpenOptions::new().read(true).write(true).open(&path) {
          Ok(_) => {
            info!("摄像头权限已获取: {}", path);
            CameraPermission::Granted
          }
          Err(e) => {
            warn!("摄像头权限被拒绝: {}, 错误: {}", path, e);
            CameraPermission::Denied
          }
        }
      }
      _ => CameraPermission::Granted,
    }
  }
}

pub enum InputWrapper {
  #[cfg(feature = "v4l_input")]
  V4l(Box<V4lInput>),
  #[cfg(feature = "read_image_file")]
  ReadImageFile(ImageFileInput),
  #[cfg(feature = "read_image_file")]
  ReadImageDirectory(ImageDirectoryInput),
}

impl InputWrapper {
  pub fn open(url: &Url, config: &CameraConfig) -> Result<Self, InputError> {
    #[cfg(feature = "v4l_input")]
    {
      if url.scheme() == V4lInput::SCHEME {
        let input = V4lInput::open(url, config)?;
        return Ok(InputWrapper::V4l(Box::new(input)));
      }
    }
    #[cfg(feature = "read_image_file")]
    {
      if url.scheme() == ImageFileInput::SCHEME {
        let input = ImageFileInput::open(url, config)?;
        return Ok(InputWrapper::ReadImageFile(input));
      }
      if url.scheme() == ImageDirectoryInput::SCHEME {
        let input = ImageDirectoryInput::open(url, config)?;
        return Ok(InputWrapper::ReadImageDirectory(input));
      }
    }
    let _ = config;
    Err(InputError::SchemeMismatch(url.scheme().to_string()))
  }
}

impl FrameSource for InputWrapper {
  fn next_tensor(&mut self) -> Option<ImageTensor> {
    match self {
      #[cfg(feature = "v4l_input")]
      InputWrapper::V4l(input) => input.next_tensor(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.next_tensor(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageDirectory(input) => input.next_tensor(),
    }
  }

  fn restart(&mut self) -> Result<(), InputError> {
    match self {
      #[cfg(feature = "v4l_input")]
      InputWrapper::V4l(input) => input.restart(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.restart(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageDirectory(input) => input.restart(),
    }
  }
}
