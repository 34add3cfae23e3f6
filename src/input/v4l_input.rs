// 该文件是 Lanjing （览镜） 项目的一部分。
// src/input/v4l_input.rs - V4L 摄像头输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use image::{ImageFormat, RgbImage};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;
use v4l::{
  Device, FourCC,
  buffer::Type,
  io::{mmap::Stream, traits::CaptureStream},
  video::Capture,
};

use crate::{
  config::CameraConfig,
  frame::ImageTensor,
  input::{FrameSource, InputError, resize_to_tensor},
};

const DEFAULT_DEVICE: &str = "/dev/video0";
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum V4lInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Unsupported pixel format: {0}")]
  UnsupportedPixelFormat(String),
  #[error("Frame decode error: {0}")]
  DecodeError(#[from] image::ImageError),
  #[error("Captured buffer too short: expected {expected}, got {actual}")]
  ShortBuffer { expected: usize, actual: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelFormat {
  Rgb3,
  Mjpg,
}

impl PixelFormat {
  fn from_fourcc(fourcc: &FourCC) -> Result<Self, V4lInputError> {
    match &fourcc.repr {
      b"RGB3" => Ok(PixelFormat::Rgb3),
      b"MJPG" => Ok(PixelFormat::Mjpg),
      _ => Err(V4lInputError::UnsupportedPixelFormat(fourcc.to_string())),
    }
  }
}

// v4l:///dev/video0 或 v4l://localhost/dev/video0
pub(crate) fn device_path(url: &Url) -> String {
  if url.path().is_empty() || url.path() == "/" {
    DEFAULT_DEVICE.to_string()
  } else {
    url.path().to_string()
  }
}

pub struct V4lInput {
  device_path: String,
  device: Device,
  stream: Option<Stream<'static>>,
  width: u32,
  height: u32,
  pixel_format: PixelFormat,
  config: CameraConfig,
}

impl V4lInput {
  pub const SCHEME: &'static str = "v4l";

  pub fn open(url: &Url, config: &CameraConfig) -> Result<Self, V4lInputError> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(V4lInputError::SchemaMismatch);
    }

    let device_path = device_path(url);
    let device = Device::with_path(&device_path)?;

    // 按平台采集分辨率请求，驱动可能返回最接近的尺寸
    let mut format = device.format()?;
    format.width = config.texture_width;
    format.height = config.texture_height;
    format.fourcc = FourCC::new(b"MJPG");
    let format = device.set_format(&format)?;
    let pixel_format = PixelFormat::from_fourcc(&format.fourcc)?;

    if (format.width, format.height) != (config.texture_width, config.texture_height) {
      warn!(
        "摄像头不支持 {}x{}, 实际采集分辨率 {}x{}",
        config.texture_width, config.texture_height, format.width, format.height
      );
    }
    info!(
      "摄像头已打开: {} {}x{} {} ({:?})",
      device_path, format.width, format.height, format.fourcc, config.facing
    );

    Ok(V4lInput {
      device_path,
      device,
      stream: None,
      width: format.width,
      height: format.height,
      pixel_format,
      config: *config,
    })
  }

  fn decode(&self, buf: &[u8]) -> Result<RgbImage, V4lInputError> {
    match self.pixel_format {
      PixelFormat::Rgb3 => {
        let expected = (self.width * self.height * 3) as usize;
        if buf.len() < expected {
          return Err(V4lInputError::ShortBuffer {
            expected,
            actual: buf.len(),
          });
        }
        RgbImage::from_raw(self.width, self.height, buf[..expected].to_vec()).ok_or(
          V4lInputError::ShortBuffer {
            expected,
            actual: buf.len(),
          },
        )
      }
      PixelFormat::Mjpg => {
        Ok(image::load_from_memory_with_format(buf, ImageFormat::Jpeg)?.to_rgb8())
      }
    }
  }

  fn capture_frame(&mut self) -> Result<ImageTensor, V4lInputError> {
    let stream = match self.stream.as_mut() {
      Some(stream) => stream,
      None => {
        debug!("创建 V4L 采集流: {}", self.device_path);
        let stream = Stream::with_buffers(&self.device, Type::VideoCapture, STREAM_BUFFERS)?;
        self.stream.insert(stream)
      }
    };

    let (buf, meta) = stream.next()?;
    debug!("采集第 {} 帧, {} 字节", meta.sequence, buf.len());
    let buf = buf.to_vec();
    let image = self.decode(&buf)?;

    Ok(resize_to_tensor(&image, &self.config))
  }
}

impl FrameSource for V4lInput {
  fn next_tensor(&mut self) -> Option<ImageTensor> {
    match self.capture_frame() {
      Ok(tensor) => Some(tensor),
      Err(e) => {
        error!("Failed to capture frame: {}", e);
        None
      }
    }
  }

  fn restart(&mut self) -> Result<(), InputError> {
    self.stream = None;
    Ok(())
  }
}
