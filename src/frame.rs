// 该文件是 Lanjing （览镜） 项目的一部分。
// src/frame.rs - NHWC 图像张量定义
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

use image::{ImageBuffer, Rgb, RgbImage};
use thiserror::Error;

const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TensorError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  LengthMismatch { expected: usize, actual: usize },
  #[error("张量形状无效: {0:?}")]
  InvalidShape(TensorShape),
}

/// 张量形状，按 (height, width, channels) 顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorShape {
  pub height: usize,
  pub width: usize,
  pub channels: usize,
}

impl TensorShape {
  pub fn new(height: usize, width: usize, channels: usize) -> Self {
    Self {
      height,
      width,
      channels,
    }
  }

  pub fn len(&self) -> usize {
    self.height * self.width * self.channels
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// 帧源产生的 NHWC u8 张量，只交给检测器消费一次
#[derive(Debug, Clone)]
pub struct ImageTensor {
  data: Box<[u8]>,
  shape: TensorShape,
}

impl ImageTensor {
  pub fn from_vec(data: Vec<u8>, shape: TensorShape) -> Result<Self, TensorError> {
    if shape.is_empty() {
      return Err(TensorError::InvalidShape(shape));
    }
    if data.len() != shape.len() {
      return Err(TensorError::LengthMismatch {
        expected: shape.len(),
        actual: data.len(),
      });
    }

    Ok(Self {
      data: data.into_boxed_slice(),
      shape,
    })
  }

  pub fn zeros(shape: TensorShape) -> Self {
    Self {
      data: vec![0u8; shape.len()].into_boxed_slice(),
      shape,
    }
  }

  pub fn shape(&self) -> TensorShape {
    self.shape
  }

  pub fn height(&self) -> usize {
    self.shape.height
  }

  pub fn width(&self) -> usize {
    self.shape.width
  }

  pub fn channels(&self) -> usize {
    self.shape.channels
  }

  pub fn as_nhwc(&self) -> &[u8] {
    &self.data
  }

  /// 仅支持三通道张量，其他通道数返回 None
  pub fn to_rgb_image(&self) -> Option<RgbImage> {
    if self.channels() != RGB_CHANNELS {
      return None;
    }
    let width = self.width() as u32;
    let height = self.height() as u32;
    let data = &self.data;

    Some(ImageBuffer::from_fn(width, height, |x, y| {
      let idx = (y as usize * width as usize + x as usize) * RGB_CHANNELS;
      Rgb([data[idx], data[idx + 1], data[idx + 2]])
    }))
  }
}

impl From<RgbImage> for ImageTensor {
  fn from(image: RgbImage) -> Self {
    let (width, height) = image.dimensions();
    let shape = TensorShape::new(height as usize, width as usize, RGB_CHANNELS);
    // RgbImage 的内存布局本身就是 NHWC
    Self {
      data: image.into_raw().into_boxed_slice(),
      shape,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn from_vec_checks_length() {
    let err = ImageTensor::from_vec(vec![0; 5], TensorShape::new(2, 2, 3)).unwrap_err();
    assert_eq!(
      err,
      TensorError::LengthMismatch {
        expected: 12,
        actual: 5
      }
    );
  }

  #[test]
  fn from_vec_rejects_empty_shape() {
    let err = ImageTensor::from_vec(vec![], TensorShape::new(0, 4, 3)).unwrap_err();
    assert!(matches!(err, TensorError::InvalidShape(_)));
  }

  #[test]
  fn rgb_image_keeps_height_first_shape() {
    let image = RgbImage::from_pixel(4, 2, Rgb([1, 2, 3]));
    let tensor = ImageTensor::from(image);
    assert_eq!(tensor.shape(), TensorShape::new(2, 4, 3));
    assert_eq!(&tensor.as_nhwc()[..3], &[1, 2, 3]);

    let back = tensor.to_rgb_image().unwrap();
    assert_eq!(back.dimensions(), (4, 2));
    assert_eq!(back.get_pixel(3, 1), &Rgb([1, 2, 3]));
  }
}
