// 该文件是 Lanjing （览镜） 项目的一部分。
// src/input/read_image_file.rs - 图像文件/目录输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::{Path, PathBuf};

use image::ImageReader;
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  config::CameraConfig,
  frame::ImageTensor,
  input::{FrameSource, InputError, resize_to_tensor},
};

const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "bmp", "gif", "webp"];

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Image loading error: {0}")]
  ImageLoadError(#[from] image::ImageError),
  #[error("No image found in directory: {0}")]
  EmptyDirectory(String),
}

fn load_tensor(path: &Path, config: &CameraConfig) -> Result<ImageTensor, ImageFileInputError> {
  let image = ImageReader::open(path)?.decode()?.to_rgb8();
  debug!(
    "读取图像 {}: {}x{}",
    path.display(),
    image.width(),
    image.height()
  );
  Ok(resize_to_tensor(&image, config))
}

fn check_scheme(url: &Url, expected: &str) -> Result<(), ImageFileInputError> {
  if url.scheme() != expected {
    error!(
      "URI scheme mismatch: expected '{}', found '{}'",
      expected,
      url.scheme()
    );
    return Err(ImageFileInputError::SchemaMismatch);
  }
  Ok(())
}

/// 单张图片输入；带 `?repeat` 时无限重复同一帧
pub struct ImageFileInput {
  path: PathBuf,
  config: CameraConfig,
  repeat: bool,
  cached: Option<ImageTensor>,
  consumed: bool,
}

impl ImageFileInput {
  pub const SCHEME: &'static str = "image";

  pub fn open(url: &Url, config: &CameraConfig) -> Result<Self, ImageFileInputError> {
    check_scheme(url, Self::SCHEME)?;

    let path = PathBuf::from(url.path());
    if !path.is_file() {
      return Err(ImageFileInputError::IoError(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("{}", path.display()),
      )));
    }
    let repeat = url.query_pairs().any(|(k, _)| k == "repeat");

    Ok(ImageFileInput {
      path,
      config: *config,
      repeat,
      cached: None,
      consumed: false,
    })
  }
}

impl FrameSource for ImageFileInput {
  fn next_tensor(&mut self) -> Option<ImageTensor> {
    if self.consumed && !self.repeat {
      return None;
    }

    if self.cached.is_none() {
      match load_tensor(&self.path, &self.config) {
        Ok(tensor) => self.cached = Some(tensor),
        Err(e) => {
          error!("读取图像失败 {}: {}", self.path.display(), e);
          return None;
        }
      }
    }

    self.consumed = true;
    self.cached.clone()
  }

  fn restart(&mut self) -> Result<(), InputError> {
    self.consumed = false;
    Ok(())
  }
}

/// 按文件名顺序回放目录中的所有图片，播完即停
pub struct ImageDirectoryInput {
  files: Vec<PathBuf>,
  cursor: usize,
  config: CameraConfig,
}

impl ImageDirectoryInput {
  pub const SCHEME: &'static str = "folder";

  pub fn open(url: &Url, config: &CameraConfig) -> Result<Self, ImageFileInputError> {
    check_scheme(url, Self::SCHEME)?;

    let directory = PathBuf::from(url.path());
    let mut files = Vec::new();
    for entry in std::fs::read_dir(&directory)? {
      let path = entry?.path();
      let is_image = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false);
      if path.is_file() && is_image {
        files.push(path);
      }
    }
    files.sort();

    if files.is_empty() {
      return Err(ImageFileInputError::EmptyDirectory(
        directory.display().to_string(),
      ));
    }
    info!("图像目录 {} 共 {} 帧", directory.display(), files.len());

    Ok(ImageDirectoryInput {
      files,
      cursor: 0,
      config: *config,
    })
  }
}

impl FrameSource for ImageDirectoryInput {
  fn next_tensor(&mut self) -> Option<ImageTensor> {
    while let Some(path) = self.files.get(self.cursor) {
      self.cursor += 1;
      match load_tensor(path, &self.config) {
        Ok(tensor) => return Some(tensor),
        Err(e) => error!("跳过无法读取的图像 {}: {}", path.display(), e),
      }
    }
    None
  }

  fn restart(&mut self) -> Result<(), InputError> {
    self.cursor = 0;
    Ok(())
  }
}
