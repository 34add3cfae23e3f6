// 该文件是 Lanjing （览镜） 项目的一部分。
// src/model.rs - 检测模型
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{
  sync::{
    Arc, OnceLock,
    atomic::{AtomicBool, Ordering},
  },
  thread::{self, JoinHandle},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{FromUrl, frame::ImageTensor};

mod labels;
pub use self::labels::{COCO_CLASSES, coco_label};

mod replay;
pub use self::replay::{ReplayDetector, ReplayDetectorBuilder, ReplayError};

#[cfg(feature = "model_yolo26")]
mod yolo26;
#[cfg(feature = "model_yolo26")]
pub use self::yolo26::{Yolo26, Yolo26Builder, Yolo26Error};

/// 张量坐标系下的检测框（像素）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
  pub x: f32,
  pub y: f32,
  pub width: f32,
  pub height: f32,
}

impl BBox {
  pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
    Self {
      x,
      y,
      width,
      height,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
  pub class_label: String,
  #[serde(default)]
  pub score: f32,
  pub bbox: BBox,
}

/// 单次检测的取消令牌，检测器在开始推理前检查
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
  pub fn cancel(&self) {
    self.0.store(true, Ordering::Release);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::Acquire)
  }
}

pub trait Detector: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  fn detect(&self, tensor: &ImageTensor) -> Result<Vec<Detection>, Self::Error>;

  /// 令牌已取消时不做推理，返回 `Ok(None)`；需要排队的检测器应在拿到资源后再检查一次
  fn detect_cancellable(
    &self,
    tensor: &ImageTensor,
    cancel: &CancelToken,
  ) -> Result<Option<Vec<Detection>>, Self::Error> {
    if cancel.is_cancelled() {
      return Ok(None);
    }
    self.detect(tensor).map(Some)
  }
}

impl<D: Detector + ?Sized> Detector for Arc<D> {
  type Error = D::Error;

  fn detect(&self, tensor: &ImageTensor) -> Result<Vec<Detection>, Self::Error> {
    (**self).detect(tensor)
  }

  fn detect_cancellable(
    &self,
    tensor: &ImageTensor,
    cancel: &CancelToken,
  ) -> Result<Option<Vec<Detection>>, Self::Error> {
    (**self).detect_cancellable(tensor, cancel)
  }
}

/// 两阶段加载：先 `ready` 准备运行环境，再 `load` 得到检测器
pub trait DetectorLoader {
  type Detector: Detector;
  type Error: std::error::Error + Send + Sync + 'static;

  fn ready(&self) -> Result<(), Self::Error>;
  fn load(self) -> Result<Self::Detector, Self::Error>;
}

/// 模型槽位，仅有“未加载 → 就绪”一次状态转换
pub struct ModelSlot<D> {
  inner: Arc<OnceLock<Arc<D>>>,
}

impl<D> Clone for ModelSlot<D> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<D> Default for ModelSlot<D> {
  fn default() -> Self {
    Self {
      inner: Arc::new(OnceLock::new()),
    }
  }
}

impl<D: Detector + 'static> ModelSlot<D> {
  pub fn empty() -> Self {
    Self::default()
  }

  pub fn ready(detector: D) -> Self {
    let slot = Self::default();
    slot.install(detector);
    slot
  }

  pub fn get(&self) -> Option<Arc<D>> {
    self.inner.get().cloned()
  }

  pub fn is_ready(&self) -> bool {
    self.inner.get().is_some()
  }

  /// 重复安装会被忽略，返回 false
  pub fn install(&self, detector: D) -> bool {
    self.inner.set(Arc::new(detector)).is_ok()
  }

  /// 同步执行两阶段加载；任何一步失败槽位都保持为空，不重试
  pub fn load_with<L>(&self, loader: L) -> Result<(), L::Error>
  where
    L: DetectorLoader<Detector = D>,
  {
    loader.ready()?;
    let detector = loader.load()?;
    if !self.install(detector) {
      info!("模型已加载，忽略重复加载");
    }
    Ok(())
  }

  /// 在后台线程加载模型，检测循环不必等待
  pub fn load_in_background<L>(&self, loader: L) -> std::io::Result<JoinHandle<()>>
  where
    L: DetectorLoader<Detector = D> + Send + 'static,
  {
    let slot = self.clone();
    thread::Builder::new()
      .name("model-loader".to_string())
      .spawn(move || {
        let now = std::time::Instant::now();
        match slot.load_with(loader) {
          Ok(()) => info!("模型加载完成，耗时: {:.2?}", now.elapsed()),
          Err(e) => error!("模型加载失败，检测将保持停用: {}", e),
        }
      })
  }
}

#[derive(Error, Debug)]
pub enum ModelError {
  #[cfg(feature = "model_yolo26")]
  #[error("YOLO26 错误: {0}")]
  Yolo26Error(#[from] Yolo26Error),
  #[error("回放检测器错误: {0}")]
  ReplayError(#[from] ReplayError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 由 URL 选择的模型加载器
pub enum DetectorSource {
  #[cfg(feature = "model_yolo26")]
  Yolo26(Yolo26Builder),
  Replay(ReplayDetectorBuilder),
}

impl FromUrl for DetectorSource {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    use crate::FromUrlWithScheme;

    match url.scheme() {
      #[cfg(feature = "model_yolo26")]
      Yolo26Builder::SCHEME => Ok(DetectorSource::Yolo26(Yolo26Builder::from_url(url)?)),
      ReplayDetectorBuilder::SCHEME => Ok(DetectorSource::Replay(
        ReplayDetectorBuilder::from_url(url)?,
      )),
      scheme => Err(ModelError::SchemeMismatch(scheme.to_string())),
    }
  }
}

pub enum DetectorWrapper {
  #[cfg(feature = "model_yolo26")]
  Yolo26(Yolo26),
  Replay(ReplayDetector),
}

impl DetectorLoader for DetectorSource {
  type Detector = DetectorWrapper;
  type Error = ModelError;

  fn ready(&self) -> Result<(), Self::Error> {
    match self {
      #[cfg(feature = "model_yolo26")]
      DetectorSource::Yolo26(builder) => builder.ready().map_err(ModelError::from),
      DetectorSource::Replay(builder) => builder.ready().map_err(ModelError::from),
    }
  }

  fn load(self) -> Result<Self::Detector, Self::Error> {
    match self {
      #[cfg(feature = "model_yolo26")]
      DetectorSource::Yolo26(builder) => Ok(DetectorWrapper::Yolo26(builder.load()?)),
      DetectorSource::Replay(builder) => Ok(DetectorWrapper::Replay(builder.load()?)),
    }
  }
}

impl Detector for DetectorWrapper {
  type Error = ModelError;

  fn detect(&self, tensor: &ImageTensor) -> Result<Vec<Detection>, Self::Error> {
    match self {
      #[cfg(feature = "model_yolo26")]
      DetectorWrapper::Yolo26(model) => model.detect(tensor).map_err(ModelError::from),
      DetectorWrapper::Replay(model) => model.detect(tensor).map_err(ModelError::from),
    }
  }

  fn detect_cancellable(
    &self,
    tensor: &ImageTensor,
    cancel: &CancelToken,
  ) -> Result<Option<Vec<Detection>>, Self::Error> {
    match self {
      #[cfg(feature = "model_yolo26")]
      DetectorWrapper::Yolo26(model) => model
        .detect_cancellable(tensor, cancel)
        .map_err(ModelError::from),
      DetectorWrapper::Replay(model) => model
        .detect_cancellable(tensor, cancel)
        .map_err(ModelError::from),
    }
  }
}
