// 该文件是 Lanjing （览镜） 项目的一部分。
// src/model/replay.rs - 回放已记录的检测结果
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{path::PathBuf, sync::Mutex, time::Duration};

use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::ImageTensor,
  model::{CancelToken, Detection, Detector, DetectorLoader},
};

#[derive(Error, Debug)]
pub enum ReplayError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("第 {line} 行解析失败: {source}")]
  ParseError {
    line: usize,
    source: serde_json::Error,
  },
  #[error("记录文件为空: {0}")]
  EmptyRecording(String),
  #[error("延迟参数无效: {0}")]
  InvalidDelay(String),
  #[error("回放游标锁已损坏")]
  Poisoned,
}

pub struct ReplayDetectorBuilder {
  path: PathBuf,
  delay: Duration,
}

impl FromUrlWithScheme for ReplayDetectorBuilder {
  const SCHEME: &'static str = "replay";
}

impl FromUrl for ReplayDetectorBuilder {
  type Error = ReplayError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ReplayError::SchemeMismatch(url.scheme().to_string()));
    }

    let mut delay = Duration::ZERO;
    for (k, v) in url.query_pairs() {
      if k == "delay_ms" {
        let ms: u64 = v.parse().map_err(|_| ReplayError::InvalidDelay(v.to_string()))?;
        delay = Duration::from_millis(ms);
      }
    }

    Ok(ReplayDetectorBuilder {
      path: PathBuf::from(url.path()),
      delay,
    })
  }
}

impl DetectorLoader for ReplayDetectorBuilder {
  type Detector = ReplayDetector;
  type Error = ReplayError;

  fn ready(&self) -> Result<(), Self::Error> {
    std::fs::metadata(&self.path)?;
    Ok(())
  }

  fn load(self) -> Result<Self::Detector, Self::Error> {
    let content = std::fs::read_to_string(&self.path)?;
    let frames = parse_recording(&content)?;
    if frames.is_empty() {
      return Err(ReplayError::EmptyRecording(self.path.display().to_string()));
    }
    info!("回放记录 {} 共 {} 帧", self.path.display(), frames.len());

    Ok(ReplayDetector {
      frames,
      cursor: Mutex::new(0),
      delay: self.delay,
    })
  }
}

/// 每行一帧的检测结果 JSON 数组，空行表示该帧没有目标
fn parse_recording(content: &str) -> Result<Vec<Vec<Detection>>, ReplayError> {
  content
    .lines()
    .enumerate()
    .map(|(index, line)| {
      let line = line.trim();
      if line.is_empty() {
        return Ok(Vec::new());
      }
      serde_json::from_str(line).map_err(|source| ReplayError::ParseError {
        line: index + 1,
        source,
      })
    })
    .collect()
}

/// 按顺序循环返回记录的检测结果，可模拟推理耗时
pub struct ReplayDetector {
  frames: Vec<Vec<Detection>>,
  cursor: Mutex<usize>,
  delay: Duration,
}

impl ReplayDetector {
  pub fn new(frames: Vec<Vec<Detection>>) -> Self {
    Self {
      frames,
      cursor: Mutex::new(0),
      delay: Duration::ZERO,
    }
  }

  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }
}

impl Detector for ReplayDetector {
  type Error = ReplayError;

  fn detect(&self, tensor: &ImageTensor) -> Result<Vec<Detection>, Self::Error> {
    let detections = self.detect_cancellable(tensor, &CancelToken::default())?;
    Ok(detections.unwrap_or_default())
  }

  /// 被取消的调用不消耗记录
  fn detect_cancellable(
    &self,
    tensor: &ImageTensor,
    cancel: &CancelToken,
  ) -> Result<Option<Vec<Detection>>, Self::Error> {
    if cancel.is_cancelled() {
      return Ok(None);
    }
    if self.frames.is_empty() {
      return Ok(Some(Vec::new()));
    }

    if !self.delay.is_zero() {
      std::thread::sleep(self.delay);
      if cancel.is_cancelled() {
        debug!("回放检测已取消");
        return Ok(None);
      }
    }

    let index = {
      let mut cursor = self.cursor.lock().map_err(|_| ReplayError::Poisoned)?;
      let index = *cursor;
      *cursor = (index + 1) % self.frames.len();
      index
    };

    debug!(
      "回放第 {} 帧记录, 张量 {}x{}",
      index,
      tensor.height(),
      tensor.width()
    );
    Ok(Some(self.frames[index].clone()))
  }
}
