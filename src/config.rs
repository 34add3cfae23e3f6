// 该文件是 Lanjing （览镜） 项目的一部分。
// src/config.rs - 平台配置
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

use std::{str::FromStr, time::Duration};

use thiserror::Error;

const IOS_TEXTURE: CaptureConfig = CaptureConfig {
  texture_height: 1920,
  texture_width: 1080,
};
const DEFAULT_TEXTURE: CaptureConfig = CaptureConfig {
  texture_height: 1200,
  texture_width: 1600,
};

const RESIZE_HEIGHT: u32 = 200;
const RESIZE_WIDTH: u32 = 152;
const RESIZE_DEPTH: u32 = 3;

pub const DEFAULT_FPS: f64 = 30.0;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
  #[error("视口尺寸格式错误，应为 WIDTHxHEIGHT: {0}")]
  InvalidViewport(String),
  #[error("视口尺寸不能为零: {0}")]
  EmptyViewport(String),
  #[error("帧率必须是正的有限数: {0}")]
  InvalidFrameRate(String),
}

/// 运行平台
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Platform {
  Ios,
  #[default]
  Android,
  Desktop,
}

/// 摄像头采集分辨率
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
  pub texture_height: u32,
  pub texture_width: u32,
}

/// 摄像头朝向
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CameraFacing {
  Front,
  #[default]
  Back,
}

/// 帧源参数，采集分辨率与送入模型的缩放尺寸
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraConfig {
  pub texture_height: u32,
  pub texture_width: u32,
  pub resize_height: u32,
  pub resize_width: u32,
  pub resize_depth: u32,
  pub facing: CameraFacing,
}

/// 启动时确定一次的平台配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformProfile {
  pub capture: CaptureConfig,
  /// 非 iOS 平台的预览是镜像的，需要水平翻转检测框
  pub flip_horizontal: bool,
}

impl PlatformProfile {
  pub fn resolve(platform: Platform) -> Self {
    match platform {
      Platform::Ios => PlatformProfile {
        capture: IOS_TEXTURE,
        flip_horizontal: false,
      },
      Platform::Android | Platform::Desktop => PlatformProfile {
        capture: DEFAULT_TEXTURE,
        flip_horizontal: true,
      },
    }
  }

  pub fn camera_config(&self, facing: CameraFacing) -> CameraConfig {
    CameraConfig {
      texture_height: self.capture.texture_height,
      texture_width: self.capture.texture_width,
      resize_height: RESIZE_HEIGHT,
      resize_width: RESIZE_WIDTH,
      resize_depth: RESIZE_DEPTH,
      facing,
    }
  }
}

/// 显示区域尺寸，启动时读取一次
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportSize {
  pub width: f32,
  pub height: f32,
}

impl ViewportSize {
  pub fn new(width: f32, height: f32) -> Self {
    Self { width, height }
  }
}

impl FromStr for ViewportSize {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (w, h) = s
      .split_once(['x', 'X'])
      .ok_or_else(|| ConfigError::InvalidViewport(s.to_string()))?;
    let width: u32 = w
      .trim()
      .parse()
      .map_err(|_| ConfigError::InvalidViewport(s.to_string()))?;
    let height: u32 = h
      .trim()
      .parse()
      .map_err(|_| ConfigError::InvalidViewport(s.to_string()))?;
    if width == 0 || height == 0 {
      return Err(ConfigError::EmptyViewport(s.to_string()));
    }
    Ok(ViewportSize::new(width as f32, height as f32))
  }
}

/// 帧率对应的帧间隔；帧率非法或间隔无法表示（为零或溢出）时返回 None
pub fn frame_interval(fps: f64) -> Option<Duration> {
  if !fps.is_finite() || fps <= 0.0 {
    return None;
  }
  Duration::try_from_secs_f64(1.0 / fps)
    .ok()
    .filter(|interval| !interval.is_zero())
}

/// `--fps` 参数解析
pub fn parse_frame_rate(s: &str) -> Result<f64, ConfigError> {
  let fps: f64 = s
    .trim()
    .parse()
    .map_err(|_| ConfigError::InvalidFrameRate(s.to_string()))?;
  match frame_interval(fps) {
    Some(_) => Ok(fps),
    None => Err(ConfigError::InvalidFrameRate(s.to_string())),
  }
}

impl std::fmt::Display for ViewportSize {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}x{}", self.width, self.height)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn frame_rate_must_be_positive_and_finite() {
    assert_eq!(parse_frame_rate("30"), Ok(30.0));
    assert_eq!(parse_frame_rate(" 12.5 "), Ok(12.5));
    for bad in ["0", "-5", "nan", "inf", "1e-300", "1e300", "fast"] {
      assert_eq!(
        parse_frame_rate(bad),
        Err(ConfigError::InvalidFrameRate(bad.to_string()))
      );
    }
  }

  #[test]
  fn frame_interval_matches_rate() {
    assert_eq!(frame_interval(4.0), Some(Duration::from_millis(250)));
    assert_eq!(frame_interval(0.0), None);
    assert_eq!(frame_interval(f64::NEG_INFINITY), None);
  }

  #[test]
  fn ios_uses_portrait_texture_without_flip() {
    let profile = PlatformProfile::resolve(Platform::Ios);
    assert_eq!(
      (profile.capture.texture_height, profile.capture.texture_width),
      (1920, 1080)
    );
    assert!(!profile.flip_horizontal);
  }

  #[test]
  fn other_platforms_use_landscape_texture_with_flip() {
    for platform in [Platform::Android, Platform::Desktop] {
      let profile = PlatformProfile::resolve(platform);
      assert_eq!(
        (profile.capture.texture_height, profile.capture.texture_width),
        (1200, 1600)
      );
      assert!(profile.flip_horizontal);
    }
  }

  #[test]
  fn camera_config_carries_resize_target() {
    let config = PlatformProfile::resolve(Platform::Ios).camera_config(CameraFacing::Back);
    assert_eq!(config.texture_height, 1920);
    assert_eq!(
      (config.resize_height, config.resize_width, config.resize_depth),
      (200, 152, 3)
    );
    assert_eq!(config.facing, CameraFacing::Back);
  }

  #[test]
  fn viewport_parses_width_by_height() {
    let viewport: ViewportSize = "390x844".parse().unwrap();
    assert_eq!(viewport, ViewportSize::new(390.0, 844.0));
    assert_eq!(viewport.to_string(), "390x844");
  }

  #[test]
  fn viewport_rejects_garbage() {
    assert!(matches!(
      "390".parse::<ViewportSize>(),
      Err(ConfigError::InvalidViewport(_))
    ));
    assert!(matches!(
      "0x844".parse::<ViewportSize>(),
      Err(ConfigError::EmptyViewport(_))
    ));
  }
}
