// 该文件是 Lanjing （览镜） 项目的一部分。
// src/bin/oneshot_overlay.rs - 单张图像检测叠加层
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use lanjing::{
  FromUrl,
  config::{CameraFacing, Platform, PlatformProfile, ViewportSize},
  input::{FrameSource, InputWrapper},
  mapper::CoordinateMapper,
  model::{DetectorSource, Detector, ModelSlot},
  output::{OutputWrapper, OverlaySurface, load_font},
};

/// Lanjing 单张叠加层参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型来源，yolo26:// 或 replay://
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,

  #[arg(long, value_enum, default_value_t = Platform::Android)]
  pub platform: Platform,

  #[arg(long, value_enum, default_value_t = CameraFacing::Back)]
  pub facing: CameraFacing,

  #[arg(long, value_name = "WIDTHxHEIGHT", default_value = "390x844")]
  pub viewport: ViewportSize,

  #[arg(long, value_name = "FONT")]
  pub font: Option<PathBuf>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型来源: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let profile = PlatformProfile::resolve(args.platform);
  let mut input = InputWrapper::open(&args.input, &profile.camera_config(args.facing))?;

  let slot = ModelSlot::empty();
  slot.load_with(DetectorSource::from_url(&args.model)?)?;
  let model = slot.get().ok_or_else(|| anyhow!("模型未加载"))?;

  let tensor = input
    .next_tensor()
    .ok_or_else(|| anyhow!("输入没有可用图像: {}", args.input))?;

  info!("开始推理...");
  let now = std::time::Instant::now();
  let detections = model.detect(&tensor)?;
  info!("推理完成，耗时: {:.2?}", now.elapsed());
  for detection in &detections {
    info!(
      "{} ({:.2}): {:?}",
      detection.class_label, detection.score, detection.bbox
    );
  }

  let mut output = OutputWrapper::from_url(&args.output)?;
  if let Some(font) = args.font.as_deref() {
    output = output.with_font(load_font(font)?);
  }
  output.attach(args.viewport);

  let mapper = CoordinateMapper::new(args.viewport, profile.flip_horizontal);
  if !mapper.paint(&mut output, &detections, tensor.shape()) {
    warn!("叠加层未初始化，没有绘制");
  }
  output.present()?;

  Ok(())
}
