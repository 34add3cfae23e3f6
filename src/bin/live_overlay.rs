// 该文件是 Lanjing （览镜） 项目的一部分。
// src/bin/live_overlay.rs - 实时摄像头检测叠加层
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use lanjing::{
  FromUrl,
  config::{
    CameraFacing, DEFAULT_FPS, Platform, PlatformProfile, ViewportSize, parse_frame_rate,
  },
  input::{CameraPermission, InputWrapper},
  mapper::CoordinateMapper,
  model::{DetectorSource, DetectorWrapper, ModelSlot},
  output::{OutputWrapper, OverlaySurface, load_font},
  task::{AnimationFrames, DetectionLoop, PaintOrdering, install_interrupt_handler},
};

/// Lanjing 实时叠加层参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型来源，yolo26:// 或 replay://
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源，v4l:// / image:// / folder://
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 叠加层输出，image:// / folder:// / record://
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,

  #[arg(long, value_enum, default_value_t = Platform::Android)]
  pub platform: Platform,

  #[arg(long, value_enum, default_value_t = CameraFacing::Back)]
  pub facing: CameraFacing,

  /// 显示区域尺寸，格式 WIDTHxHEIGHT
  #[arg(long, value_name = "WIDTHxHEIGHT", default_value = "390x844")]
  pub viewport: ViewportSize,

  #[arg(long, value_parser = parse_frame_rate, default_value_t = DEFAULT_FPS)]
  pub fps: f64,

  /// 0 表示不限制
  #[arg(long, value_name = "FRAME_NUMBER", default_value_t = 0)]
  pub frame_number: u64,

  #[arg(long, value_enum, default_value_t = PaintOrdering::DropStale)]
  pub ordering: PaintOrdering,

  /// 标签文字使用的 TTF 字体
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
  let camera = profile.camera_config(args.facing);
  info!(
    "平台: {:?}, 采集尺寸: {}x{}, 水平翻转: {}",
    args.platform,
    camera.texture_width,
    camera.texture_height,
    profile.flip_horizontal
  );

  let input = match CameraPermission::request(&args.input) {
    CameraPermission::Granted => Some(InputWrapper::open(&args.input, &camera)?),
    CameraPermission::Denied => {
      warn!("未获得摄像头权限，检测循环将没有输入帧");
      None
    }
  };

  let model = ModelSlot::<DetectorWrapper>::empty();
  model.load_in_background(DetectorSource::from_url(&args.model)?)?;

  let mut output = OutputWrapper::from_url(&args.output)?;
  if let Some(font) = args.font.as_deref() {
    output = output.with_font(load_font(font)?);
  }
  output.attach(args.viewport);
  info!("叠加层尺寸: {}", args.viewport);

  let mapper = CoordinateMapper::new(args.viewport, profile.flip_horizontal);
  let frames = AnimationFrames::with_fps(args.fps)
    .with_frame_limit((args.frame_number > 0).then_some(args.frame_number));
  let stop = install_interrupt_handler()?;

  DetectionLoop::new(input, model, output, mapper)
    .with_ordering(args.ordering)
    .run(frames, stop);

  Ok(())
}
