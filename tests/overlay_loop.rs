// 该文件是 Lanjing （览镜） 项目的一部分。
// tests/overlay_loop.rs - 帧源、模型、叠加层串联测试
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

#![cfg(feature = "read_image_file")]

use std::{path::PathBuf, sync::mpsc};

use image::{Rgb, RgbImage};
use tempfile::TempDir;
use url::Url;

use lanjing::{
  FromUrl,
  config::{CameraFacing, Platform, PlatformProfile, ViewportSize},
  input::InputWrapper,
  mapper::CoordinateMapper,
  model::{DetectorSource, DetectorWrapper, ModelSlot},
  output::{CommandRecordOutput, DrawCommand, OutputWrapper, OverlaySurface},
  task::{AnimationFrames, DetectionLoop, LoopError},
};

const RECORDING: &str =
  r#"[{"class_label":"cup","score":0.9,"bbox":{"x":10,"y":20,"width":30,"height":40}}]"#;

fn workspace() -> TempDir {
  let dir = tempfile::tempdir().unwrap();
  std::fs::create_dir_all(dir.path().join("frames")).unwrap();
  for i in 0..3u8 {
    RgbImage::from_pixel(160, 120, Rgb([i * 40, 0, 0]))
      .save(dir.path().join("frames").join(format!("{:03}.png", i)))
      .unwrap();
  }
  std::fs::write(dir.path().join("recording.jsonl"), RECORDING).unwrap();
  dir
}

fn url(scheme: &str, path: PathBuf) -> Url {
  Url::parse(&format!("{}://{}", scheme, path.display())).unwrap()
}

fn source(dir: &std::path::Path) -> DetectorSource {
  DetectorSource::from_url(&url("replay", dir.join("recording.jsonl"))).unwrap()
}

fn camera() -> (PlatformProfile, lanjing::config::CameraConfig) {
  let profile = PlatformProfile::resolve(Platform::Android);
  (profile, profile.camera_config(CameraFacing::Back))
}

#[test]
fn folder_frames_are_detected_and_painted_mirrored() {
  let tmp = workspace();
  let dir = tmp.path();
  let (profile, camera) = camera();
  let input = InputWrapper::open(&url("folder", dir.join("frames")), &camera).unwrap();

  let model = ModelSlot::<DetectorWrapper>::empty();
  model.load_with(source(dir)).unwrap();

  // 视口与张量同尺寸，缩放为 1
  let viewport = ViewportSize::new(152.0, 200.0);
  let mut surface = CommandRecordOutput::in_memory();
  surface.attach(viewport);
  let mapper = CoordinateMapper::new(viewport, profile.flip_horizontal);

  let (_tx, rx) = mpsc::channel();
  let stats = DetectionLoop::new(input, model, surface, mapper).run(
    AnimationFrames::with_fps(200.0).with_frame_limit(Some(5)),
    rx,
  );

  assert_eq!(stats.ticks, 5);
  assert_eq!(stats.dispatched, 3);
  assert_eq!(stats.missing, 2);
  assert_eq!(stats.rejected, 0);
  assert_eq!(
    stats.painted + stats.cancelled + stats.dropped_stale,
    stats.dispatched
  );
  assert!(stats.painted >= 1);
}

#[test]
fn painted_commands_follow_mapping() {
  let tmp = workspace();
  let dir = tmp.path();
  let (profile, camera) = camera();
  let input = InputWrapper::open(&url("image", dir.join("frames/000.png")), &camera).unwrap();

  let model = ModelSlot::<DetectorWrapper>::empty();
  model.load_with(source(dir)).unwrap();

  let viewport = ViewportSize::new(152.0, 200.0);
  let mut surface = CommandRecordOutput::in_memory();
  surface.attach(viewport);
  let mut lp = DetectionLoop::new(
    input,
    model,
    surface,
    CoordinateMapper::new(viewport, profile.flip_horizontal),
  );

  lp.tick().unwrap();
  lp.settle();
  assert!(matches!(lp.tick(), Err(LoopError::MissingModelOrFrame)));

  let frame = &lp.surface().frames()[0];
  let strokes: Vec<&DrawCommand> = frame
    .iter()
    .filter(|c| {
      matches!(
        c,
        DrawCommand::ClearRect { .. }
          | DrawCommand::StrokeRect { .. }
          | DrawCommand::StrokeText { .. }
      )
    })
    .collect();
  assert_eq!(
    strokes,
    vec![
      &DrawCommand::ClearRect {
        x: 0.0,
        y: 0.0,
        width: 152.0,
        height: 200.0
      },
      &DrawCommand::StrokeRect {
        x: 112.0,
        y: 20.0,
        width: 30.0,
        height: 40.0
      },
      &DrawCommand::StrokeText {
        text: "cup".to_string(),
        x: 107.0,
        y: 15.0
      },
    ]
  );
}

#[test]
fn background_load_enables_detection() {
  let tmp = workspace();
  let dir = tmp.path();
  let (profile, camera) = camera();
  let input = InputWrapper::open(&url("folder", dir.join("frames")), &camera).unwrap();

  let model = ModelSlot::<DetectorWrapper>::empty();
  let viewport = ViewportSize::new(152.0, 200.0);
  let mut surface = CommandRecordOutput::in_memory();
  surface.attach(viewport);
  let mut lp = DetectionLoop::new(
    input,
    model.clone(),
    surface,
    CoordinateMapper::new(viewport, profile.flip_horizontal),
  );

  assert!(matches!(lp.tick(), Err(LoopError::MissingModelOrFrame)));

  model
    .load_in_background(source(dir))
    .unwrap()
    .join()
    .unwrap();
  assert!(model.is_ready());

  lp.tick().unwrap();
  lp.settle();
  assert_eq!(lp.stats().painted, 1);
}

#[test]
fn failed_load_leaves_model_empty() {
  let tmp = workspace();
  let dir = tmp.path();
  std::fs::write(dir.join("recording.jsonl"), "not json").unwrap();

  let model = ModelSlot::<DetectorWrapper>::empty();
  assert!(model.load_with(source(dir)).is_err());
  assert!(!model.is_ready());
}

#[test]
fn image_output_saves_painted_overlay() {
  let tmp = workspace();
  let dir = tmp.path();
  let target = dir.join("out/overlay.png");
  let mut output = OutputWrapper::from_url(&url("image", target.clone())).unwrap();

  let viewport = ViewportSize::new(152.0, 200.0);
  output.attach(viewport);
  let mapper = CoordinateMapper::new(viewport, false);
  let detections = vec![lanjing::model::Detection {
    class_label: "cup".to_string(),
    score: 0.9,
    bbox: lanjing::model::BBox::new(10.0, 20.0, 30.0, 40.0),
  }];
  assert!(mapper.paint(
    &mut output,
    &detections,
    lanjing::frame::TensorShape::new(200, 152, 3)
  ));
  output.present().unwrap();

  let saved = image::open(&target).unwrap().to_rgba8();
  assert_eq!(saved.dimensions(), (152, 200));
  assert_eq!(saved.get_pixel(10, 20).0, [255, 0, 0, 255]);
  assert_eq!(saved.get_pixel(100, 150).0[3], 0);
}
