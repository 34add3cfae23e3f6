// 该文件是 Lanjing （览镜） 项目的一部分。
// src/model/yolo26.rs - YOLO26 RKNPU 检测器
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{path::PathBuf, sync::Mutex};

use image::imageops::FilterType;
use rknpu::{Context, InitFlags, TensorType};
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::ImageTensor,
  model::{BBox, CancelToken, Detection, Detector, DetectorLoader, coco_label},
};

const YOLO26_NUM_INPUTS: u32 = 1;
const YOLO26_NUM_OUTPUTS: u32 = 6;
const YOLO26_CLASS_NUM: usize = 80;
const YOLO26_INPUT_W: f32 = 640.0;
const YOLO26_INPUT_H: f32 = 640.0;
const YOLO26_HEAD_SIZES: [(usize, usize); 3] = [(80, 80), (40, 40), (20, 20)];
const YOLO26_STRIDES: [f32; 3] = [8.0, 16.0, 32.0];
const YOLO26_OBJECT_THRESH: f32 = 0.5;

#[derive(Error, Debug)]
pub enum Yolo26Error {
  #[error("模型加载错误: {0}")]
  ModelLoadError(#[from] std::io::Error),
  #[error("模型无效: {0}, 错误: {1}")]
  ModelInvalid(String, rknpu::Error),
  #[error("RKNN 错误: {0}")]
  RknnError(#[from] rknpu::Error),
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
  #[error("输入张量无法转换为 RGB 图像")]
  UnsupportedTensor,
  #[error("推理上下文锁已损坏")]
  Poisoned,
}

impl Yolo26Error {
  pub fn invalid(msg: &str, e: rknpu::Error) -> Self {
    Yolo26Error::ModelInvalid(msg.to_string(), e)
  }
}

pub struct Yolo26Builder {
  model_path: PathBuf,
  flags: InitFlags,
}

impl FromUrlWithScheme for Yolo26Builder {
  const SCHEME: &'static str = "yolo26";
}

impl FromUrl for Yolo26Builder {
  type Error = Yolo26Error;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(Yolo26Error::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    Ok(Yolo26Builder {
      model_path: PathBuf::from(url.path()),
      flags: InitFlags::default(),
    })
  }
}

impl Yolo26Builder {
  pub fn flags(mut self, flags: InitFlags) -> Self {
    self.flags = flags;
    self
  }
}

impl DetectorLoader for Yolo26Builder {
  type Detector = Yolo26;
  type Error = Yolo26Error;

  fn ready(&self) -> Result<(), Self::Error> {
    if !self.model_path.is_file() {
      error!("模型文件不存在: {}", self.model_path.display());
      return Err(Yolo26Error::ModelPathError(
        self.model_path.display().to_string(),
      ));
    }
    Ok(())
  }

  fn load(self) -> Result<Self::Detector, Self::Error> {
    info!("加载模型文件: {}", self.model_path.display());
    let mode_data = std::fs::read(&self.model_path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      mode_data.len() as f64 / (1024.0 * 1024.0)
    );

    info!("创建 RKNN 推理上下文");
    let context = Context::new(&mode_data, self.flags)?;

    match context.sdk_version() {
      Ok(version) => {
        if let Ok(api_ver) = version.api_version() {
          debug!("模型 API 版本: {}", api_ver);
        }
        if let Ok(drv_ver) = version.driver_version() {
          debug!("模型驱动版本: {}", drv_ver);
        }
      }
      Err(e) => {
        error!(" 查询 SDK 版本失败: {}", e);
        return Err(Yolo26Error::invalid("无法查询 SDK 版本", e));
      }
    }

    let num_inputs = context
      .num_inputs()
      .map_err(|e| Yolo26Error::invalid("无法获取输入数量", e))?;
    let num_outputs = context
      .num_outputs()
      .map_err(|e| Yolo26Error::invalid("无法获取输出数量", e))?;

    if num_inputs != YOLO26_NUM_INPUTS || num_outputs != YOLO26_NUM_OUTPUTS {
      let msg = format!(
        "预期模型输入/输出数量为 {}/{}, 实际为 {}/{}",
        YOLO26_NUM_INPUTS, YOLO26_NUM_OUTPUTS, num_inputs, num_outputs
      );
      error!("{}", msg);
      return Err(Yolo26Error::invalid(&msg, rknpu::Error::InvalidModel));
    }

    info!("模型加载完成");
    Ok(Yolo26 {
      context: Mutex::new(context),
    })
  }
}

/// 单个 RKNN 上下文不能并发推理，重叠的检测请求在锁上排队
pub struct Yolo26 {
  context: Mutex<Context>,
}

impl Yolo26 {
  fn prepare_input(tensor: &ImageTensor) -> Result<Vec<u8>, Yolo26Error> {
    let (w, h) = (YOLO26_INPUT_W as usize, YOLO26_INPUT_H as usize);
    if tensor.width() == w && tensor.height() == h && tensor.channels() == 3 {
      return Ok(tensor.as_nhwc().to_vec());
    }

    let image = tensor.to_rgb_image().ok_or(Yolo26Error::UnsupportedTensor)?;
    let resized = image::imageops::resize(&image, w as u32, h as u32, FilterType::Triangle);
    Ok(resized.into_raw())
  }
}

impl Detector for Yolo26 {
  type Error = Yolo26Error;

  fn detect(&self, tensor: &ImageTensor) -> Result<Vec<Detection>, Self::Error> {
    let detections = self.detect_cancellable(tensor, &CancelToken::default())?;
    Ok(detections.unwrap_or_default())
  }

  fn detect_cancellable(
    &self,
    tensor: &ImageTensor,
    cancel: &CancelToken,
  ) -> Result<Option<Vec<Detection>>, Self::Error> {
    let input = Self::prepare_input(tensor)?;

    let output = {
      let context = self.context.lock().map_err(|_| Yolo26Error::Poisoned)?;
      // 排队期间可能已被更新的帧取代
      if cancel.is_cancelled() {
        debug!("检测已取消，跳过推理");
        return Ok(None);
      }
      debug!("设置模型输入");
      context.set_input(0, &input, rknpu::TensorFormat::NHWC, TensorType::UInt8)?;
      debug!("执行模型推理");
      context.run()?;
      debug!("获取模型输出");
      context.get_outputs()?
    };

    let detections = postprocess(&output)
      .into_iter()
      .map(|(class_id, score, bbox)| Detection {
        class_label: coco_label(class_id).to_string(),
        score,
        bbox: to_tensor_space(&bbox, tensor.width() as f32, tensor.height() as f32),
      })
      .collect::<Vec<_>>();

    debug!("检测到 {} 个物体", detections.len());
    Ok(Some(detections))
  }
}

/// 归一化 [x_min, y_min, x_max, y_max] 转为张量坐标系下的 (x, y, w, h)
fn to_tensor_space(bbox: &[f32; 4], width: f32, height: f32) -> BBox {
  BBox::new(
    bbox[0] * width,
    bbox[1] * height,
    (bbox[2] - bbox[0]) * width,
    (bbox[3] - bbox[1]) * height,
  )
}

/// 根据张量大小匹配回归和分类输出
fn match_reg_cls_tensors<'a>(
  tensor1: &'a [f32],
  tensor2: &'a [f32],
  reg_expected: usize,
  cls_expected: usize,
  head_idx: usize,
) -> Option<(&'a [f32], &'a [f32])> {
  if tensor1.len() == reg_expected && tensor2.len() == cls_expected {
    Some((tensor1, tensor2))
  } else if tensor1.len() == cls_expected && tensor2.len() == reg_expected {
    debug!("检测头 {}: 输出顺序交换", head_idx);
    Some((tensor2, tensor1))
  } else {
    error!(
      "检测头 {}: 输出大小不匹配 - 张量1: {}, 张量2: {}, 期望回归: {}, 期望分类: {}",
      head_idx,
      tensor1.len(),
      tensor2.len(),
      reg_expected,
      cls_expected
    );
    None
  }
}

fn postprocess(output: &rknpu::Output) -> Vec<(usize, f32, [f32; 4])> {
  let mut items = Vec::new();

  for (head_idx, (&(map_h, map_w), stride)) in
    YOLO26_HEAD_SIZES.iter().zip(YOLO26_STRIDES).enumerate()
  {
    let spatial = map_h * map_w;
    let reg_expected = 4 * spatial;
    let cls_expected = YOLO26_CLASS_NUM * spatial;

    // RKNN 输出顺序不固定，按张量大小区分回归与分类
    let (tensor1, tensor2) = match (
      output.get_f32(head_idx * 2),
      output.get_f32(head_idx * 2 + 1),
    ) {
      (Ok(t1), Ok(t2)) => (t1, t2),
      (Err(e), _) | (_, Err(e)) => {
        error!("获取检测头 {} 输出失败: {}", head_idx, e);
        continue;
      }
    };

    let Some((reg, cls)) =
      match_reg_cls_tensors(tensor1, tensor2, reg_expected, cls_expected, head_idx)
    else {
      continue;
    };

    decode_head(reg, cls, map_h, map_w, stride, &mut items);
  }

  items
}

fn decode_head(
  reg: &[f32],
  cls: &[f32],
  map_h: usize,
  map_w: usize,
  stride: f32,
  items: &mut Vec<(usize, f32, [f32; 4])>,
) {
  let spatial = map_h * map_w;

  for h in 0..map_h {
    for w in 0..map_w {
      let idx = h * map_w + w;

      let (max_logit, class_id) = (0..YOLO26_CLASS_NUM)
        .map(|c| (cls[c * spatial + idx], c))
        .fold((f32::MIN, 0usize), |best, cur| {
          if cur.0 > best.0 { cur } else { best }
        });
      let score = sigmoid(max_logit);
      if score <= YOLO26_OBJECT_THRESH {
        continue;
      }

      let grid_x = (w as f32) + 0.5;
      let grid_y = (h as f32) + 0.5;

      let xmin = ((grid_x - reg[idx]) * stride).clamp(0.0, YOLO26_INPUT_W);
      let ymin = ((grid_y - reg[spatial + idx]) * stride).clamp(0.0, YOLO26_INPUT_H);
      let xmax = ((grid_x + reg[2 * spatial + idx]) * stride).clamp(0.0, YOLO26_INPUT_W);
      let ymax = ((grid_y + reg[3 * spatial + idx]) * stride).clamp(0.0, YOLO26_INPUT_H);

      if xmax > xmin && ymax > ymin {
        items.push((
          class_id,
          score,
          [
            xmin / YOLO26_INPUT_W,
            ymin / YOLO26_INPUT_H,
            xmax / YOLO26_INPUT_W,
            ymax / YOLO26_INPUT_H,
          ],
        ));
      }
    }
  }
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}
