// 该文件是 Lanjing （览镜） 项目的一部分。
// src/mapper.rs - 张量坐标到屏幕坐标的映射与绘制
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

use tracing::debug;

use crate::{
  config::ViewportSize,
  frame::TensorShape,
  model::{BBox, Detection},
  output::OverlaySurface,
};

/// 标签相对检测框左上角的偏移
const LABEL_OFFSET: f32 = 5.0;

/// 屏幕坐标系下的矩形（像素）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenRect {
  pub x: f32,
  pub y: f32,
  pub width: f32,
  pub height: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinateMapper {
  viewport: ViewportSize,
  flip_horizontal: bool,
}

impl CoordinateMapper {
  pub fn new(viewport: ViewportSize, flip_horizontal: bool) -> Self {
    Self {
      viewport,
      flip_horizontal,
    }
  }

  /// (scale_width, scale_height)，形状按高度在前读取
  pub fn scale(&self, shape: TensorShape) -> (f32, f32) {
    (
      self.viewport.width / shape.width as f32,
      self.viewport.height / shape.height as f32,
    )
  }

  /// 翻转时以绘制表面宽度为镜像轴，而非视口宽度
  pub fn map(&self, bbox: &BBox, shape: TensorShape, surface_width: f32) -> ScreenRect {
    let (scale_width, scale_height) = self.scale(shape);

    let x = if self.flip_horizontal {
      surface_width - bbox.x * scale_width - bbox.width * scale_width
    } else {
      bbox.x * scale_width
    };

    ScreenRect {
      x,
      y: bbox.y * scale_height,
      width: bbox.width * scale_width,
      height: bbox.height * scale_height,
    }
  }

  /// 清空整个叠加层后逐个绘制检测框与标签；表面未初始化时不做任何事并返回 false
  pub fn paint<S: OverlaySurface + ?Sized>(
    &self,
    surface: &mut S,
    detections: &[Detection],
    shape: TensorShape,
  ) -> bool {
    let surface_width = surface.width();
    let Some(context) = surface.context() else {
      debug!("叠加层尚未初始化，丢弃本帧");
      return false;
    };

    context.clear_rect(0.0, 0.0, self.viewport.width, self.viewport.height);

    for detection in detections {
      let rect = self.map(&detection.bbox, shape, surface_width);
      context.stroke_rect(rect.x, rect.y, rect.width, rect.height);
      context.stroke_text(
        &detection.class_label,
        rect.x - LABEL_OFFSET,
        rect.y - LABEL_OFFSET,
      );
    }

    true
  }
}
