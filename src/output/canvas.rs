// 该文件是 Lanjing （览镜） 项目的一部分。
// src/output/canvas.rs - 透明 RGBA 画布
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{convert::Infallible, path::Path};

use ab_glyph::{FontArc, PxScale};
use image::{Rgba, RgbaImage};
use imageproc::{
  drawing::{draw_hollow_rect_mut, draw_text_mut},
  rect::Rect,
};
use tracing::debug;

use crate::{
  config::ViewportSize,
  output::{Color, DrawingContext, OutputError, OverlaySurface, apply_default_style},
};

const LABEL_FONT_SIZE: f32 = 16.0;

pub fn load_font(path: &Path) -> Result<FontArc, OutputError> {
  let data = std::fs::read(path)
    .map_err(|e| OutputError::FontError(format!("{}: {}", path.display(), e)))?;
  FontArc::try_from_vec(data)
    .map_err(|e| OutputError::FontError(format!("{}: {}", path.display(), e)))
}

fn to_rgba(color: Color) -> Rgba<u8> {
  Rgba([color.r, color.g, color.b, color.a])
}

/// 负宽高按 canvas 语义先归一化
fn normalize(x: f32, y: f32, width: f32, height: f32) -> (f32, f32, f32, f32) {
  let (x, width) = if width < 0.0 { (x + width, -width) } else { (x, width) };
  let (y, height) = if height < 0.0 { (y + height, -height) } else { (y, height) };
  (x, y, width, height)
}

pub struct CanvasContext {
  image: RgbaImage,
  stroke_style: Color,
  fill_style: Color,
  line_width: f32,
  font: Option<FontArc>,
  font_scale: PxScale,
  strokes: usize,
}

impl CanvasContext {
  fn new(width: u32, height: u32, font: Option<FontArc>) -> Self {
    Self {
      image: RgbaImage::new(width, height),
      stroke_style: Color::TRANSPARENT,
      fill_style: Color::TRANSPARENT,
      line_width: 1.0,
      font,
      font_scale: PxScale::from(LABEL_FONT_SIZE),
      strokes: 0,
    }
  }

  pub fn image(&self) -> &RgbaImage {
    &self.image
  }

  pub fn fill_style(&self) -> Color {
    self.fill_style
  }

  /// 自上次调用以来描边的矩形数量
  pub fn take_stroke_count(&mut self) -> usize {
    std::mem::take(&mut self.strokes)
  }
}

impl DrawingContext for CanvasContext {
  fn clear_rect(&mut self, x: f32, y: f32, width: f32, height: f32) {
    let (x, y, width, height) = normalize(x, y, width, height);
    let (img_w, img_h) = self.image.dimensions();
    let x0 = x.floor().clamp(0.0, img_w as f32) as u32;
    let y0 = y.floor().clamp(0.0, img_h as f32) as u32;
    let x1 = (x + width).ceil().clamp(0.0, img_w as f32) as u32;
    let y1 = (y + height).ceil().clamp(0.0, img_h as f32) as u32;

    for py in y0..y1 {
      for px in x0..x1 {
        self.image.put_pixel(px, py, to_rgba(Color::TRANSPARENT));
      }
    }
  }

  fn stroke_rect(&mut self, x: f32, y: f32, width: f32, height: f32) {
    let (x, y, width, height) = normalize(x, y, width, height);
    self.strokes += 1;

    let color = to_rgba(self.stroke_style);
    let thickness = self.line_width.round().max(1.0) as i32;
    let (x, y) = (x.round() as i32, y.round() as i32);
    let (w, h) = (width.round() as i32, height.round() as i32);

    // 由外向内逐像素加粗，imageproc 会裁掉画布外的部分
    for t in 0..thickness {
      let (tw, th) = (w - 2 * t, h - 2 * t);
      if tw <= 0 || th <= 0 {
        break;
      }
      let rect = Rect::at(x + t, y + t).of_size(tw as u32, th as u32);
      draw_hollow_rect_mut(&mut self.image, rect, color);
    }
  }

  fn stroke_text(&mut self, text: &str, x: f32, y: f32) {
    let Some(font) = self.font.as_ref() else {
      debug!("未配置字体，跳过标签: {}", text);
      return;
    };
    // (x, y) 是文字基线，draw_text_mut 需要左上角
    let top = (y - self.font_scale.y).round() as i32;
    draw_text_mut(
      &mut self.image,
      to_rgba(self.stroke_style),
      x.round() as i32,
      top,
      self.font_scale,
      font,
      text,
    );
  }

  fn set_stroke_style(&mut self, color: Color) {
    self.stroke_style = color;
  }

  fn set_fill_style(&mut self, color: Color) {
    self.fill_style = color;
  }

  fn set_line_width(&mut self, width: f32) {
    self.line_width = width;
  }
}

/// 与视口等大的透明画布
#[derive(Default)]
pub struct ImageCanvas {
  font: Option<FontArc>,
  context: Option<CanvasContext>,
}

impl ImageCanvas {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_font(mut self, font: FontArc) -> Self {
    if let Some(context) = self.context.as_mut() {
      context.font = Some(font.clone());
    }
    self.font = Some(font);
    self
  }

  pub fn canvas_context(&self) -> Option<&CanvasContext> {
    self.context.as_ref()
  }

  pub fn canvas_context_mut(&mut self) -> Option<&mut CanvasContext> {
    self.context.as_mut()
  }

  pub fn image(&self) -> Option<&RgbaImage> {
    self.context.as_ref().map(CanvasContext::image)
  }
}

impl OverlaySurface for ImageCanvas {
  type Error = Infallible;

  fn attach(&mut self, viewport: ViewportSize) {
    let width = viewport.width.round().max(1.0) as u32;
    let height = viewport.height.round().max(1.0) as u32;
    let mut context = CanvasContext::new(width, height, self.font.clone());
    apply_default_style(&mut context);
    self.context = Some(context);
  }

  fn width(&self) -> f32 {
    self.image().map(|image| image.width() as f32).unwrap_or(0.0)
  }

  fn height(&self) -> f32 {
    self
      .image()
      .map(|image| image.height() as f32)
      .unwrap_or(0.0)
  }

  fn context(&mut self) -> Option<&mut dyn DrawingContext> {
    self
      .context
      .as_mut()
      .map(|context| context as &mut dyn DrawingContext)
  }

  fn present(&mut self) -> Result<(), Self::Error> {
    Ok(())
  }
}
