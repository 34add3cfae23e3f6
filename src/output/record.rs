// 该文件是 Lanjing （览镜） 项目的一部分。
// src/output/record.rs - 绘制命令记录
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{
  fs::{File, OpenOptions},
  io::{LineWriter, Write},
  path::PathBuf,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  config::ViewportSize,
  output::{Color, DrawingContext, OverlaySurface, apply_default_style},
};

#[derive(Error, Debug)]
pub enum CommandRecordError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("序列化错误: {0}")]
  SerializeError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DrawCommand {
  ClearRect {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
  },
  StrokeRect {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
  },
  StrokeText {
    text: String,
    x: f32,
    y: f32,
  },
  StrokeStyle {
    color: Color,
  },
  FillStyle {
    color: Color,
  },
  LineWidth {
    width: f32,
  },
}

/// 只记录不绘制的上下文
#[derive(Debug, Default)]
pub struct CommandRecorder {
  commands: Vec<DrawCommand>,
}

impl CommandRecorder {
  pub fn commands(&self) -> &[DrawCommand] {
    &self.commands
  }

  pub fn take_commands(&mut self) -> Vec<DrawCommand> {
    std::mem::take(&mut self.commands)
  }
}

impl DrawingContext for CommandRecorder {
  fn clear_rect(&mut self, x: f32, y: f32, width: f32, height: f32) {
    self.commands.push(DrawCommand::ClearRect {
      x,
      y,
      width,
      height,
    });
  }

  fn stroke_rect(&mut self, x: f32, y: f32, width: f32, height: f32) {
    self.commands.push(DrawCommand::StrokeRect {
      x,
      y,
      width,
      height,
    });
  }

  fn stroke_text(&mut self, text: &str, x: f32, y: f32) {
    self.commands.push(DrawCommand::StrokeText {
      text: text.to_string(),
      x,
      y,
    });
  }

  fn set_stroke_style(&mut self, color: Color) {
    self.commands.push(DrawCommand::StrokeStyle { color });
  }

  fn set_fill_style(&mut self, color: Color) {
    self.commands.push(DrawCommand::FillStyle { color });
  }

  fn set_line_width(&mut self, width: f32) {
    self.commands.push(DrawCommand::LineWidth { width });
  }
}

/// 每次 present 写出一行 JSON 命令数组；没有文件路径时保存在内存中
pub struct CommandRecordOutput {
  path: Option<PathBuf>,
  writer: Option<LineWriter<File>>,
  size: Option<ViewportSize>,
  recorder: Option<CommandRecorder>,
  frames: Vec<Vec<DrawCommand>>,
}

impl FromUrlWithScheme for CommandRecordOutput {
  const SCHEME: &'static str = "record";
}

impl FromUrl for CommandRecordOutput {
  type Error = CommandRecordError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(CommandRecordError::SchemeMismatch);
    }

    Ok(CommandRecordOutput {
      path: Some(PathBuf::from(url.path())),
      ..Self::in_memory()
    })
  }
}

impl CommandRecordOutput {
  pub fn in_memory() -> Self {
    Self {
      path: None,
      writer: None,
      size: None,
      recorder: None,
      frames: Vec::new(),
    }
  }

  /// 尚未 present 的命令
  pub fn pending(&self) -> &[DrawCommand] {
    self
      .recorder
      .as_ref()
      .map(CommandRecorder::commands)
      .unwrap_or(&[])
  }

  /// 内存模式下已 present 的各帧命令
  pub fn frames(&self) -> &[Vec<DrawCommand>] {
    &self.frames
  }

  fn writer(&mut self) -> Result<Option<&mut LineWriter<File>>, CommandRecordError> {
    if self.writer.is_none()
      && let Some(path) = self.path.as_ref()
    {
      if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
      {
        std::fs::create_dir_all(parent)?;
      }
      let file = OpenOptions::new().create(true).append(true).open(path)?;
      info!("绘制命令写入: {}", path.display());
      self.writer = Some(LineWriter::new(file));
    }
    Ok(self.writer.as_mut())
  }
}

impl OverlaySurface for CommandRecordOutput {
  type Error = CommandRecordError;

  fn attach(&mut self, viewport: ViewportSize) {
    let mut recorder = CommandRecorder::default();
    apply_default_style(&mut recorder);
    self.recorder = Some(recorder);
    self.size = Some(viewport);
  }

  fn width(&self) -> f32 {
    self.size.map(|size| size.width).unwrap_or(0.0)
  }

  fn height(&self) -> f32 {
    self.size.map(|size| size.height).unwrap_or(0.0)
  }

  fn context(&mut self) -> Option<&mut dyn DrawingContext> {
    self
      .recorder
      .as_mut()
      .map(|recorder| recorder as &mut dyn DrawingContext)
  }

  fn present(&mut self) -> Result<(), Self::Error> {
    let commands = match self.recorder.as_mut() {
      Some(recorder) => recorder.take_commands(),
      None => return Ok(()),
    };

    match self.writer()? {
      Some(writer) => {
        serde_json::to_writer(&mut *writer, &commands)?;
        writer.write_all(b"\n")?;
      }
      None => self.frames.push(commands),
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn attach_records_default_style() {
    let mut output = CommandRecordOutput::in_memory();
    assert!(output.context().is_none());

    output.attach(ViewportSize::new(100.0, 50.0));
    assert_eq!(
      output.pending(),
      &[
        DrawCommand::StrokeStyle { color: Color::RED },
        DrawCommand::FillStyle { color: Color::RED },
        DrawCommand::LineWidth { width: 1.0 },
      ]
    );
  }

  #[test]
  fn present_moves_pending_into_frame() {
    let mut output = CommandRecordOutput::in_memory();
    output.attach(ViewportSize::new(100.0, 50.0));
    output.present().unwrap();

    output.context().unwrap().stroke_rect(1.0, 2.0, 3.0, 4.0);
    output.present().unwrap();

    assert!(output.pending().is_empty());
    assert_eq!(output.frames().len(), 2);
    assert_eq!(
      output.frames()[1],
      vec![DrawCommand::StrokeRect {
        x: 1.0,
        y: 2.0,
        width: 3.0,
        height: 4.0
      }]
    );
  }

  #[test]
  fn file_mode_appends_json_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("commands.jsonl");
    let url = Url::parse(&format!("record://{}", path.display())).unwrap();

    let mut output = CommandRecordOutput::from_url(&url).unwrap();
    output.attach(ViewportSize::new(10.0, 10.0));
    output.present().unwrap();
    output.context().unwrap().stroke_text("cup", 1.0, 2.0);
    output.present().unwrap();
    drop(output);

    let content = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 2);
    let second: Vec<DrawCommand> = serde_json::from_str(lines[1]).unwrap();
    assert_eq!(
      second,
      vec![DrawCommand::StrokeText {
        text: "cup".to_string(),
        x: 1.0,
        y: 2.0
      }]
    );
  }
}
