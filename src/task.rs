// 该文件是 Lanjing （览镜） 项目的一部分。
// src/task.rs - 逐帧检测循环
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

use std::{
  collections::BTreeMap,
  sync::{
    Arc,
    mpsc::{self, Receiver, RecvTimeoutError, Sender},
  },
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  config::{DEFAULT_FPS, frame_interval},
  frame::{ImageTensor, TensorShape},
  input::FrameSource,
  mapper::CoordinateMapper,
  model::{Detection, Detector, ModelSlot},
  output::OverlaySurface,
};

pub use crate::model::CancelToken;

#[derive(Error, Debug)]
pub enum LoopError {
  #[error("没有模型或图像张量")]
  MissingModelOrFrame,
  #[error("无法启动检测线程: {0}")]
  Spawn(#[from] std::io::Error),
}

/// 重叠的检测结果如何落到叠加层上
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaintOrdering {
  /// 丢弃比已绘制帧更旧的结果，并取消更旧的在途检测
  #[default]
  DropStale,
  /// 按完成顺序绘制，旧结果可能覆盖新结果
  LastWriteWins,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
  pub ticks: u64,
  pub missing: u64,
  pub dispatched: u64,
  pub painted: u64,
  pub rejected: u64,
  pub dropped_stale: u64,
  pub cancelled: u64,
}

enum Outcome {
  Resolved(Vec<Detection>),
  Rejected(String),
  Cancelled,
}

struct Completion {
  index: u64,
  shape: TensorShape,
  outcome: Outcome,
}

struct InFlight {
  token: CancelToken,
  handle: JoinHandle<()>,
}

/// 按动画帧节奏调度迭代
#[derive(Debug)]
pub struct AnimationFrames {
  interval: Duration,
  frame_limit: Option<u64>,
  scheduled: u64,
  deadline: Option<Instant>,
}

impl AnimationFrames {
  /// 非法帧率回退到默认帧率
  pub fn with_fps(fps: f64) -> Self {
    let interval = frame_interval(fps).unwrap_or_else(|| {
      warn!("非法帧率 {}，使用默认帧率 {}", fps, DEFAULT_FPS);
      Duration::from_secs_f64(1.0 / DEFAULT_FPS)
    });
    Self {
      interval,
      frame_limit: None,
      scheduled: 0,
      deadline: None,
    }
  }

  pub fn with_frame_limit(mut self, frame_limit: Option<u64>) -> Self {
    self.frame_limit = frame_limit;
    self
  }

  /// 等到下一帧；达到帧数上限时返回 false
  pub fn next_frame(&mut self) -> bool {
    if self.frame_limit.is_some_and(|limit| self.scheduled >= limit) {
      return false;
    }

    let now = Instant::now();
    if let Some(deadline) = self.deadline
      && deadline > now
    {
      thread::sleep(deadline - now);
    }
    self.deadline = Some(Instant::now() + self.interval);
    self.scheduled += 1;
    true
  }
}

/// 安装 Ctrl-C 处理器，收到信号后通知循环退出
pub fn install_interrupt_handler() -> anyhow::Result<Receiver<()>> {
  let (tx, rx) = mpsc::channel();

  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    let _ = tx.send(());
    thread::spawn(|| {
      thread::sleep(Duration::from_secs(30));
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })?;

  Ok(rx)
}

pub struct DetectionLoop<S, D, O> {
  source: S,
  model: ModelSlot<D>,
  surface: O,
  mapper: CoordinateMapper,
  ordering: PaintOrdering,
  next_index: u64,
  last_painted: Option<u64>,
  in_flight: BTreeMap<u64, InFlight>,
  completions_tx: Sender<Completion>,
  completions_rx: Receiver<Completion>,
  stats: LoopStats,
}

impl<S, D, O> DetectionLoop<S, D, O>
where
  S: FrameSource,
  D: Detector + 'static,
  O: OverlaySurface,
{
  pub fn new(source: S, model: ModelSlot<D>, surface: O, mapper: CoordinateMapper) -> Self {
    let (completions_tx, completions_rx) = mpsc::channel();
    Self {
      source,
      model,
      surface,
      mapper,
      ordering: PaintOrdering::default(),
      next_index: 0,
      last_painted: None,
      in_flight: BTreeMap::new(),
      completions_tx,
      completions_rx,
      stats: LoopStats::default(),
    }
  }

  pub fn with_ordering(mut self, ordering: PaintOrdering) -> Self {
    self.ordering = ordering;
    self
  }

  pub fn stats(&self) -> LoopStats {
    self.stats
  }

  pub fn surface(&self) -> &O {
    &self.surface
  }

  pub fn in_flight(&self) -> usize {
    self.in_flight.len()
  }

  /// 一次动画帧迭代：先绘制已完成的检测，再取帧并异步发起检测，不等待结果
  pub fn tick(&mut self) -> Result<(), LoopError> {
    self.stats.ticks += 1;
    self.drain_completions();

    // 与模型是否就绪无关，每次迭代都会消耗一帧
    let tensor = self.source.next_tensor();
    let (Some(model), Some(tensor)) = (self.model.get(), tensor) else {
      self.stats.missing += 1;
      return Err(LoopError::MissingModelOrFrame);
    };

    self.dispatch(model, tensor)
  }

  fn dispatch(&mut self, model: Arc<D>, tensor: ImageTensor) -> Result<(), LoopError> {
    let index = self.next_index;
    self.next_index += 1;

    let token = CancelToken::default();
    let worker_token = token.clone();
    let tx = self.completions_tx.clone();

    let handle = thread::Builder::new()
      .name(format!("detect-{}", index))
      .spawn(move || {
        let shape = tensor.shape();
        let outcome = match model.detect_cancellable(&tensor, &worker_token) {
          Ok(None) => Outcome::Cancelled,
          Ok(Some(_)) if worker_token.is_cancelled() => Outcome::Cancelled,
          Ok(Some(detections)) => Outcome::Resolved(detections),
          Err(e) => Outcome::Rejected(e.to_string()),
        };
        drop(tensor);
        // 循环已退出时接收端不存在，结果直接丢弃
        let _ = tx.send(Completion {
          index,
          shape,
          outcome,
        });
      })?;

    debug!("第 {} 帧已提交检测", index);
    self.in_flight.insert(index, InFlight { token, handle });
    self.stats.dispatched += 1;
    Ok(())
  }

  /// 处理所有已到达的检测结果，返回处理数量
  pub fn drain_completions(&mut self) -> usize {
    let mut handled = 0;
    while let Ok(completion) = self.completions_rx.try_recv() {
      self.handle_completion(completion);
      handled += 1;
    }
    handled
  }

  /// 最多等待 `timeout` 直到有结果到达，随后处理所有已到达的结果
  pub fn wait_completion(&mut self, timeout: Duration) -> usize {
    match self.completions_rx.recv_timeout(timeout) {
      Ok(completion) => {
        self.handle_completion(completion);
        1 + self.drain_completions()
      }
      Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => 0,
    }
  }

  fn handle_completion(&mut self, completion: Completion) {
    let Completion {
      index,
      shape,
      outcome,
    } = completion;

    if let Some(in_flight) = self.in_flight.remove(&index)
      && in_flight.handle.join().is_err()
    {
      error!("检测线程 {} 异常退出", index);
    }

    let detections = match outcome {
      Outcome::Resolved(detections) => detections,
      Outcome::Rejected(e) => {
        warn!("检测失败，丢弃第 {} 帧: {}", index, e);
        self.stats.rejected += 1;
        return;
      }
      Outcome::Cancelled => {
        debug!("第 {} 帧检测已取消", index);
        self.stats.cancelled += 1;
        return;
      }
    };

    if self.ordering == PaintOrdering::DropStale
      && self.last_painted.is_some_and(|last| index <= last)
    {
      debug!(
        "丢弃过期结果: 第 {} 帧，已绘制第 {:?} 帧",
        index, self.last_painted
      );
      self.stats.dropped_stale += 1;
      return;
    }

    if !self.mapper.paint(&mut self.surface, &detections, shape) {
      return;
    }
    if let Err(e) = self.surface.present() {
      error!("叠加层输出失败: {}", e);
    }
    debug!("第 {} 帧绘制 {} 个检测框", index, detections.len());
    self.last_painted = Some(index);
    self.stats.painted += 1;

    if self.ordering == PaintOrdering::DropStale {
      for (stale, in_flight) in self.in_flight.range(..index) {
        debug!("取消过期检测: 第 {} 帧", stale);
        in_flight.token.cancel();
      }
    }
  }

  /// 等待所有在途检测结束并处理其结果
  pub fn settle(&mut self) {
    let in_flight = std::mem::take(&mut self.in_flight);
    for (index, in_flight) in in_flight {
      if in_flight.handle.join().is_err() {
        error!("检测线程 {} 异常退出", index);
      }
    }
    self.drain_completions();
  }

  /// 取消所有在途检测后收尾
  pub fn shutdown(&mut self) {
    for in_flight in self.in_flight.values() {
      in_flight.token.cancel();
    }
    self.settle();
  }

  /// 持续迭代直到中断或达到帧数上限；单次迭代失败不影响下一帧的调度
  pub fn run(mut self, mut frames: AnimationFrames, stop: Receiver<()>) -> LoopStats {
    info!("开始检测循环...");
    while frames.next_frame() {
      let started = Instant::now();
      if let Err(e) = self.tick() {
        error!("第 {} 次迭代失败: {}", self.stats.ticks, e);
      }
      debug!(
        "迭代 {} 完成，耗时: {:.2?}, 在途检测: {}",
        self.stats.ticks,
        started.elapsed(),
        self.in_flight.len()
      );

      if stop.try_recv().is_ok() {
        warn!("中断信号接收，退出检测循环");
        break;
      }
    }

    self.shutdown();
    let stats = self.stats;
    info!(
      "检测循环结束: 迭代 {}, 提交 {}, 绘制 {}, 失败 {}, 过期 {}, 取消 {}, 缺帧 {}",
      stats.ticks,
      stats.dispatched,
      stats.painted,
      stats.rejected,
      stats.dropped_stale,
      stats.cancelled,
      stats.missing
    );
    stats
  }
}

#[cfg(test)]
mod tests {
  use std::{
    collections::VecDeque,
    sync::{
      Mutex,
      atomic::{AtomicUsize, Ordering},
    },
  };

  use super::*;
  use crate::{
    config::ViewportSize,
    input::{InputError, InputWrapper},
    model::BBox,
    output::{CommandRecordOutput, DrawCommand},
  };

  const WAIT: Duration = Duration::from_secs(5);

  /// 按脚本产出张量，首字节标识帧号，耗尽后返回 None
  struct Scripted {
    frames: VecDeque<u8>,
    pulled: usize,
  }

  impl Scripted {
    fn new(count: u8) -> Self {
      Self {
        frames: (0..count).collect(),
        pulled: 0,
      }
    }
  }

  impl FrameSource for Scripted {
    fn next_tensor(&mut self) -> Option<ImageTensor> {
      self.pulled += 1;
      let id = self.frames.pop_front()?;
      let mut data = vec![0u8; 4 * 4 * 3];
      data[0] = id;
      ImageTensor::from_vec(data, TensorShape::new(4, 4, 3)).ok()
    }

    fn restart(&mut self) -> Result<(), InputError> {
      Ok(())
    }
  }

  #[derive(Debug, Error)]
  #[error("inference failed")]
  struct Failed;

  fn labelled(tensor: &ImageTensor) -> Vec<Detection> {
    vec![Detection {
      class_label: format!("frame{}", tensor.as_nhwc()[0]),
      score: 1.0,
      bbox: BBox::new(1.0, 1.0, 2.0, 2.0),
    }]
  }

  #[derive(Default)]
  struct Counting {
    calls: AtomicUsize,
  }

  impl Detector for Counting {
    type Error = Failed;

    fn detect(&self, tensor: &ImageTensor) -> Result<Vec<Detection>, Self::Error> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      Ok(labelled(tensor))
    }
  }

  struct Rejecting;

  impl Detector for Rejecting {
    type Error = Failed;

    fn detect(&self, _tensor: &ImageTensor) -> Result<Vec<Detection>, Self::Error> {
      Err(Failed)
    }
  }

  /// 每帧阻塞到测试放行为止
  struct Gated {
    gates: Vec<Mutex<Option<Receiver<()>>>>,
  }

  impl Gated {
    fn new(count: usize) -> (Self, Vec<Sender<()>>) {
      let (senders, gates) = (0..count)
        .map(|_| {
          let (tx, rx) = mpsc::channel();
          (tx, Mutex::new(Some(rx)))
        })
        .unzip();
      (Self { gates }, senders)
    }
  }

  impl Detector for Gated {
    type Error = Failed;

    fn detect(&self, tensor: &ImageTensor) -> Result<Vec<Detection>, Self::Error> {
      let id = tensor.as_nhwc()[0] as usize;
      let gate = self.gates[id].lock().map_err(|_| Failed)?.take();
      if let Some(gate) = gate {
        gate.recv().map_err(|_| Failed)?;
      }
      Ok(labelled(tensor))
    }
  }

  /// 先在各自的闸门前排队，再独占推理引擎，拿到引擎后检查取消
  struct Queued {
    gated: Gated,
    engine: Mutex<()>,
    inference_runs: AtomicUsize,
  }

  impl Queued {
    fn new(count: usize) -> (Self, Vec<Sender<()>>) {
      let (gated, gates) = Gated::new(count);
      let queued = Self {
        gated,
        engine: Mutex::new(()),
        inference_runs: AtomicUsize::new(0),
      };
      (queued, gates)
    }
  }

  impl Detector for Queued {
    type Error = Failed;

    fn detect(&self, tensor: &ImageTensor) -> Result<Vec<Detection>, Self::Error> {
      let detections = self.detect_cancellable(tensor, &CancelToken::default())?;
      Ok(detections.unwrap_or_default())
    }

    fn detect_cancellable(
      &self,
      tensor: &ImageTensor,
      cancel: &CancelToken,
    ) -> Result<Option<Vec<Detection>>, Self::Error> {
      let id = tensor.as_nhwc()[0] as usize;
      let gate = self.gated.gates[id].lock().map_err(|_| Failed)?.take();
      if let Some(gate) = gate {
        gate.recv().map_err(|_| Failed)?;
      }

      let _engine = self.engine.lock().map_err(|_| Failed)?;
      if cancel.is_cancelled() {
        return Ok(None);
      }
      self.inference_runs.fetch_add(1, Ordering::SeqCst);
      Ok(Some(labelled(tensor)))
    }
  }

  fn surface() -> CommandRecordOutput {
    let mut surface = CommandRecordOutput::in_memory();
    surface.attach(ViewportSize::new(40.0, 40.0));
    surface
  }

  fn mapper() -> CoordinateMapper {
    CoordinateMapper::new(ViewportSize::new(40.0, 40.0), false)
  }

  fn painted_labels(surface: &CommandRecordOutput) -> Vec<String> {
    surface
      .frames()
      .iter()
      .flatten()
      .filter_map(|command| match command {
        DrawCommand::StrokeText { text, .. } => Some(text.clone()),
        _ => None,
      })
      .collect()
  }

  #[test]
  fn stalled_source_keeps_loop_scheduling() {
    let detector = Arc::new(Counting::default());
    let slot = ModelSlot::ready(Arc::clone(&detector));
    let mut lp = DetectionLoop::new(Scripted::new(3), slot, surface(), mapper());

    let mut failures = 0;
    for _ in 0..10 {
      if lp.tick().is_err() {
        failures += 1;
      }
    }
    lp.settle();

    assert_eq!(detector.calls.load(Ordering::SeqCst), 3);
    let stats = lp.stats();
    assert_eq!(stats.ticks, 10);
    assert_eq!(stats.dispatched, 3);
    assert_eq!(stats.missing, 7);
    assert_eq!(failures, 7);
    assert_eq!(lp.in_flight(), 0);
  }

  #[test]
  fn missing_model_still_consumes_frames() {
    let slot = ModelSlot::<Counting>::empty();
    let mut lp = DetectionLoop::new(Scripted::new(5), slot.clone(), surface(), mapper());

    assert!(matches!(lp.tick(), Err(LoopError::MissingModelOrFrame)));
    assert!(matches!(lp.tick(), Err(LoopError::MissingModelOrFrame)));
    assert_eq!(lp.source.pulled, 2);

    // 模型就绪后从下一帧开始检测
    slot.install(Counting::default());
    lp.tick().unwrap();
    lp.settle();
    assert_eq!(painted_labels(lp.surface()), vec!["frame2".to_string()]);
  }

  #[test]
  fn rejected_detection_drops_frame() {
    let slot = ModelSlot::ready(Rejecting);
    let mut lp = DetectionLoop::new(Scripted::new(2), slot, surface(), mapper());
    lp.tick().unwrap();
    lp.tick().unwrap();
    lp.settle();

    let stats = lp.stats();
    assert_eq!(stats.rejected, 2);
    assert_eq!(stats.painted, 0);
    assert!(lp.surface().frames().is_empty());
  }

  #[test]
  fn unattached_surface_drops_results_silently() {
    let slot = ModelSlot::ready(Counting::default());
    let surface = CommandRecordOutput::in_memory();
    let mut lp = DetectionLoop::new(Scripted::new(1), slot, surface, mapper());
    lp.tick().unwrap();
    lp.settle();

    assert_eq!(lp.stats().painted, 0);
    assert!(lp.surface().frames().is_empty());
  }

  #[test]
  fn newer_paint_cancels_older_detection() {
    let (detector, gates) = Gated::new(2);
    let slot = ModelSlot::ready(detector);
    let mut lp = DetectionLoop::new(Scripted::new(2), slot, surface(), mapper());
    lp.tick().unwrap();
    lp.tick().unwrap();
    assert_eq!(lp.in_flight(), 2);

    gates[1].send(()).unwrap();
    assert_eq!(lp.wait_completion(WAIT), 1);
    gates[0].send(()).unwrap();
    lp.settle();

    let stats = lp.stats();
    assert_eq!(stats.painted, 1);
    assert_eq!(stats.cancelled, 1);
    assert_eq!(painted_labels(lp.surface()), vec!["frame1".to_string()]);
  }

  #[test]
  fn cancelled_queued_detection_skips_inference() {
    let (detector, gates) = Queued::new(2);
    let detector = Arc::new(detector);
    let slot = ModelSlot::ready(Arc::clone(&detector));
    let mut lp = DetectionLoop::new(Scripted::new(2), slot, surface(), mapper());
    lp.tick().unwrap();
    lp.tick().unwrap();

    gates[1].send(()).unwrap();
    assert_eq!(lp.wait_completion(WAIT), 1);
    gates[0].send(()).unwrap();
    lp.settle();

    assert_eq!(detector.inference_runs.load(Ordering::SeqCst), 1);
    let stats = lp.stats();
    assert_eq!(stats.painted, 1);
    assert_eq!(stats.cancelled, 1);
    assert_eq!(painted_labels(lp.surface()), vec!["frame1".to_string()]);
  }

  #[test]
  fn unavailable_source_never_dispatches() {
    let detector = Arc::new(Counting::default());
    let slot = ModelSlot::ready(Arc::clone(&detector));
    let mut lp = DetectionLoop::new(None::<InputWrapper>, slot, surface(), mapper());

    for _ in 0..4 {
      assert!(matches!(lp.tick(), Err(LoopError::MissingModelOrFrame)));
    }
    lp.settle();

    let stats = lp.stats();
    assert_eq!(stats.ticks, 4);
    assert_eq!(stats.missing, 4);
    assert_eq!(stats.dispatched, 0);
    assert_eq!(detector.calls.load(Ordering::SeqCst), 0);
    assert!(lp.surface().frames().is_empty());
  }

  #[test]
  fn invalid_frame_rate_falls_back_to_default() {
    let default = Duration::from_secs_f64(1.0 / DEFAULT_FPS);
    for fps in [0.0, -1.0, f64::NAN, 1e-300] {
      assert_eq!(AnimationFrames::with_fps(fps).interval, default);
    }
    assert_eq!(
      AnimationFrames::with_fps(50.0).interval,
      Duration::from_millis(20)
    );
  }

  #[test]
  fn last_write_wins_lets_stale_result_overwrite() {
    let (detector, gates) = Gated::new(2);
    let slot = ModelSlot::ready(detector);
    let mut lp = DetectionLoop::new(Scripted::new(2), slot, surface(), mapper())
      .with_ordering(PaintOrdering::LastWriteWins);
    lp.tick().unwrap();
    lp.tick().unwrap();

    gates[1].send(()).unwrap();
    assert_eq!(lp.wait_completion(WAIT), 1);
    gates[0].send(()).unwrap();
    lp.settle();

    assert_eq!(lp.stats().painted, 2);
    assert_eq!(
      painted_labels(lp.surface()),
      vec!["frame1".to_string(), "frame0".to_string()]
    );
  }

  #[test]
  fn late_completion_is_dropped_as_stale() {
    let slot = ModelSlot::<Counting>::empty();
    let mut lp = DetectionLoop::new(Scripted::new(0), slot, surface(), mapper());
    let shape = TensorShape::new(4, 4, 3);
    let tensor = |id: u8| {
      let mut data = vec![0u8; shape.len()];
      data[0] = id;
      ImageTensor::from_vec(data, shape).unwrap()
    };

    for id in [1u8, 0] {
      lp.completions_tx
        .send(Completion {
          index: id as u64,
          shape,
          outcome: Outcome::Resolved(labelled(&tensor(id))),
        })
        .unwrap();
    }
    assert_eq!(lp.drain_completions(), 2);

    let stats = lp.stats();
    assert_eq!(stats.painted, 1);
    assert_eq!(stats.dropped_stale, 1);
    assert_eq!(painted_labels(lp.surface()), vec!["frame1".to_string()]);
  }

  #[test]
  fn run_stops_at_frame_limit() {
    let slot = ModelSlot::ready(Counting::default());
    let lp = DetectionLoop::new(Scripted::new(3), slot, surface(), mapper());
    let (_tx, rx) = mpsc::channel();

    let stats = lp.run(
      AnimationFrames::with_fps(500.0).with_frame_limit(Some(6)),
      rx,
    );

    assert_eq!(stats.ticks, 6);
    assert_eq!(stats.dispatched, 3);
    assert_eq!(stats.missing, 3);
    assert_eq!(stats.painted + stats.cancelled + stats.dropped_stale, 3);
  }

  #[test]
  fn run_stops_on_interrupt() {
    let slot = ModelSlot::ready(Counting::default());
    let lp = DetectionLoop::new(Scripted::new(0), slot, surface(), mapper());
    let (tx, rx) = mpsc::channel();
    tx.send(()).unwrap();

    let stats = lp.run(AnimationFrames::with_fps(60.0), rx);
    assert_eq!(stats.ticks, 1);
  }
}
