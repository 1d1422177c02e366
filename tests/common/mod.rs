// 该文件是 Tianye （田野） 项目的一部分。
// tests/common/mod.rs - 集成测试公共设施
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

#![allow(dead_code)]

use std::cell::Cell;
use std::num::{NonZeroU32, NonZeroUsize};
use std::path::PathBuf;

use image::{Rgb, RgbImage};

use tianye::{
  config::{DetectConfig, PipelineConfig, StitchConfig},
  detect::BatchFailure,
  error::ErrorKind,
  input::{DecodedFrame, FrameExtractError, VideoSource},
  model::{DetectItem, DetectResult, Model},
  output::DetectionSink,
  pipeline::PipelineError,
};

pub const FRAME_WIDTH: u32 = 160;
pub const FRAME_HEIGHT: u32 = 120;
pub const SCENE_WIDTH: u32 = 800;
pub const VIDEO_FRAMES: u64 = 240;
pub const INTERVAL: u32 = 8;
/// 固定检测框中心在行图像内的位置
pub const LOCAL_CENTER: [f64; 2] = [10.0, 10.0];

fn noise(x: u32, y: u32) -> u8 {
  let mut h = (x / 4).wrapping_mul(0x9E37_79B1) ^ (y / 4).wrapping_mul(0x85EB_CA77) ^ 0x1234_5678;
  h ^= h >> 15;
  h = h.wrapping_mul(0x2C1B_3C6D);
  h ^= h >> 12;
  h = h.wrapping_mul(0x297A_2D39);
  h ^= h >> 15;
  (h & 0xFF) as u8
}

/// 相机匀速平移拍摄的合成视频
///
/// 第 `p` 帧截取场景中横坐标 `p * 5 / 2` 处的 160×120 区域，
/// 采样间隔为 8 时相邻两帧恰好相差 20 像素。
pub struct SyntheticVideo {
  position: u64,
  frames: u64,
}

impl SyntheticVideo {
  pub fn new(frames: u64) -> Self {
    Self {
      position: 0,
      frames,
    }
  }

  pub fn crop_x(position: u64) -> u32 {
    (position * 5 / 2) as u32
  }
}

impl Iterator for SyntheticVideo {
  type Item = Result<DecodedFrame, FrameExtractError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.position >= self.frames {
      return None;
    }
    let x0 = Self::crop_x(self.position);
    let image = RgbImage::from_fn(FRAME_WIDTH, FRAME_HEIGHT, |x, y| {
      let v = noise(x + x0, y);
      Rgb([v, v.wrapping_add(40), 255 - v])
    });
    let timestamp_ms = Some(self.position * 40);
    self.position += 1;
    Some(Ok(DecodedFrame {
      image,
      timestamp_ms,
    }))
  }
}

impl VideoSource for SyntheticVideo {
  fn describe(&self) -> String {
    format!("synthetic({} frames)", self.frames)
  }
}

/// 打开即失败的视频
pub struct BrokenVideo;

impl Iterator for BrokenVideo {
  type Item = Result<DecodedFrame, FrameExtractError>;

  fn next(&mut self) -> Option<Self::Item> {
    Some(Err(FrameExtractError::OpenVideo("truncated container".to_string())))
  }
}

impl VideoSource for BrokenVideo {
  fn describe(&self) -> String {
    "broken".to_string()
  }
}

/// 每个批次只对首行返回一个固定检测框
pub struct FixedModel;

fn fixed_item() -> DetectItem {
  DetectItem {
    class_id: 0,
    score: 0.9,
    bbox: [5.0, 5.0, 15.0, 15.0],
  }
}

impl Model for FixedModel {
  type Error = std::io::Error;

  fn infer(&self, _image: &RgbImage) -> Result<DetectResult, Self::Error> {
    Ok(DetectResult {
      items: vec![fixed_item()].into_boxed_slice(),
    })
  }

  fn infer_batch(&self, images: &[&RgbImage]) -> Result<Vec<DetectResult>, Self::Error> {
    Ok(
      (0..images.len())
        .map(|i| {
          if i == 0 {
            DetectResult {
              items: vec![fixed_item()].into_boxed_slice(),
            }
          } else {
            DetectResult::default()
          }
        })
        .collect(),
    )
  }
}

/// 第 `fail_on` 次批次调用失败，其余与 [`FixedModel`] 相同
pub struct FailingModel {
  fail_on: usize,
  calls: Cell<usize>,
}

impl FailingModel {
  pub fn new(fail_on: usize) -> Self {
    Self {
      fail_on,
      calls: Cell::new(0),
    }
  }
}

impl Model for FailingModel {
  type Error = std::io::Error;

  fn infer(&self, image: &RgbImage) -> Result<DetectResult, Self::Error> {
    FixedModel.infer(image)
  }

  fn infer_batch(&self, images: &[&RgbImage]) -> Result<Vec<DetectResult>, Self::Error> {
    let call = self.calls.get();
    self.calls.set(call + 1);
    if call == self.fail_on {
      return Err(std::io::Error::other("npu timeout"));
    }
    FixedModel.infer_batch(images)
  }
}

/// 记录交付内容的接收方
#[derive(Default)]
pub struct RecordingSink {
  pub deliveries: Vec<(Vec<[f64; 2]>, Vec<String>)>,
  pub failed_batches: Vec<usize>,
  pub errors: Vec<(ErrorKind, &'static str)>,
}

impl DetectionSink for RecordingSink {
  fn deliver(&mut self, centers: Vec<[f64; 2]>, classes: Vec<String>) {
    self.deliveries.push((centers, classes));
  }

  fn report_failed_batches(&mut self, failures: &[BatchFailure]) {
    self.failed_batches.extend(failures.iter().map(|f| f.batch));
  }

  fn report_error(&mut self, error: &PipelineError) {
    self.errors.push((error.kind(), error.stage()));
  }
}

pub struct Workspace {
  pub dir: tempfile::TempDir,
}

impl Workspace {
  pub fn new() -> Self {
    Self {
      dir: tempfile::tempdir().expect("create temp dir"),
    }
  }

  pub fn path(&self, name: &str) -> PathBuf {
    self.dir.path().join(name)
  }

  /// 15 行、每行 2 帧、每批 10 行的配置
  pub fn config(&self, workers: usize) -> PipelineConfig {
    let stitch = StitchConfig::new(0.8, 180)
      .with_align_width(80)
      .with_max_vertical_shift(4)
      .with_min_overlap(0.25);
    let detect = DetectConfig::new(NonZeroUsize::new(10).unwrap())
      .with_workers(NonZeroUsize::new(workers).unwrap());
    PipelineConfig::new(
      self.path("frames"),
      self.path("batch"),
      NonZeroU32::new(INTERVAL).unwrap(),
      stitch,
      detect,
    )
  }
}

pub fn assert_scratch_removed(config: &PipelineConfig) {
  for dir in config.scratch_dirs() {
    assert!(!dir.exists(), "暂存目录 {} 仍然存在", dir.display());
  }
}
