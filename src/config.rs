// 该文件是 Tianye （田野） 项目的一部分。
// src/config.rs - 管线配置
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

use std::num::{NonZeroU32, NonZeroUsize};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::{error::ErrorKind, url_path};

/// 偏移表默认文件名（位于拼接暂存目录内）
pub const OFFSET_FILE_NAME: &str = "batch_offsets.json";
/// 批次计划默认文件名（位于拼接暂存目录内）
pub const PLAN_FILE_NAME: &str = "batch_plan.json";

const DEFAULT_MIN_OVERLAP: f32 = 0.25;
const DEFAULT_MAX_VERTICAL_SHIFT: u32 = 16;
const DEFAULT_ALIGN_WIDTH: u32 = 320;
const DEFAULT_SCORE_THRESHOLD: f32 = 0.5;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
  #[error("配置项 {field} 无效: {reason}")]
  InvalidValue { field: &'static str, reason: String },
  #[error("暂存路径冲突: {0} 与 {1}")]
  ConflictingPaths(PathBuf, PathBuf),
}

impl ConfigError {
  fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
    ConfigError::InvalidValue {
      field,
      reason: reason.into(),
    }
  }

  pub fn kind(&self) -> ErrorKind {
    ErrorKind::InvalidInput
  }
}

/// 行拼接配置
///
/// `min_confidence` 与 `max_row_width` 没有内置默认值，必须由调用方给出。
#[derive(Debug, Clone, PartialEq)]
pub struct StitchConfig {
  /// 对齐置信度（ZNCC）下限，取值 [-1, 1]；低于该值视为对齐失败
  pub min_confidence: f32,
  /// 单行最大宽度（像素），超出时封存当前行
  pub max_row_width: u32,
  /// 对齐模板条带宽度占帧宽的比例，取值 (0, 1]
  pub min_overlap: f32,
  /// 全分辨率下允许的最大纵向偏移（像素）
  pub max_vertical_shift: u32,
  /// 粗对齐时帧缩放到的目标宽度（像素）
  pub align_width: u32,
}

impl StitchConfig {
  pub fn new(min_confidence: f32, max_row_width: u32) -> Self {
    Self {
      min_confidence,
      max_row_width,
      min_overlap: DEFAULT_MIN_OVERLAP,
      max_vertical_shift: DEFAULT_MAX_VERTICAL_SHIFT,
      align_width: DEFAULT_ALIGN_WIDTH,
    }
  }

  pub fn with_min_overlap(mut self, min_overlap: f32) -> Self {
    self.min_overlap = min_overlap;
    self
  }

  pub fn with_max_vertical_shift(mut self, max_vertical_shift: u32) -> Self {
    self.max_vertical_shift = max_vertical_shift;
    self
  }

  pub fn with_align_width(mut self, align_width: u32) -> Self {
    self.align_width = align_width;
    self
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if !(-1.0..=1.0).contains(&self.min_confidence) {
      return Err(ConfigError::invalid(
        "min_confidence",
        format!("必须位于 [-1, 1]，实际为 {}", self.min_confidence),
      ));
    }
    if self.max_row_width == 0 {
      return Err(ConfigError::invalid("max_row_width", "必须大于 0"));
    }
    if !(self.min_overlap > 0.0 && self.min_overlap <= 1.0) {
      return Err(ConfigError::invalid(
        "min_overlap",
        format!("必须位于 (0, 1]，实际为 {}", self.min_overlap),
      ));
    }
    if self.align_width < 16 {
      return Err(ConfigError::invalid(
        "align_width",
        format!("至少为 16 像素，实际为 {}", self.align_width),
      ));
    }
    Ok(())
  }
}

/// 批量检测配置
#[derive(Debug, Clone, PartialEq)]
pub struct DetectConfig {
  /// 每批次包含的行数
  pub batch_size: NonZeroUsize,
  /// 并行工作线程数
  pub workers: NonZeroUsize,
  /// 置信度阈值，低于该值的检测结果被丢弃
  pub score_threshold: f32,
  /// 同类别 NMS 的 IoU 阈值，`None` 表示不做抑制
  pub nms_threshold: Option<f32>,
  /// 单批次推理失败后的重试次数
  pub retries: u32,
}

impl DetectConfig {
  pub fn new(batch_size: NonZeroUsize) -> Self {
    Self {
      batch_size,
      workers: NonZeroUsize::MIN,
      score_threshold: DEFAULT_SCORE_THRESHOLD,
      nms_threshold: None,
      retries: 0,
    }
  }

  pub fn with_workers(mut self, workers: NonZeroUsize) -> Self {
    self.workers = workers;
    self
  }

  pub fn with_score_threshold(mut self, score_threshold: f32) -> Self {
    self.score_threshold = score_threshold;
    self
  }

  pub fn with_nms_threshold(mut self, nms_threshold: Option<f32>) -> Self {
    self.nms_threshold = nms_threshold;
    self
  }

  pub fn with_retries(mut self, retries: u32) -> Self {
    self.retries = retries;
    self
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&self.score_threshold) {
      return Err(ConfigError::invalid(
        "score_threshold",
        format!("必须位于 [0, 1]，实际为 {}", self.score_threshold),
      ));
    }
    if let Some(iou) = self.nms_threshold
      && !(iou > 0.0 && iou <= 1.0)
    {
      return Err(ConfigError::invalid(
        "nms_threshold",
        format!("必须位于 (0, 1]，实际为 {}", iou),
      ));
    }
    Ok(())
  }
}

/// 单次管线运行的完整配置
///
/// 所有暂存路径都显式给出，生命周期限定在一次运行之内。
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
  pub frames_dir: PathBuf,
  pub stitched_dir: PathBuf,
  pub offset_file: PathBuf,
  pub plan_file: PathBuf,
  pub frame_interval: NonZeroU32,
  pub stitch: StitchConfig,
  pub detect: DetectConfig,
  /// 标注输出，例如 `folder:///path?record=id&always`；设置后行图像连同检测框一并保存
  pub annotate: Option<url::Url>,
}

impl PipelineConfig {
  pub fn new(
    frames_dir: impl Into<PathBuf>,
    stitched_dir: impl Into<PathBuf>,
    frame_interval: NonZeroU32,
    stitch: StitchConfig,
    detect: DetectConfig,
  ) -> Self {
    let stitched_dir = stitched_dir.into();
    Self {
      frames_dir: frames_dir.into(),
      offset_file: stitched_dir.join(OFFSET_FILE_NAME),
      plan_file: stitched_dir.join(PLAN_FILE_NAME),
      stitched_dir,
      frame_interval,
      stitch,
      detect,
      annotate: None,
    }
  }

  pub fn with_offset_file(mut self, offset_file: impl Into<PathBuf>) -> Self {
    self.offset_file = offset_file.into();
    self
  }

  pub fn with_plan_file(mut self, plan_file: impl Into<PathBuf>) -> Self {
    self.plan_file = plan_file.into();
    self
  }

  pub fn with_annotate(mut self, annotate: Option<url::Url>) -> Self {
    self.annotate = annotate;
    self
  }

  /// 暂存目录（运行结束时会被整体删除）
  pub fn scratch_dirs(&self) -> [&Path; 2] {
    [&self.frames_dir, &self.stitched_dir]
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    for dir in self.scratch_dirs() {
      if dir.as_os_str().is_empty() {
        return Err(ConfigError::invalid("scratch_dir", "路径不能为空"));
      }
    }
    // 暂存目录会被整体删除，互相嵌套会误删对方
    if self.frames_dir.starts_with(&self.stitched_dir)
      || self.stitched_dir.starts_with(&self.frames_dir)
    {
      return Err(ConfigError::ConflictingPaths(
        self.frames_dir.clone(),
        self.stitched_dir.clone(),
      ));
    }
    if self.offset_file == self.plan_file {
      return Err(ConfigError::ConflictingPaths(
        self.offset_file.clone(),
        self.plan_file.clone(),
      ));
    }
    if let Some(annotate) = &self.annotate {
      let annotate_dir = url_path(annotate);
      for dir in self.scratch_dirs() {
        if annotate_dir.starts_with(dir) {
          return Err(ConfigError::ConflictingPaths(
            annotate_dir,
            dir.to_path_buf(),
          ));
        }
      }
    }
    self.stitch.validate()?;
    self.detect.validate()?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn config() -> PipelineConfig {
    PipelineConfig::new(
      "/tmp/run/frames",
      "/tmp/run/batch",
      NonZeroU32::new(8).unwrap(),
      StitchConfig::new(0.6, 4096),
      DetectConfig::new(NonZeroUsize::new(10).unwrap()),
    )
  }

  #[test]
  fn offset_and_plan_files_default_into_stitched_dir() {
    let config = config();
    assert_eq!(
      config.offset_file,
      PathBuf::from("/tmp/run/batch/batch_offsets.json")
    );
    assert_eq!(config.plan_file, PathBuf::from("/tmp/run/batch/batch_plan.json"));
    assert!(config.validate().is_ok());
  }

  #[test]
  fn nested_scratch_dirs_are_rejected() {
    let mut config = config();
    config.frames_dir = PathBuf::from("/tmp/run/batch/frames");
    assert!(matches!(
      config.validate(),
      Err(ConfigError::ConflictingPaths(..))
    ));
  }

  #[test]
  fn annotate_dir_inside_scratch_is_rejected() {
    let inside = url::Url::parse("folder:///tmp/run/frames/out?always").unwrap();
    let config = config().with_annotate(Some(inside));
    assert!(matches!(
      config.validate(),
      Err(ConfigError::ConflictingPaths(..))
    ));
    let outside = url::Url::parse("folder:///tmp/annotated").unwrap();
    assert!(config.with_annotate(Some(outside)).validate().is_ok());
  }

  #[test]
  fn stitch_thresholds_are_range_checked() {
    assert!(StitchConfig::new(1.5, 100).validate().is_err());
    assert!(StitchConfig::new(0.5, 0).validate().is_err());
    assert!(
      StitchConfig::new(0.5, 100)
        .with_min_overlap(0.0)
        .validate()
        .is_err()
    );
    assert!(
      StitchConfig::new(0.5, 100)
        .with_align_width(8)
        .validate()
        .is_err()
    );
  }

  #[test]
  fn detect_thresholds_are_range_checked() {
    let detect = DetectConfig::new(NonZeroUsize::MIN);
    assert!(detect.clone().with_score_threshold(1.2).validate().is_err());
    assert!(detect.clone().with_nms_threshold(Some(0.0)).validate().is_err());
    assert!(detect.with_nms_threshold(Some(0.45)).validate().is_ok());
  }
}
