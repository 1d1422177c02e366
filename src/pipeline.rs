// 该文件是 Tianye （田野） 项目的一部分。
// src/pipeline.rs - 管线编排
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

//! # 管线编排
//!
//! 严格按 抽帧 → 拼接 → 检测 的顺序执行。暂存目录由 [`ScratchGuard`] 持有，
//! 无论成功、失败还是 panic，离开作用域时都会被删除。

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
  FromUrl,
  config::{ConfigError, PipelineConfig},
  detect::{BatchDetector, DetectError, DetectionRun, Detections},
  error::ErrorKind,
  input::{FrameExtractError, FrameExtractor, InputWrapper, VideoSource},
  model::{Labels, ModelFactory},
  offset::{OffsetTable, OffsetTableError},
  output::DetectionSink,
  stitch::{RowStitcher, StitchError},
  task::{CancelToken, Task},
};

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("配置错误: {0}")]
  Config(#[from] ConfigError),
  #[error("抽帧失败: {0}")]
  Extract(#[from] FrameExtractError),
  #[error("拼接失败: {0}")]
  Stitch(#[from] StitchError),
  #[error("检测失败: {0}")]
  Detect(#[from] DetectError),
  #[error("偏移表错误: {0}")]
  OffsetTable(#[from] OffsetTableError),
  #[error("暂存目录 {path} 处理失败: {source}")]
  Scratch {
    path: PathBuf,
    source: std::io::Error,
  },
}

impl PipelineError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      PipelineError::Config(e) => e.kind(),
      PipelineError::Extract(e) => e.kind(),
      PipelineError::Stitch(e) => e.kind(),
      PipelineError::Detect(e) => e.kind(),
      PipelineError::OffsetTable(e) => e.kind(),
      PipelineError::Scratch { .. } => ErrorKind::Io,
    }
  }

  /// 出错的阶段
  pub fn stage(&self) -> &'static str {
    match self {
      PipelineError::Config(_) => "config",
      PipelineError::Extract(_) => "extract",
      PipelineError::Stitch(_) => "stitch",
      PipelineError::Detect(_) | PipelineError::OffsetTable(_) => "detect",
      PipelineError::Scratch { .. } => "scratch",
    }
  }
}

/// 暂存目录守卫
///
/// 创建时删除上次运行遗留的同名目录并重新创建，析构时删除。
#[derive(Debug)]
pub struct ScratchGuard {
  paths: Vec<PathBuf>,
}

impl ScratchGuard {
  pub fn prepare(paths: &[&Path]) -> Result<Self, PipelineError> {
    let guard = Self {
      paths: paths.iter().map(|p| p.to_path_buf()).collect(),
    };
    for path in &guard.paths {
      if path.exists() {
        warn!("删除遗留的暂存目录 {}", path.display());
        std::fs::remove_dir_all(path).map_err(|source| PipelineError::Scratch {
          path: path.clone(),
          source,
        })?;
      }
      std::fs::create_dir_all(path).map_err(|source| PipelineError::Scratch {
        path: path.clone(),
        source,
      })?;
    }
    Ok(guard)
  }

  pub fn paths(&self) -> &[PathBuf] {
    &self.paths
  }

  /// 立即删除暂存目录；可重复调用
  pub fn cleanup(&mut self) {
    for path in self.paths.drain(..) {
      match std::fs::remove_dir_all(&path) {
        Ok(()) => info!("已删除暂存目录 {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => error!("删除暂存目录 {} 失败: {}", path.display(), e),
      }
    }
  }
}

impl Drop for ScratchGuard {
  fn drop(&mut self) {
    self.cleanup();
  }
}

/// 抽帧 → 拼接 → 检测 管线
pub struct Pipeline {
  config: PipelineConfig,
  labels: Labels,
  cancel: CancelToken,
}

impl Pipeline {
  pub fn new(config: PipelineConfig) -> Self {
    Self {
      config,
      labels: Labels::default(),
      cancel: CancelToken::new(),
    }
  }

  pub fn with_labels(mut self, labels: Labels) -> Self {
    self.labels = labels;
    self
  }

  pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
    self.cancel = cancel;
    self
  }

  pub fn config(&self) -> &PipelineConfig {
    &self.config
  }

  pub fn cancel_token(&self) -> &CancelToken {
    &self.cancel
  }

  /// 完整运行一次管线
  ///
  /// 成功时先把检测结果（以及失败的批次）交给 `sink`，再删除暂存目录；
  /// 失败时先删除暂存目录，再向 `sink` 交付空列表与错误。
  pub fn run<S, F, K>(&self, source: S, factory: &F, sink: &mut K) -> Result<DetectionRun, PipelineError>
  where
    S: VideoSource,
    F: ModelFactory,
    K: DetectionSink + ?Sized,
  {
    match self.run_guarded(source, factory) {
      Ok((mut guard, run)) => {
        sink.deliver(run.detections.centers(), run.detections.classes());
        if !run.is_complete() {
          sink.report_failed_batches(&run.failed_batches);
        }
        guard.cleanup();
        Ok(run)
      }
      Err(e) => Err(Self::fail(sink, e)),
    }
  }

  /// 从 URL 打开视频后运行管线；无法打开视频同样通过 `sink` 报告
  pub fn run_url<F, K>(&self, input: &url::Url, factory: &F, sink: &mut K) -> Result<DetectionRun, PipelineError>
  where
    F: ModelFactory,
    K: DetectionSink + ?Sized,
  {
    match InputWrapper::from_url(input) {
      Ok(source) => self.run(source, factory, sink),
      Err(e) => Err(Self::fail(sink, e.into())),
    }
  }

  fn fail<K: DetectionSink + ?Sized>(sink: &mut K, e: PipelineError) -> PipelineError {
    error!("管线在 {} 阶段失败 ({}): {}", e.stage(), e.kind(), e);
    sink.fail(&e);
    e
  }

  fn run_guarded<S: VideoSource, F: ModelFactory>(
    &self,
    source: S,
    factory: &F,
  ) -> Result<(ScratchGuard, DetectionRun), PipelineError> {
    self.config.validate()?;
    let guard = ScratchGuard::prepare(&self.config.scratch_dirs())?;
    let table = self.stitch_rows(source)?;
    let run = self.detect(&table, factory)?;
    Ok((guard, run))
  }

  /// 只执行抽帧与拼接，保留暂存目录供之后 [`Pipeline::redetect`] 使用
  ///
  /// 暂存目录由调用方负责删除（见 [`Pipeline::cleanup`]）。
  pub fn stitch<S: VideoSource>(&self, source: S) -> Result<OffsetTable, PipelineError> {
    self.config.validate()?;
    let mut guard = ScratchGuard::prepare(&self.config.scratch_dirs())?;
    let table = self.stitch_rows(source)?;
    // 成功后解除守卫，保留行图像与偏移表
    guard.paths.clear();
    Ok(table)
  }

  /// 只重新执行检测阶段，使用已落盘的行图像与偏移表
  pub fn redetect<F: ModelFactory>(&self, factory: &F) -> Result<DetectionRun, PipelineError> {
    self.config.validate()?;
    let table = OffsetTable::load(&self.config.offset_file)?;
    self.detect(&table, factory)
  }

  /// 删除本管线的暂存目录
  pub fn cleanup(&self) {
    ScratchGuard {
      paths: self
        .config
        .scratch_dirs()
        .iter()
        .map(|p| p.to_path_buf())
        .collect(),
    }
    .cleanup();
  }

  fn stitch_rows<S: VideoSource>(&self, source: S) -> Result<OffsetTable, PipelineError> {
    let config = &self.config;
    let extractor = FrameExtractor::new(&config.frames_dir, config.frame_interval.get())?;
    let manifest = extractor.extract(source, &self.cancel)?;
    let stitcher = RowStitcher::new(
      config.stitch.clone(),
      &config.stitched_dir,
      &config.offset_file,
    );
    Ok(stitcher.stitch(&config.frames_dir, &manifest.frames, &self.cancel)?)
  }

  fn detect<F: ModelFactory>(&self, table: &OffsetTable, factory: &F) -> Result<DetectionRun, PipelineError> {
    let config = &self.config;
    let detector = BatchDetector::new(config.detect.clone(), &config.stitched_dir, &config.plan_file)
      .with_labels(self.labels.clone());
    let run = detector.detect(table, factory, &self.cancel)?;
    self.annotate(table, &run.detections);
    Ok(run)
  }

  #[cfg(feature = "directory_record")]
  fn annotate(&self, table: &OffsetTable, detections: &Detections) {
    use crate::output::{AnnotatedRow, DirectoryRecordOutput, Render};

    let Some(url) = &self.config.annotate else {
      return;
    };
    let output = match DirectoryRecordOutput::from_url(url) {
      Ok(output) => output,
      Err(e) => {
        warn!("无法创建标注输出 {}: {}", url, e);
        return;
      }
    };
    for row in table.rows() {
      let image = match image::open(self.config.stitched_dir.join(&row.image)) {
        Ok(image) => image.into_rgb8(),
        Err(e) => {
          warn!("无法读取行 {} 的图像: {}", row.row, e);
          continue;
        }
      };
      let annotated = AnnotatedRow {
        row,
        detections: detections.iter().filter(|d| d.row == row.row).collect(),
      };
      if let Err(e) = output.render_result(&image, &annotated) {
        warn!("保存行 {} 的标注结果失败: {}", row.row, e);
      }
    }
  }

  #[cfg(not(feature = "directory_record"))]
  fn annotate(&self, _table: &OffsetTable, _detections: &Detections) {
    if self.config.annotate.is_some() {
      warn!("未启用 directory_record 特性，忽略标注输出");
    }
  }
}

impl<'f, 'k, S, F, K> Task<S, &'f F, &'k mut K> for &Pipeline
where
  S: VideoSource,
  F: ModelFactory,
  K: DetectionSink + ?Sized,
{
  type Output = DetectionRun;
  type Error = PipelineError;

  fn run_task(self, input: S, model: &'f F, output: &'k mut K) -> Result<Self::Output, Self::Error> {
    self.run(input, model, output)
  }
}
