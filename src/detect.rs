// 该文件是 Tianye （田野） 项目的一部分。
// src/detect.rs - 批量检测与重投影
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

//! # 批量检测
//!
//! 按批次计划把行图像送入模型，再用偏移表把局部检测结果重投影到全局坐标。
//! 批次之间相互独立：单个批次推理失败只丢弃该批次的结果。
//!
//! 批次在 rayon 线程池上并行执行，每个工作分片持有一个由工厂创建的模型实例。
//! 结果按批次编号收集，输出顺序与完成顺序无关。
//! 某个分片创建模型失败时，其批次交由下一轮重新分配；
//! 只有一轮中所有分片都无法创建模型时才整体失败。

use std::path::PathBuf;

use image::RgbImage;
use rayon::prelude::*;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  config::{ConfigError, DetectConfig},
  error::ErrorKind,
  model::{DetectItem, Labels, Model, ModelFactory, non_max_suppression},
  offset::{OffsetTable, RowRecord},
  task::{CancelToken, Cancelled},
};

mod plan;
pub use self::plan::{BatchMember, BatchPlan, BatchRecord, PlanError, reproject};

#[derive(Error, Debug)]
pub enum DetectError {
  #[error("检测配置无效: {0}")]
  InvalidConfig(#[from] ConfigError),
  #[error("批次计划错误: {0}")]
  Plan(#[from] PlanError),
  #[error("模型创建失败: {0}")]
  ModelInit(String),
  #[error("无法创建检测线程池: {0}")]
  ThreadPool(#[from] rayon::ThreadPoolBuildError),
  #[error(transparent)]
  Cancelled(#[from] Cancelled),
}

impl DetectError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      DetectError::InvalidConfig(_) | DetectError::ModelInit(_) => ErrorKind::InvalidInput,
      DetectError::Plan(e) => e.kind(),
      DetectError::ThreadPool(_) => ErrorKind::Io,
      DetectError::Cancelled(_) => ErrorKind::Cancelled,
    }
  }
}

/// 单个批次的推理失败
#[derive(Error, Debug)]
pub enum InferenceFailure {
  #[error("偏移表中没有第 {0} 行")]
  MissingRow(usize),
  #[error("无法读取行图像 {path}: {source}")]
  RowImage {
    path: PathBuf,
    source: image::ImageError,
  },
  #[error("模型推理失败: {0}")]
  Model(String),
  #[error("模型返回 {actual} 个结果，期望 {expected} 个")]
  ResultCount { expected: usize, actual: usize },
}

impl InferenceFailure {
  pub fn kind(&self) -> ErrorKind {
    ErrorKind::Inference
  }
}

/// 一个全局坐标系下的检测结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
  pub center: [f64; 2],
  /// [x_min, y_min, x_max, y_max]
  pub bbox: [f64; 4],
  pub class: String,
  pub class_id: u32,
  pub score: f32,
  pub batch: usize,
  pub row: usize,
  /// 覆盖该位置的源帧
  pub frame: Option<u64>,
}

impl Detection {
  /// 转回行图像内的像素坐标
  pub fn row_local_bbox(&self, row: &RowRecord) -> [f32; 4] {
    let (ox, oy) = (row.origin[0] as f64, row.origin[1] as f64);
    [
      (self.bbox[0] - ox) as f32,
      (self.bbox[1] - oy) as f32,
      (self.bbox[2] - ox) as f32,
      (self.bbox[3] - oy) as f32,
    ]
  }
}

/// 按批次顺序排列的检测结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Detections(Vec<Detection>);

impl Detections {
  pub fn new(detections: Vec<Detection>) -> Self {
    Self(detections)
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn iter(&self) -> std::slice::Iter<'_, Detection> {
    self.0.iter()
  }

  pub fn as_slice(&self) -> &[Detection] {
    &self.0
  }

  pub fn centers(&self) -> Vec<[f64; 2]> {
    self.0.iter().map(|d| d.center).collect()
  }

  pub fn classes(&self) -> Vec<String> {
    self.0.iter().map(|d| d.class.clone()).collect()
  }

  /// 拆分为顺序一致的中心点列表与类别列表
  pub fn into_parts(self) -> (Vec<[f64; 2]>, Vec<String>) {
    self.0.into_iter().map(|d| (d.center, d.class)).unzip()
  }
}

impl IntoIterator for Detections {
  type Item = Detection;
  type IntoIter = std::vec::IntoIter<Detection>;

  fn into_iter(self) -> Self::IntoIter {
    self.0.into_iter()
  }
}

impl<'a> IntoIterator for &'a Detections {
  type Item = &'a Detection;
  type IntoIter = std::slice::Iter<'a, Detection>;

  fn into_iter(self) -> Self::IntoIter {
    self.0.iter()
  }
}

/// 最终被丢弃的批次
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFailure {
  pub batch: usize,
  pub attempts: u32,
  pub reason: String,
}

/// 一次检测阶段的完整结果
#[derive(Debug, Clone)]
pub struct DetectionRun {
  pub detections: Detections,
  pub failed_batches: Vec<BatchFailure>,
  pub plan: BatchPlan,
}

impl DetectionRun {
  /// 所有批次都已成功推理
  pub fn is_complete(&self) -> bool {
    self.failed_batches.is_empty()
  }
}

type BatchOutcome = Result<Vec<Detection>, BatchFailure>;

enum BatchSlot {
  Done(BatchOutcome),
  /// 尚未执行：所在分片没有可用模型，或任务已取消
  Pending(String),
}

/// 批量检测器
///
/// 只读取偏移表；批次计划写入单独的文件。
pub struct BatchDetector {
  config: DetectConfig,
  stitched_dir: PathBuf,
  plan_file: PathBuf,
  labels: Labels,
}

impl BatchDetector {
  pub fn new(config: DetectConfig, stitched_dir: impl Into<PathBuf>, plan_file: impl Into<PathBuf>) -> Self {
    Self {
      config,
      stitched_dir: stitched_dir.into(),
      plan_file: plan_file.into(),
      labels: Labels::default(),
    }
  }

  pub fn with_labels(mut self, labels: Labels) -> Self {
    self.labels = labels;
    self
  }

  pub fn detect<F: ModelFactory>(
    &self,
    table: &OffsetTable,
    factory: &F,
    cancel: &CancelToken,
  ) -> Result<DetectionRun, DetectError> {
    self.config.validate()?;
    let plan = BatchPlan::prepare(&self.plan_file, table, self.config.batch_size)?;
    let total = plan.batches.len();
    if total == 0 {
      warn!("没有可检测的行");
      return Ok(DetectionRun {
        detections: Detections::default(),
        failed_batches: Vec::new(),
        plan,
      });
    }

    let workers = self.config.workers.get().min(total);
    let pool = rayon::ThreadPoolBuilder::new()
      .num_threads(workers)
      .thread_name(|i| format!("tianye-detect-{}", i))
      .build()?;
    info!("开始检测: {} 个批次, {} 个工作线程", total, workers);

    let mut outcomes: Vec<Option<BatchOutcome>> = (0..total).map(|_| None).collect();
    let mut pending: Vec<usize> = (0..total).collect();
    while !pending.is_empty() {
      // 每个分片创建一个模型，分片数大致等于工作线程数
      let min_len = (pending.len() / workers).max(1);
      let slots: Vec<BatchSlot> = pool.install(|| {
        pending
          .par_iter()
          .with_min_len(min_len)
          .map_init(
            || {
              factory.create().map_err(|e| {
                error!("工作线程创建模型失败: {}", e);
                e.to_string()
              })
            },
            |model, &index| match model {
              _ if cancel.is_cancelled() => BatchSlot::Pending(Cancelled.to_string()),
              Ok(model) => BatchSlot::Done(self.run_batch(&*model, table, &plan.batches[index])),
              Err(reason) => BatchSlot::Pending(reason.clone()),
            },
          )
          .collect()
      });
      cancel.check()?;

      let mut deferred = Vec::new();
      let mut last_reason = String::new();
      for (&index, slot) in pending.iter().zip(slots) {
        match slot {
          BatchSlot::Done(outcome) => outcomes[index] = Some(outcome),
          BatchSlot::Pending(reason) => {
            deferred.push(index);
            last_reason = reason;
          }
        }
      }
      if deferred.len() == pending.len() {
        return Err(DetectError::ModelInit(last_reason));
      }
      if !deferred.is_empty() {
        warn!("{} 个批次因模型创建失败，交由其余工作线程重新处理", deferred.len());
      }
      pending = deferred;
    }

    let mut detections = Vec::new();
    let mut failed_batches = Vec::new();
    for (index, outcome) in outcomes.into_iter().enumerate() {
      match outcome {
        Some(Ok(found)) => detections.extend(found),
        Some(Err(failure)) => failed_batches.push(failure),
        None => failed_batches.push(BatchFailure {
          batch: index,
          attempts: 0,
          reason: "批次未执行".to_string(),
        }),
      }
    }

    if failed_batches.is_empty() {
      info!("检测完成: {} 个目标", detections.len());
    } else {
      warn!(
        "检测完成: {} 个目标, {} 个批次失败 {:?}",
        detections.len(),
        failed_batches.len(),
        failed_batches.iter().map(|f| f.batch).collect::<Vec<_>>()
      );
    }

    Ok(DetectionRun {
      detections: Detections::new(detections),
      failed_batches,
      plan,
    })
  }

  fn run_batch<M: Model>(&self, model: &M, table: &OffsetTable, batch: &BatchRecord) -> BatchOutcome {
    let attempts = self.config.retries + 1;
    let mut last_error = String::new();
    for attempt in 1..=attempts {
      match self.infer_batch(model, table, batch) {
        Ok(found) => {
          debug!("批次 {}: {} 个目标", batch.batch, found.len());
          return Ok(found);
        }
        Err(e) => {
          warn!(
            "批次 {} 第 {}/{} 次推理失败: {}",
            batch.batch, attempt, attempts, e
          );
          last_error = e.to_string();
        }
      }
    }
    error!("批次 {} 推理失败，丢弃该批次结果: {}", batch.batch, last_error);
    Err(BatchFailure {
      batch: batch.batch,
      attempts,
      reason: last_error,
    })
  }

  fn infer_batch<M: Model>(
    &self,
    model: &M,
    table: &OffsetTable,
    batch: &BatchRecord,
  ) -> Result<Vec<Detection>, InferenceFailure> {
    let rows = batch
      .members
      .iter()
      .map(|member| table.row(member.row).ok_or(InferenceFailure::MissingRow(member.row)))
      .collect::<Result<Vec<_>, _>>()?;
    let images = rows
      .iter()
      .map(|row| {
        let path = self.stitched_dir.join(&row.image);
        image::open(&path)
          .map(|image| image.into_rgb8())
          .map_err(|source| InferenceFailure::RowImage { path, source })
      })
      .collect::<Result<Vec<RgbImage>, _>>()?;
    let refs: Vec<&RgbImage> = images.iter().collect();

    let results = model
      .infer_batch(&refs)
      .map_err(|e| InferenceFailure::Model(e.to_string()))?;
    if results.len() != refs.len() {
      return Err(InferenceFailure::ResultCount {
        expected: refs.len(),
        actual: results.len(),
      });
    }

    let mut found = Vec::new();
    for ((member, row), result) in batch.members.iter().zip(&rows).zip(results) {
      let items: Vec<DetectItem> = result
        .items
        .into_vec()
        .into_iter()
        .filter(|item| item.score >= self.config.score_threshold)
        .collect();
      let items = match self.config.nms_threshold {
        Some(iou) => non_max_suppression(items, iou),
        None => items,
      };
      for item in items {
        found.push(self.to_global(batch, member, row, &item));
      }
    }
    Ok(found)
  }

  fn to_global(&self, batch: &BatchRecord, member: &BatchMember, row: &RowRecord, item: &DetectItem) -> Detection {
    let [cx, cy] = item.center();
    let [x0, y0] = reproject(batch.origin, member.offset, [item.bbox[0] as f64, item.bbox[1] as f64]);
    let [x1, y1] = reproject(batch.origin, member.offset, [item.bbox[2] as f64, item.bbox[3] as f64]);
    Detection {
      center: reproject(batch.origin, member.offset, [cx as f64, cy as f64]),
      bbox: [x0, y0, x1, y1],
      class: self.labels.name(item.class_id),
      class_id: item.class_id,
      score: item.score,
      batch: batch.batch,
      row: row.row,
      frame: row.frame_at(cx as f64),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::DetectResult;
  use crate::offset::{FramePlacement, OffsetEntry, RowAnchor};
  use std::num::NonZeroUsize;

  struct CornerModel;

  impl Model for CornerModel {
    type Error = std::io::Error;

    fn infer(&self, image: &RgbImage) -> Result<DetectResult, Self::Error> {
      if image.get_pixel(0, 0)[0] == 255 {
        return Err(std::io::Error::other("poisoned row"));
      }
      Ok(DetectResult {
        items: vec![
          DetectItem {
            class_id: 1,
            score: 0.9,
            bbox: [2.0, 4.0, 6.0, 8.0],
          },
          DetectItem {
            class_id: 0,
            score: 0.1,
            bbox: [0.0, 0.0, 1.0, 1.0],
          },
        ]
        .into_boxed_slice(),
      })
    }
  }

  fn fixture(poisoned_row: Option<usize>) -> (tempfile::TempDir, OffsetTable) {
    let dir = tempfile::tempdir().unwrap();
    let entries = (0..5).map(|i| {
      let value = if Some(i) == poisoned_row { 255 } else { 10 };
      let file = format!("row_{:04}.png", i);
      RgbImage::from_pixel(20, 10, image::Rgb([value, 0, 0]))
        .save(dir.path().join(&file))
        .unwrap();
      OffsetEntry::Row(RowRecord {
        row: i,
        image: file,
        origin: [i as i64 * 20, 1],
        width: 20,
        height: 10,
        anchor: RowAnchor::Estimated,
        frames: vec![
          FramePlacement {
            frame: i as u64 * 2,
            offset: [0, 0],
            confidence: None,
          },
          FramePlacement {
            frame: i as u64 * 2 + 1,
            offset: [3, 0],
            confidence: Some(0.9),
          },
        ],
      })
    });
    let table = OffsetTable::from_entries(entries.collect::<Vec<_>>()).unwrap();
    (dir, table)
  }

  fn detector(dir: &std::path::Path, workers: usize) -> BatchDetector {
    BatchDetector::new(
      DetectConfig::new(NonZeroUsize::new(2).unwrap())
        .with_workers(NonZeroUsize::new(workers).unwrap())
        .with_retries(1),
      dir,
      dir.join("batch_plan.json"),
    )
    .with_labels(Labels::new(vec!["soil".into(), "sprout".into()]))
  }

  #[test]
  fn detections_are_reprojected_in_batch_order() {
    let (dir, table) = fixture(None);
    let run = detector(dir.path(), 3)
      .detect(&table, &|| Ok::<_, std::io::Error>(CornerModel), &CancelToken::new())
      .unwrap();
    assert!(run.failed_batches.is_empty());
    let centers = run.detections.centers();
    assert_eq!(centers.len(), 5);
    for (i, center) in centers.iter().enumerate() {
      assert_eq!(*center, [i as f64 * 20.0 + 4.0, 7.0]);
    }
    let first = &run.detections.as_slice()[0];
    assert_eq!(first.class, "sprout");
    assert_eq!(first.frame, Some(1));
    assert_eq!(first.bbox, [2.0, 5.0, 6.0, 9.0]);
    assert_eq!(run.detections.as_slice()[4].batch, 2);
  }

  #[test]
  fn failing_batch_is_dropped_after_retries() {
    let (dir, table) = fixture(Some(2));
    let run = detector(dir.path(), 2)
      .detect(&table, &|| Ok::<_, std::io::Error>(CornerModel), &CancelToken::new())
      .unwrap();
    assert_eq!(run.failed_batches.len(), 1);
    assert_eq!(run.failed_batches[0].batch, 1);
    assert_eq!(run.failed_batches[0].attempts, 2);
    let rows: Vec<usize> = run.detections.iter().map(|d| d.row).collect();
    assert_eq!(rows, vec![0, 1, 4]);
  }

  #[test]
  fn model_creation_failure_is_invalid_input() {
    let (dir, table) = fixture(None);
    let err = detector(dir.path(), 2)
      .detect(
        &table,
        &|| Err::<CornerModel, _>(std::io::Error::other("no such model")),
        &CancelToken::new(),
      )
      .unwrap_err();
    assert!(matches!(err, DetectError::ModelInit(_)));
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
  }

  #[test]
  fn one_failed_model_does_not_abort_the_stage() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let (dir, table) = fixture(None);
    let calls = AtomicUsize::new(0);
    let factory = || {
      if calls.fetch_add(1, Ordering::SeqCst) == 1 {
        Err(std::io::Error::other("npu core busy"))
      } else {
        Ok(CornerModel)
      }
    };
    let detector = BatchDetector::new(
      DetectConfig::new(NonZeroUsize::MIN).with_workers(NonZeroUsize::new(2).unwrap()),
      dir.path(),
      dir.path().join("batch_plan.json"),
    );
    let run = detector
      .detect(&table, &factory, &CancelToken::new())
      .unwrap();
    assert!(run.failed_batches.is_empty());
    let rows: Vec<usize> = run.detections.iter().map(|d| d.row).collect();
    assert_eq!(rows, vec![0, 1, 2, 3, 4]);
  }

  #[test]
  fn cancelled_detection_reports_cancelled() {
    let (dir, table) = fixture(None);
    let cancel = CancelToken::new();
    cancel.cancel();
    let err = detector(dir.path(), 1)
      .detect(&table, &|| Ok::<_, std::io::Error>(CornerModel), &cancel)
      .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
  }
}
