// 该文件是 Tianye （田野） 项目的一部分。
// src/output.rs - 检测结果输出
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

use std::io::Write;

use serde_json::json;
use tracing::error;

use crate::{
  detect::{BatchFailure, Detection},
  offset::RowRecord,
  pipeline::PipelineError,
};

pub trait Render<Frame, Output>: Sized {
  type Error;
  fn render_result(&self, frame: &Frame, result: &Output) -> Result<(), Self::Error>;
}

/// 一行及落在该行上的检测结果
pub struct AnnotatedRow<'a> {
  pub row: &'a RowRecord,
  pub detections: Vec<&'a Detection>,
}

#[cfg(feature = "save_image_file")]
pub mod draw;

#[cfg(feature = "directory_record")]
mod directory_record;
#[cfg(feature = "directory_record")]
pub use self::directory_record::{DirectoryRecordOutput, DirectoryRecordOutputError};

/// 检测结果的接收方
///
/// 管线成功时交付全局中心点与类别两个顺序一致的列表，
/// 若有批次推理失败，随后报告这些批次；
/// 失败时交付两个空列表，并附带错误。
pub trait DetectionSink {
  fn deliver(&mut self, centers: Vec<[f64; 2]>, classes: Vec<String>);

  fn report_failed_batches(&mut self, _failures: &[BatchFailure]) {}

  fn report_error(&mut self, _error: &PipelineError) {}

  /// 交付空结果并报告错误
  fn fail(&mut self, error: &PipelineError) {
    self.deliver(Vec::new(), Vec::new());
    self.report_error(error);
  }
}

impl DetectionSink for () {
  fn deliver(&mut self, _centers: Vec<[f64; 2]>, _classes: Vec<String>) {}
}

/// 以带 `identifier` 字段的 JSON 对象（每行一个）输出结果
pub struct JsonEnvelopeSink<W: Write> {
  writer: W,
}

impl<W: Write> JsonEnvelopeSink<W> {
  pub fn new(writer: W) -> Self {
    Self { writer }
  }

  pub fn into_inner(self) -> W {
    self.writer
  }

  fn emit(&mut self, value: serde_json::Value) {
    let result = serde_json::to_writer(&mut self.writer, &value)
      .map_err(std::io::Error::from)
      .and_then(|_| self.writer.write_all(b"\n"))
      .and_then(|_| self.writer.flush());
    if let Err(e) = result {
      error!("输出检测结果失败: {}", e);
    }
  }
}

impl<W: Write> DetectionSink for JsonEnvelopeSink<W> {
  fn deliver(&mut self, centers: Vec<[f64; 2]>, classes: Vec<String>) {
    self.emit(json!({
      "identifier": "detections",
      "centers": centers,
      "classes": classes,
    }));
  }

  fn report_failed_batches(&mut self, failures: &[BatchFailure]) {
    self.emit(json!({
      "identifier": "failed_batches",
      "batches": failures,
    }));
  }

  fn report_error(&mut self, error: &PipelineError) {
    self.emit(json!({
      "identifier": "error",
      "kind": error.kind().to_string(),
      "stage": error.stage(),
      "message": error.to_string(),
    }));
  }
}
