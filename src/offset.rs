// 该文件是 Tianye （田野） 项目的一部分。
// src/offset.rs - 偏移表
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

//! # 偏移表
//!
//! 偏移表是拼接阶段与检测阶段之间唯一的连接：每封存一行，追加一条行记录；
//! 每丢弃一帧，追加一条丢弃记录。文件为 JSON Lines，只追加，每条记录写入后立即落盘，
//! 因此两阶段可以分属不同进程，或在任一阶段之后重启。
//!
//! 行记录中的 `origin` 是行图像左上角在全局坐标系中的位置，
//! `frames[i].offset` 是第 i 帧左上角在行图像中的位置。

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::error::ErrorKind;

#[derive(Error, Debug)]
pub enum OffsetTableError {
  #[error("偏移表 {path} 读写失败: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("偏移表第 {line} 行解析失败: {source}")]
  Parse {
    line: usize,
    source: serde_json::Error,
  },
  #[error("偏移表无效: {0}")]
  Invalid(String),
}

impl OffsetTableError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      OffsetTableError::Io { .. } => ErrorKind::Io,
      _ => ErrorKind::InvalidInput,
    }
  }

  fn io(path: &Path, source: std::io::Error) -> Self {
    OffsetTableError::Io {
      path: path.to_path_buf(),
      source,
    }
  }
}

/// 一帧在行内的放置位置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FramePlacement {
  pub frame: u64,
  pub offset: [i64; 2],
  /// 与前一帧对齐的置信度；行的种子帧为 `None`
  pub confidence: Option<f32>,
}

/// 行原点的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowAnchor {
  /// 第一行，位于全局原点
  Origin,
  /// 种子帧与上一行对齐成功，原点精确
  Aligned,
  /// 对齐中断，原点接在上一行右侧，属于估计值
  Estimated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowRecord {
  pub row: usize,
  /// 行图像文件名（相对拼接暂存目录）
  pub image: String,
  pub origin: [i64; 2],
  pub width: u32,
  pub height: u32,
  pub anchor: RowAnchor,
  pub frames: Vec<FramePlacement>,
}

impl RowRecord {
  /// 找出覆盖行内横坐标 `local_x` 的源帧（后放置的帧覆盖先放置的帧）
  pub fn frame_at(&self, local_x: f64) -> Option<u64> {
    self
      .frames
      .iter()
      .rev()
      .find(|placement| placement.offset[0] as f64 <= local_x)
      .map(|placement| placement.frame)
  }

  pub fn first_frame(&self) -> Option<u64> {
    self.frames.first().map(|placement| placement.frame)
  }

  pub fn last_frame(&self) -> Option<u64> {
    self.frames.last().map(|placement| placement.frame)
  }
}

/// 帧被丢弃的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
  /// 无法从暂存目录读回
  Unreadable,
  /// 尺寸与本次运行的首帧不一致
  SizeMismatch,
  /// 孤立的对齐失败帧（前后帧可以直接对齐）
  Unaligned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedFrame {
  pub frame: u64,
  pub reason: DropReason,
  pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OffsetEntry {
  Row(RowRecord),
  Dropped(DroppedFrame),
}

/// 偏移表追加写入器
pub struct OffsetTableWriter {
  path: PathBuf,
  file: File,
}

impl OffsetTableWriter {
  /// 新建（或截断）偏移表文件
  pub fn create(path: impl Into<PathBuf>) -> Result<Self, OffsetTableError> {
    let path = path.into();
    if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent).map_err(|e| OffsetTableError::io(&path, e))?;
    }
    let file = OpenOptions::new()
      .create(true)
      .write(true)
      .truncate(true)
      .open(&path)
      .map_err(|e| OffsetTableError::io(&path, e))?;
    Ok(Self { path, file })
  }

  /// 追加一条记录并落盘
  pub fn append(&mut self, entry: &OffsetEntry) -> Result<(), OffsetTableError> {
    let mut line = serde_json::to_vec(entry).map_err(|e| OffsetTableError::Invalid(e.to_string()))?;
    line.push(b'\n');
    self
      .file
      .write_all(&line)
      .and_then(|_| self.file.sync_data())
      .map_err(|e| OffsetTableError::io(&self.path, e))
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

/// 偏移表
///
/// 拼接阶段写入，检测阶段只读。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OffsetTable {
  rows: Vec<RowRecord>,
  dropped: Vec<DroppedFrame>,
}

impl OffsetTable {
  /// 由记录构建偏移表并检查不变量
  pub fn from_entries(entries: impl IntoIterator<Item = OffsetEntry>) -> Result<Self, OffsetTableError> {
    let mut table = OffsetTable::default();
    for entry in entries {
      match entry {
        OffsetEntry::Row(row) => table.rows.push(row),
        OffsetEntry::Dropped(dropped) => table.dropped.push(dropped),
      }
    }
    table.validate()?;
    Ok(table)
  }

  pub fn load(path: &Path) -> Result<Self, OffsetTableError> {
    let file = File::open(path).map_err(|e| OffsetTableError::io(path, e))?;
    let mut entries = Vec::new();
    for (number, line) in BufReader::new(file).lines().enumerate() {
      let line = line.map_err(|e| OffsetTableError::io(path, e))?;
      if line.trim().is_empty() {
        continue;
      }
      let entry = serde_json::from_str(&line).map_err(|source| OffsetTableError::Parse {
        line: number + 1,
        source,
      })?;
      entries.push(entry);
    }
    let table = Self::from_entries(entries)?;
    debug!(
      "读取偏移表 {}: {} 行, {} 帧被丢弃",
      path.display(),
      table.rows.len(),
      table.dropped.len()
    );
    Ok(table)
  }

  fn validate(&self) -> Result<(), OffsetTableError> {
    let mut seen = HashSet::new();
    for (expected, row) in self.rows.iter().enumerate() {
      if row.row != expected {
        return Err(OffsetTableError::Invalid(format!(
          "行序号不连续: 期望 {}, 实际 {}",
          expected, row.row
        )));
      }
      if row.frames.is_empty() {
        return Err(OffsetTableError::Invalid(format!("行 {} 没有任何帧", row.row)));
      }
      for pair in row.frames.windows(2) {
        if pair[1].frame <= pair[0].frame || pair[1].offset[0] < pair[0].offset[0] {
          return Err(OffsetTableError::Invalid(format!(
            "行 {} 中帧 {} 与帧 {} 顺序错误",
            row.row, pair[0].frame, pair[1].frame
          )));
        }
      }
      for placement in &row.frames {
        if !seen.insert(placement.frame) {
          return Err(OffsetTableError::Invalid(format!(
            "帧 {} 出现在多个位置",
            placement.frame
          )));
        }
      }
    }
    for dropped in &self.dropped {
      if !seen.insert(dropped.frame) {
        return Err(OffsetTableError::Invalid(format!(
          "被丢弃的帧 {} 同时出现在行中",
          dropped.frame
        )));
      }
    }
    Ok(())
  }

  pub fn rows(&self) -> &[RowRecord] {
    &self.rows
  }

  pub fn row(&self, index: usize) -> Option<&RowRecord> {
    self.rows.get(index)
  }

  pub fn dropped(&self) -> &[DroppedFrame] {
    &self.dropped
  }

  pub fn is_empty(&self) -> bool {
    self.rows.is_empty()
  }

  /// 帧在全局坐标系中的位置
  pub fn frame_origin(&self, frame: u64) -> Option<[i64; 2]> {
    self.rows.iter().find_map(|row| {
      row
        .frames
        .iter()
        .find(|placement| placement.frame == frame)
        .map(|placement| {
          [
            row.origin[0] + placement.offset[0],
            row.origin[1] + placement.offset[1],
          ]
        })
    })
  }
}
