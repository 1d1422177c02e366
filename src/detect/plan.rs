// 该文件是 Tianye （田野） 项目的一部分。
// src/detect/plan.rs - 批次计划
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

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::{error::ErrorKind, offset::OffsetTable};

#[derive(Error, Debug)]
pub enum PlanError {
  #[error("批次计划 {path} 读写失败: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("批次计划 {path} 解析失败: {source}")]
  Parse {
    path: PathBuf,
    source: serde_json::Error,
  },
}

impl PlanError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      PlanError::Io { .. } => ErrorKind::Io,
      PlanError::Parse { .. } => ErrorKind::InvalidInput,
    }
  }
}

/// 批次中的一行
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMember {
  pub row: usize,
  /// 行原点相对批次原点的偏移
  pub offset: [i64; 2],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
  pub batch: usize,
  /// 批次原点（首行的全局原点）
  pub origin: [i64; 2],
  pub members: Vec<BatchMember>,
}

impl BatchRecord {
  /// 成员行的全局原点
  pub fn member_origin(&self, member: &BatchMember) -> [i64; 2] {
    [
      self.origin[0] + member.offset[0],
      self.origin[1] + member.offset[1],
    ]
  }
}

/// 批次计划
///
/// 在推理开始前由偏移表推导并落盘，重新检测时无需重新拼接。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPlan {
  pub batch_size: usize,
  pub rows: usize,
  pub batches: Vec<BatchRecord>,
}

impl BatchPlan {
  pub fn build(table: &OffsetTable, batch_size: NonZeroUsize) -> Self {
    let batches = table
      .rows()
      .chunks(batch_size.get())
      .enumerate()
      .map(|(batch, rows)| {
        let origin = rows[0].origin;
        BatchRecord {
          batch,
          origin,
          members: rows
            .iter()
            .map(|row| BatchMember {
              row: row.row,
              offset: [row.origin[0] - origin[0], row.origin[1] - origin[1]],
            })
            .collect(),
        }
      })
      .collect();
    Self {
      batch_size: batch_size.get(),
      rows: table.rows().len(),
      batches,
    }
  }

  pub fn load(path: &Path) -> Result<Self, PlanError> {
    let file = File::open(path).map_err(|source| PlanError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| PlanError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  /// 先写临时文件再改名，避免留下半截的计划
  pub fn save(&self, path: &Path) -> Result<(), PlanError> {
    let io_err = |source| PlanError::Io {
      path: path.to_path_buf(),
      source,
    };
    let tmp = path.with_extension("json.tmp");
    let file = File::create(&tmp).map_err(io_err)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, self).map_err(|source| PlanError::Parse {
      path: path.to_path_buf(),
      source,
    })?;
    writer.flush().map_err(io_err)?;
    writer.get_ref().sync_all().map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)
  }

  /// 复用已落盘且与偏移表一致的计划，否则重新计算并写出
  pub fn prepare(path: &Path, table: &OffsetTable, batch_size: NonZeroUsize) -> Result<Self, PlanError> {
    let fresh = Self::build(table, batch_size);
    if path.exists() {
      match Self::load(path) {
        Ok(existing) if existing == fresh => {
          debug!("复用批次计划 {}", path.display());
          return Ok(existing);
        }
        Ok(_) => info!("批次计划 {} 与偏移表不一致，重新计算", path.display()),
        Err(e) => info!("批次计划 {} 不可用 ({})，重新计算", path.display(), e),
      }
    }
    fresh.save(path)?;
    info!(
      "批次计划: {} 行, 每批 {} 行, 共 {} 批",
      fresh.rows,
      fresh.batch_size,
      fresh.batches.len()
    );
    Ok(fresh)
  }
}

/// 局部坐标重投影到全局坐标
///
/// `global = batch_origin + member_offset + local`
pub fn reproject(batch_origin: [i64; 2], member_offset: [i64; 2], local: [f64; 2]) -> [f64; 2] {
  [
    (batch_origin[0] + member_offset[0]) as f64 + local[0],
    (batch_origin[1] + member_offset[1]) as f64 + local[1],
  ]
}
