// 该文件是 Tianye （田野） 项目的一部分。
// src/stitch.rs - 行拼接
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

//! # 行拼接
//!
//! 按序号逐帧与当前行的末帧对齐并放入行中。以下情况封存当前行：
//!
//! - 放入新帧会使行宽超过上限：新帧作为下一行的种子，下一行原点由对齐结果精确给出；
//! - 新帧与末帧、其后一帧与末帧均无法对齐：新帧作为下一行的种子，下一行接在本行右侧。
//!
//! 新帧对齐失败而其后一帧可以对齐时，新帧被视为孤立坏帧而丢弃。
//! 每封存一行即写出行图像并向偏移表追加一条记录。

use std::path::{Path, PathBuf};

use image::{ImageFormat, RgbImage};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  config::{ConfigError, StitchConfig},
  error::ErrorKind,
  frame::{FrameManifest, FrameRecord},
  offset::{DropReason, DroppedFrame, OffsetEntry, OffsetTable, OffsetTableError, OffsetTableWriter, RowAnchor},
  task::{CancelToken, Cancelled},
};

pub mod align;
mod row;

pub use self::align::{AlignFrame, Aligner, Alignment, AlignmentFailure, GrayPlane};
pub use self::row::{Row, RowBuilder};

#[derive(Error, Debug)]
pub enum StitchError {
  #[error("拼接配置无效: {0}")]
  InvalidConfig(#[from] ConfigError),
  #[error("写入行图像 {path} 失败: {source}")]
  Write {
    path: PathBuf,
    source: image::ImageError,
  },
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("偏移表错误: {0}")]
  OffsetTable(#[from] OffsetTableError),
  #[error(transparent)]
  Cancelled(#[from] Cancelled),
}

impl StitchError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      StitchError::InvalidConfig(_) => ErrorKind::InvalidInput,
      StitchError::Write { .. } | StitchError::Io(_) => ErrorKind::Io,
      StitchError::OffsetTable(e) => e.kind(),
      StitchError::Cancelled(_) => ErrorKind::Cancelled,
    }
  }
}

/// 行图像文件名
pub fn row_file_name(index: usize) -> String {
  format!("row_{:04}.png", index)
}

/// 行拼接器
pub struct RowStitcher {
  config: StitchConfig,
  stitched_dir: PathBuf,
  offset_file: PathBuf,
}

impl RowStitcher {
  pub fn new(config: StitchConfig, stitched_dir: impl Into<PathBuf>, offset_file: impl Into<PathBuf>) -> Self {
    Self {
      config,
      stitched_dir: stitched_dir.into(),
      offset_file: offset_file.into(),
    }
  }

  pub fn stitched_dir(&self) -> &Path {
    &self.stitched_dir
  }

  /// 从帧暂存目录中的帧清单重新开始拼接
  pub fn stitch_from_manifest(&self, frames_dir: &Path, cancel: &CancelToken) -> Result<OffsetTable, StitchError> {
    let manifest = FrameManifest::load(frames_dir)?;
    self.stitch(frames_dir, &manifest.frames, cancel)
  }

  /// 拼接按序号排列的帧，返回已落盘的偏移表
  pub fn stitch(
    &self,
    frames_dir: &Path,
    frames: &[FrameRecord],
    cancel: &CancelToken,
  ) -> Result<OffsetTable, StitchError> {
    self.config.validate()?;
    std::fs::create_dir_all(&self.stitched_dir)?;
    info!(
      "开始拼接: {} 帧, 置信度阈值 {}, 行宽上限 {}",
      frames.len(),
      self.config.min_confidence,
      self.config.max_row_width
    );

    let mut session = Session {
      stitcher: self,
      aligner: Aligner::new(&self.config),
      writer: OffsetTableWriter::create(&self.offset_file)?,
      entries: Vec::new(),
      frames_dir,
      dimensions: None,
      row: None,
      next_row: 0,
      next_origin: [0, 0],
      next_anchor: RowAnchor::Origin,
    };

    let mut records = frames.iter();
    let mut lookahead = None;
    loop {
      cancel.check()?;
      let candidate = match lookahead.take() {
        Some(candidate) => candidate,
        None => match session.next_candidate(&mut records)? {
          Some(candidate) => candidate,
          None => break,
        },
      };
      session.place(candidate, &mut records, &mut lookahead)?;
    }
    session.finish()
  }
}

/// 已读入并预处理的帧
struct Candidate {
  index: u64,
  image: RgbImage,
  aligned: AlignFrame,
}

struct Session<'a> {
  stitcher: &'a RowStitcher,
  aligner: Aligner,
  writer: OffsetTableWriter,
  entries: Vec<OffsetEntry>,
  frames_dir: &'a Path,
  dimensions: Option<(u32, u32)>,
  row: Option<RowBuilder>,
  next_row: usize,
  next_origin: [i64; 2],
  next_anchor: RowAnchor,
}

impl Session<'_> {
  fn append(&mut self, entry: OffsetEntry) -> Result<(), StitchError> {
    self.writer.append(&entry)?;
    self.entries.push(entry);
    Ok(())
  }

  fn drop_frame(&mut self, frame: u64, reason: DropReason, detail: String) -> Result<(), StitchError> {
    warn!("丢弃帧 {} ({:?}): {}", frame, reason, detail);
    self.append(OffsetEntry::Dropped(DroppedFrame {
      frame,
      reason,
      detail,
    }))
  }

  /// 读入下一个可用帧；无法读取或尺寸不一致的帧直接丢弃
  fn next_candidate<'r>(
    &mut self,
    records: &mut impl Iterator<Item = &'r FrameRecord>,
  ) -> Result<Option<Candidate>, StitchError> {
    for record in records {
      let frame = match record.load(self.frames_dir) {
        Ok(frame) => frame,
        Err(e) => {
          self.drop_frame(record.index, DropReason::Unreadable, e.to_string())?;
          continue;
        }
      };
      let dimensions = frame.dimensions();
      match self.dimensions {
        None => self.dimensions = Some(dimensions),
        Some(expected) if expected != dimensions => {
          self.drop_frame(
            record.index,
            DropReason::SizeMismatch,
            format!("{:?}，期望 {:?}", dimensions, expected),
          )?;
          continue;
        }
        Some(_) => {}
      }
      let aligned = self.aligner.prepare(&frame.image);
      return Ok(Some(Candidate {
        index: frame.index,
        image: frame.image,
        aligned,
      }));
    }
    Ok(None)
  }

  fn place<'r>(
    &mut self,
    candidate: Candidate,
    records: &mut impl Iterator<Item = &'r FrameRecord>,
    lookahead: &mut Option<Candidate>,
  ) -> Result<(), StitchError> {
    let result = match &self.row {
      None => {
        self.seed(candidate);
        return Ok(());
      }
      Some(row) => self.aligner.align(row.trailing(), &candidate.aligned),
    };

    let failure = match result {
      Ok(alignment) => return self.extend(candidate, alignment),
      Err(failure) => failure,
    };
    warn!("帧 {} 对齐失败: {}", candidate.index, failure);

    if let Some(next) = self.next_candidate(records)? {
      let retry = match &self.row {
        Some(row) => self.aligner.align(row.trailing(), &next.aligned),
        None => Err(AlignmentFailure::Degenerate),
      };
      match retry {
        Ok(alignment) => {
          self.drop_frame(candidate.index, DropReason::Unaligned, failure.to_string())?;
          return self.extend(next, alignment);
        }
        Err(_) => *lookahead = Some(next),
      }
    }

    // 对齐中断，下一行的位置只能估计
    if let Some(sealed) = self.seal()? {
      self.next_origin = sealed.right_edge();
      self.next_anchor = RowAnchor::Estimated;
    }
    self.seed(candidate);
    Ok(())
  }

  fn extend(&mut self, candidate: Candidate, alignment: Alignment) -> Result<(), StitchError> {
    let max_width = self.stitcher.config.max_row_width as u64;
    let Some(row) = self.row.as_mut() else {
      self.seed(candidate);
      return Ok(());
    };
    let offset = row.offset_after(&alignment);
    if row.width_with(offset, candidate.image.width()) <= max_width {
      debug!(
        "帧 {} 放入行 {}: 偏移 {:?}, 置信度 {:.3}",
        candidate.index,
        row.index(),
        offset,
        alignment.confidence
      );
      row.push(
        candidate.index,
        offset,
        alignment.confidence,
        candidate.image,
        candidate.aligned,
      );
      return Ok(());
    }

    let origin = row.origin();
    self.seal()?;
    self.next_origin = [origin[0] + offset[0], origin[1] + offset[1]];
    self.next_anchor = RowAnchor::Aligned;
    self.seed(candidate);
    Ok(())
  }

  fn seed(&mut self, candidate: Candidate) {
    debug!("帧 {} 作为行 {} 的种子", candidate.index, self.next_row);
    self.row = Some(RowBuilder::seed(
      self.next_row,
      self.next_origin,
      self.next_anchor,
      candidate.index,
      candidate.image,
      candidate.aligned,
    ));
    self.next_row += 1;
  }

  /// 封存当前行：写出行图像并追加偏移记录
  fn seal(&mut self) -> Result<Option<Row>, StitchError> {
    let Some(builder) = self.row.take() else {
      return Ok(None);
    };
    let row = builder.seal();
    let file = row_file_name(row.index);
    let path = self.stitcher.stitched_dir.join(&file);
    row
      .image
      .save_with_format(&path, ImageFormat::Png)
      .map_err(|source| StitchError::Write {
        path: path.clone(),
        source,
      })?;
    info!(
      "行 {} 已封存: {} 帧, {}x{}, 原点 {:?} ({:?})",
      row.index,
      row.frames.len(),
      row.width(),
      row.height(),
      row.origin,
      row.anchor
    );
    self.append(OffsetEntry::Row(row.record(file)))?;
    Ok(Some(row))
  }

  fn finish(mut self) -> Result<OffsetTable, StitchError> {
    self.seal()?;
    let table = OffsetTable::from_entries(self.entries)?;
    info!(
      "拼接完成: {} 行, 丢弃 {} 帧, 偏移表 {}",
      table.rows().len(),
      table.dropped().len(),
      self.writer.path().display()
    );
    Ok(table)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::frame_file_name;
  use image::Rgb;

  fn noise(x: u32, y: u32) -> u8 {
    let mut h = (x / 2).wrapping_mul(0x9E37_79B1) ^ (y / 2).wrapping_mul(0x85EB_CA77);
    h ^= h >> 15;
    h = h.wrapping_mul(0x2C1B_3C6D);
    h ^= h >> 13;
    (h & 0xFF) as u8
  }

  fn crop(x0: u32) -> RgbImage {
    RgbImage::from_fn(64, 40, |x, y| {
      let v = noise(x + x0, y);
      Rgb([v, v / 2, 255 - v])
    })
  }

  fn unrelated(seed: u32) -> RgbImage {
    RgbImage::from_fn(64, 40, |x, y| {
      let v = noise(y * 31 + seed * 1000 + 7, x * 17 + seed);
      Rgb([v, v, v])
    })
  }

  /// 按给定图像写出帧并返回帧记录
  fn write_frames(dir: &Path, images: Vec<Option<RgbImage>>) -> Vec<FrameRecord> {
    images
      .into_iter()
      .enumerate()
      .map(|(i, image)| {
        let file = frame_file_name(i as u64);
        let (width, height) = match image {
          Some(image) => {
            image.save(dir.join(&file)).unwrap();
            image.dimensions()
          }
          None => {
            std::fs::write(dir.join(&file), b"corrupt").unwrap();
            (64, 40)
          }
        };
        FrameRecord {
          index: i as u64,
          source_frame: i as u64,
          timestamp_ms: None,
          file,
          width,
          height,
        }
      })
      .collect()
  }

  fn run(images: Vec<Option<RgbImage>>, max_row_width: u32) -> OffsetTable {
    let dir = tempfile::tempdir().unwrap();
    let frames_dir = dir.path().join("frames");
    let stitched_dir = dir.path().join("batch");
    std::fs::create_dir_all(&frames_dir).unwrap();
    let records = write_frames(&frames_dir, images);
    let stitcher = RowStitcher::new(
      StitchConfig::new(0.8, max_row_width).with_max_vertical_shift(2),
      &stitched_dir,
      stitched_dir.join("batch_offsets.json"),
    );
    let table = stitcher.stitch(&frames_dir, &records, &CancelToken::new()).unwrap();
    // 落盘的偏移表与返回值一致
    assert_eq!(OffsetTable::load(&stitched_dir.join("batch_offsets.json")).unwrap(), table);
    for row in table.rows() {
      let image = image::open(stitched_dir.join(&row.image)).unwrap();
      assert_eq!((image.width(), image.height()), (row.width, row.height));
    }
    table
  }

  #[test]
  fn width_cap_seals_rows_with_exact_origins() {
    let images = (0..5).map(|i| Some(crop(i * 10))).collect();
    let table = run(images, 84);
    let rows = table.rows();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].anchor, RowAnchor::Origin);
    assert_eq!(rows[0].origin, [0, 0]);
    let offsets: Vec<i64> = rows[0].frames.iter().map(|f| f.offset[0]).collect();
    assert_eq!(offsets, vec![0, 10, 20]);
    assert_eq!(rows[1].anchor, RowAnchor::Aligned);
    assert_eq!(rows[1].origin, [30, 0]);
    assert_eq!(rows[1].frames.len(), 2);
    assert!(table.dropped().is_empty());
    assert_eq!(table.frame_origin(4), Some([40, 0]));
  }

  #[test]
  fn isolated_bad_frame_is_dropped() {
    let images = vec![
      Some(crop(0)),
      Some(crop(8)),
      Some(unrelated(1)),
      Some(crop(16)),
      Some(crop(24)),
    ];
    let table = run(images, 10_000);
    assert_eq!(table.rows().len(), 1);
    let frames: Vec<u64> = table.rows()[0].frames.iter().map(|f| f.frame).collect();
    assert_eq!(frames, vec![0, 1, 3, 4]);
    assert_eq!(table.dropped()[0].frame, 2);
    assert_eq!(table.dropped()[0].reason, DropReason::Unaligned);
    assert_eq!(table.frame_origin(3), Some([16, 0]));
  }

  #[test]
  fn alignment_break_starts_estimated_row_to_the_right() {
    let images = vec![
      Some(crop(0)),
      Some(crop(8)),
      Some(unrelated(1)),
      Some(unrelated(2)),
    ];
    let table = run(images, 10_000);
    let rows = table.rows();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].width, 72);
    assert_eq!(rows[1].anchor, RowAnchor::Estimated);
    assert_eq!(rows[1].origin, [72, 0]);
    assert_eq!(rows[1].frames.len(), 1);
    assert_eq!(rows[2].origin, [136, 0]);
  }

  #[test]
  fn unreadable_and_mismatched_frames_are_dropped() {
    let images = vec![
      Some(crop(0)),
      None,
      Some(RgbImage::new(32, 40)),
      Some(crop(10)),
    ];
    let table = run(images, 10_000);
    let reasons: Vec<(u64, DropReason)> = table.dropped().iter().map(|d| (d.frame, d.reason)).collect();
    assert_eq!(
      reasons,
      vec![(1, DropReason::Unreadable), (2, DropReason::SizeMismatch)]
    );
    assert_eq!(table.rows()[0].frames.len(), 2);
  }

  #[test]
  fn empty_input_yields_empty_table() {
    let table = run(Vec::new(), 100);
    assert!(table.is_empty());
  }

  #[test]
  fn cancelled_stitch_reports_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let records = write_frames(dir.path(), vec![Some(crop(0))]);
    let cancel = CancelToken::new();
    cancel.cancel();
    let err = RowStitcher::new(StitchConfig::new(0.8, 100), dir.path().join("b"), dir.path().join("b/o.json"))
      .stitch(dir.path(), &records, &cancel)
      .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
  }

  #[test]
  fn invalid_config_is_rejected_before_touching_disk() {
    let dir = tempfile::tempdir().unwrap();
    let stitched = dir.path().join("b");
    let err = RowStitcher::new(StitchConfig::new(2.0, 100), &stitched, stitched.join("o.json"))
      .stitch(dir.path(), &[], &CancelToken::new())
      .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert!(!stitched.exists());
  }
}
