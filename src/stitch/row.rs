// 该文件是 Tianye （田野） 项目的一部分。
// src/stitch/row.rs - 行的构建与封存
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

use image::{RgbImage, imageops};

use crate::{
  offset::{FramePlacement, RowAnchor, RowRecord},
  stitch::align::{AlignFrame, Alignment},
};

struct Placed {
  frame: u64,
  offset: [i64; 2],
  confidence: Option<f32>,
  image: RgbImage,
}

/// 正在增长的行
///
/// 偏移相对行的暂定原点；封存时统一平移，使所有偏移非负。
pub struct RowBuilder {
  index: usize,
  origin: [i64; 2],
  anchor: RowAnchor,
  placed: Vec<Placed>,
  trailing: AlignFrame,
}

impl RowBuilder {
  pub fn seed(
    index: usize,
    origin: [i64; 2],
    anchor: RowAnchor,
    frame: u64,
    image: RgbImage,
    aligned: AlignFrame,
  ) -> Self {
    Self {
      index,
      origin,
      anchor,
      placed: vec![Placed {
        frame,
        offset: [0, 0],
        confidence: None,
        image,
      }],
      trailing: aligned,
    }
  }

  pub fn index(&self) -> usize {
    self.index
  }

  pub fn origin(&self) -> [i64; 2] {
    self.origin
  }

  pub fn len(&self) -> usize {
    self.placed.len()
  }

  pub fn is_empty(&self) -> bool {
    self.placed.is_empty()
  }

  /// 最后放置的帧，后续帧都与它对齐
  pub fn trailing(&self) -> &AlignFrame {
    &self.trailing
  }

  pub fn trailing_offset(&self) -> [i64; 2] {
    self.placed.last().map(|p| p.offset).unwrap_or([0, 0])
  }

  /// 与末帧对齐后，新帧在行内的偏移
  pub fn offset_after(&self, alignment: &Alignment) -> [i64; 2] {
    let [x, y] = self.trailing_offset();
    [x + alignment.dx, y + alignment.dy]
  }

  /// 在 `offset` 处放入宽 `frame_width` 的帧后行的宽度
  pub fn width_with(&self, offset: [i64; 2], frame_width: u32) -> u64 {
    let right = self
      .placed
      .iter()
      .map(|p| p.offset[0] + p.image.width() as i64)
      .chain(std::iter::once(offset[0] + frame_width as i64))
      .max()
      .unwrap_or(0);
    right.max(0) as u64
  }

  pub fn push(
    &mut self,
    frame: u64,
    offset: [i64; 2],
    confidence: f32,
    image: RgbImage,
    aligned: AlignFrame,
  ) {
    self.placed.push(Placed {
      frame,
      offset,
      confidence: Some(confidence),
      image,
    });
    self.trailing = aligned;
  }

  /// 合成行图像
  ///
  /// 按放置顺序覆盖绘制，重叠区域取后放置的帧。
  pub fn seal(self) -> Row {
    let min_y = self.placed.iter().map(|p| p.offset[1]).min().unwrap_or(0);
    let width = self
      .placed
      .iter()
      .map(|p| p.offset[0] + p.image.width() as i64)
      .max()
      .unwrap_or(0);
    let height = self
      .placed
      .iter()
      .map(|p| p.offset[1] - min_y + p.image.height() as i64)
      .max()
      .unwrap_or(0);

    let mut image = RgbImage::new(width.max(0) as u32, height.max(0) as u32);
    let mut frames = Vec::with_capacity(self.placed.len());
    for placed in self.placed {
      let offset = [placed.offset[0], placed.offset[1] - min_y];
      imageops::replace(&mut image, &placed.image, offset[0], offset[1]);
      frames.push(FramePlacement {
        frame: placed.frame,
        offset,
        confidence: placed.confidence,
      });
    }

    Row {
      index: self.index,
      origin: [self.origin[0], self.origin[1] + min_y],
      anchor: self.anchor,
      image,
      frames,
    }
  }
}

/// 已封存的行
pub struct Row {
  pub index: usize,
  pub origin: [i64; 2],
  pub anchor: RowAnchor,
  pub image: RgbImage,
  pub frames: Vec<FramePlacement>,
}

impl Row {
  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }

  /// 紧接本行右侧的全局位置
  pub fn right_edge(&self) -> [i64; 2] {
    [self.origin[0] + self.width() as i64, self.origin[1]]
  }

  pub fn record(&self, image: String) -> RowRecord {
    RowRecord {
      row: self.index,
      image,
      origin: self.origin,
      width: self.width(),
      height: self.height(),
      anchor: self.anchor,
      frames: self.frames.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{config::StitchConfig, stitch::align::Aligner};
  use image::Rgb;

  fn solid(w: u32, h: u32, v: u8) -> RgbImage {
    RgbImage::from_pixel(w, h, Rgb([v, v, v]))
  }

  #[test]
  fn seal_normalizes_vertical_drift_into_origin() {
    let aligner = Aligner::new(&StitchConfig::new(0.5, 1000));
    let mut row = RowBuilder::seed(
      3,
      [100, 50],
      RowAnchor::Aligned,
      10,
      solid(20, 10, 1),
      aligner.prepare(&solid(20, 10, 1)),
    );
    let offset = row.offset_after(&Alignment {
      dx: 8,
      dy: -2,
      confidence: 0.9,
    });
    assert_eq!(offset, [8, -2]);
    assert_eq!(row.width_with(offset, 20), 28);
    row.push(11, offset, 0.9, solid(20, 10, 2), aligner.prepare(&solid(20, 10, 2)));

    let sealed = row.seal();
    assert_eq!(sealed.origin, [100, 48]);
    assert_eq!((sealed.width(), sealed.height()), (28, 12));
    assert_eq!(sealed.frames[0].offset, [0, 2]);
    assert_eq!(sealed.frames[1].offset, [8, 0]);
    assert_eq!(sealed.frames[0].confidence, None);
    // 重叠区域取后放置的帧
    assert_eq!(sealed.image.get_pixel(10, 5)[0], 2);
    assert_eq!(sealed.image.get_pixel(2, 5)[0], 1);
    // 未覆盖区域保持黑色
    assert_eq!(sealed.image.get_pixel(27, 11)[0], 0);
    assert_eq!(sealed.right_edge(), [128, 48]);

    let record = sealed.record("row_0003.png".to_string());
    assert_eq!(record.row, 3);
    assert_eq!(record.frame_at(9.0), Some(11));
  }
}
