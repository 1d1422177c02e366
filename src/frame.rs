// 该文件是 Tianye （田野） 项目的一部分。
// src/frame.rs - 帧与分块定义
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
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::model::DetectItem;

const RGB_CHANNELS: usize = 3;

/// 帧清单文件名（位于帧暂存目录内）
pub const MANIFEST_FILE_NAME: &str = "frames.json";

/// 抽取得到的一帧
///
/// 创建后不再修改。
#[derive(Debug, Clone)]
pub struct Frame {
  /// 序号，从 0 开始按抽取顺序严格递增
  pub index: u64,
  /// 在源视频中的解码位置
  pub source_frame: u64,
  /// 源视频时间戳（毫秒）
  pub timestamp_ms: Option<u64>,
  /// RGB 图像数据
  pub image: RgbImage,
}

impl Frame {
  pub fn dimensions(&self) -> (u32, u32) {
    self.image.dimensions()
  }
}

/// 已落盘的帧记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRecord {
  pub index: u64,
  pub source_frame: u64,
  pub timestamp_ms: Option<u64>,
  pub file: String,
  pub width: u32,
  pub height: u32,
}

impl FrameRecord {
  pub fn path(&self, dir: &Path) -> PathBuf {
    dir.join(&self.file)
  }

  /// 从暂存目录读回帧图像
  pub fn load(&self, dir: &Path) -> Result<Frame, image::ImageError> {
    let image = image::open(self.path(dir))?.to_rgb8();
    Ok(Frame {
      index: self.index,
      source_frame: self.source_frame,
      timestamp_ms: self.timestamp_ms,
      image,
    })
  }
}

/// 帧文件名，零填充保证字典序即为序号顺序
pub fn frame_file_name(index: u64) -> String {
  format!("frame_{:06}.png", index)
}

/// 帧清单
///
/// 抽帧结束后写入帧暂存目录，使拼接阶段可以在不重新解码的情况下重启。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameManifest {
  /// 采样间隔
  pub interval: u32,
  /// 解码器给出的帧总数（包括解码失败的帧）
  pub decoded: u64,
  /// 解码失败而跳过的解码位置
  pub skipped: Vec<u64>,
  pub frames: Vec<FrameRecord>,
}

impl FrameManifest {
  pub fn save(&self, dir: &Path) -> io::Result<()> {
    let file = File::create(dir.join(MANIFEST_FILE_NAME))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, self)?;
    writer.flush()?;
    writer.get_ref().sync_all()
  }

  pub fn load(dir: &Path) -> io::Result<Self> {
    let file = File::open(dir.join(MANIFEST_FILE_NAME))?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
  }
}

pub trait AsNhwcFrame<const W: u32, const H: u32> {
  fn as_nhwc(&self) -> &[u8];
}

/// 固定尺寸的 NHWC 帧，用作定长输入模型的张量
#[derive(Debug, Clone)]
pub struct RgbNhwcFrame<const W: u32, const H: u32> {
  data: Box<[u8]>,
}

impl<const W: u32, const H: u32> Default for RgbNhwcFrame<W, H> {
  fn default() -> Self {
    let size = RGB_CHANNELS * (W as usize) * (H as usize);
    let data = vec![0u8; size].into_boxed_slice();
    Self { data }
  }
}

impl<const W: u32, const H: u32> RgbNhwcFrame<W, H> {
  pub fn height(&self) -> usize {
    H as usize
  }

  pub fn width(&self) -> usize {
    W as usize
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }
}

impl<const W: u32, const H: u32> AsMut<[u8]> for RgbNhwcFrame<W, H> {
  fn as_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }
}

impl<const W: u32, const H: u32> AsNhwcFrame<W, H> for RgbNhwcFrame<W, H> {
  fn as_nhwc(&self) -> &[u8] {
    &self.data
  }
}

/// 行图像中的一个分块
#[derive(Debug, Clone)]
pub struct Tile<const W: u32, const H: u32> {
  /// 分块左上角在行图像中的位置
  pub origin: (u32, u32),
  /// 分块内有效（非填充）区域的宽高
  pub valid: (u32, u32),
  pub frame: RgbNhwcFrame<W, H>,
}

impl<const W: u32, const H: u32> Tile<W, H> {
  /// 分块内的检测框平移回行图像坐标；中心落在填充区域的框被丢弃
  pub fn to_image_coords(&self, items: Vec<DetectItem>) -> impl Iterator<Item = DetectItem> + '_ {
    let (ox, oy) = (self.origin.0 as f32, self.origin.1 as f32);
    let (vw, vh) = (self.valid.0 as f32, self.valid.1 as f32);
    items.into_iter().filter_map(move |item| {
      let [cx, cy] = item.center();
      if cx >= vw || cy >= vh {
        return None;
      }
      Some(DetectItem {
        bbox: [
          item.bbox[0] + ox,
          item.bbox[1] + oy,
          item.bbox[2].min(vw) + ox,
          item.bbox[3].min(vh) + oy,
        ],
        ..item
      })
    })
  }
}

fn axis_positions(len: u32, tile: u32, overlap: u32) -> Vec<u32> {
  if len <= tile {
    return vec![0];
  }
  let stride = tile.saturating_sub(overlap).max(1);
  let count = (len - tile).div_ceil(stride) + 1;
  let mut positions: Vec<u32> = (0..count)
    .map(|i| (i * stride).min(len - tile))
    .collect();
  positions.dedup();
  positions
}

/// 计算覆盖 `width × height` 图像所需的分块位置
///
/// 相邻分块重叠 `overlap` 像素，末尾分块贴齐图像边缘。
pub fn tile_grid(width: u32, height: u32, tile_w: u32, tile_h: u32, overlap: u32) -> Vec<(u32, u32)> {
  let xs = axis_positions(width, tile_w, overlap);
  let ys = axis_positions(height, tile_h, overlap);
  ys.iter()
    .flat_map(|&y| xs.iter().map(move |&x| (x, y)))
    .collect()
}

/// 将任意尺寸的图像切分为固定尺寸分块，不足部分以 0 填充
pub fn split_tiles<const W: u32, const H: u32>(image: &RgbImage, overlap: u32) -> Vec<Tile<W, H>> {
  let (width, height) = image.dimensions();
  tile_grid(width, height, W, H, overlap)
    .into_iter()
    .map(|(x0, y0)| {
      let valid_w = W.min(width - x0);
      let valid_h = H.min(height - y0);
      let mut frame = RgbNhwcFrame::<W, H>::default();
      let slice = frame.as_mut();
      for y in 0..valid_h {
        for x in 0..valid_w {
          let pixel = image.get_pixel(x0 + x, y0 + y);
          let idx = ((y as usize) * (W as usize) + x as usize) * RGB_CHANNELS;
          slice[idx..idx + RGB_CHANNELS].copy_from_slice(&pixel.0);
        }
      }
      Tile {
        origin: (x0, y0),
        valid: (valid_w, valid_h),
        frame,
      }
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgb;

  #[test]
  fn frame_file_names_sort_in_sequence_order() {
    let mut names: Vec<String> = [10u64, 2, 100, 0].iter().map(|&i| frame_file_name(i)).collect();
    names.sort();
    assert_eq!(
      names,
      vec![
        "frame_000000.png",
        "frame_000002.png",
        "frame_000010.png",
        "frame_000100.png"
      ]
    );
  }

  #[test]
  fn tile_grid_covers_image_with_edge_aligned_last_tile() {
    let grid = tile_grid(1000, 300, 640, 640, 64);
    assert_eq!(grid, vec![(0, 0), (360, 0)]);

    let grid = tile_grid(2000, 700, 640, 640, 64);
    let xs: Vec<u32> = grid.iter().filter(|(_, y)| *y == 0).map(|(x, _)| *x).collect();
    assert_eq!(xs, vec![0, 576, 1152, 1360]);
    assert!(grid.contains(&(1360, 60)));
  }

  #[test]
  fn small_image_is_single_padded_tile() {
    let mut image = RgbImage::new(3, 2);
    image.put_pixel(2, 1, Rgb([7, 8, 9]));
    let tiles = split_tiles::<4, 4>(&image, 0);
    assert_eq!(tiles.len(), 1);
    let tile = &tiles[0];
    assert_eq!(tile.origin, (0, 0));
    assert_eq!(tile.valid, (3, 2));
    let data = tile.frame.as_nhwc();
    let idx = (4 + 2) * 3;
    assert_eq!(&data[idx..idx + 3], &[7, 8, 9]);
    // 填充区域
    assert_eq!(&data[3 * 3..3 * 3 + 3], &[0, 0, 0]);
  }

  #[test]
  fn tile_boxes_shift_to_image_and_drop_padding() {
    let image = RgbImage::new(10, 3);
    let tiles = split_tiles::<4, 4>(&image, 0);
    let last = tiles.last().unwrap();
    assert_eq!(last.origin, (6, 0));
    assert_eq!(last.valid, (4, 3));

    let item = |bbox: [f32; 4]| DetectItem {
      class_id: 1,
      score: 0.7,
      bbox,
    };
    let mapped: Vec<DetectItem> = last
      .to_image_coords(vec![
        // 跨出有效区域下沿，被裁剪
        item([1.0, 1.0, 3.0, 3.8]),
        // 中心位于填充行
        item([0.0, 3.0, 2.0, 4.0]),
      ])
      .collect();
    assert_eq!(mapped.len(), 1);
    assert_eq!(mapped[0].bbox, [7.0, 1.0, 9.0, 3.0]);
    assert_eq!(mapped[0].class_id, 1);
  }

  #[test]
  fn manifest_round_trips_through_directory() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = FrameManifest {
      interval: 8,
      decoded: 17,
      skipped: vec![3],
      frames: vec![FrameRecord {
        index: 0,
        source_frame: 7,
        timestamp_ms: Some(233),
        file: frame_file_name(0),
        width: 64,
        height: 48,
      }],
    };
    manifest.save(dir.path()).unwrap();
    assert_eq!(FrameManifest::load(dir.path()).unwrap(), manifest);
  }
}
