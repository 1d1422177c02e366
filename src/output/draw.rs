// 该文件是 Tianye （田野） 项目的一部分。
// src/output/draw.rs - 检测框绘制与文本记录
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

use std::path::Path;

use image::{Rgb, RgbImage};
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};

use crate::{detect::Detection, offset::RowRecord};

const BOX_THICKNESS: u32 = 2;
const BOX_COLOR: [u8; 3] = [0, 0, 255]; // 蓝色

pub struct Draw {
  thickness: u32,
  color: [u8; 3],
}

impl Default for Draw {
  fn default() -> Self {
    Self {
      thickness: BOX_THICKNESS,
      color: BOX_COLOR,
    }
  }
}

impl Draw {
  /// 在图像上绘制像素坐标 [x_min, y_min, x_max, y_max] 的矩形边框
  pub fn draw_bbox(&self, image: &mut RgbImage, bbox: &[f32; 4]) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    if w == 0 || h == 0 {
      return;
    }
    let x_min = (bbox[0].floor() as i32).clamp(0, w - 1);
    let y_min = (bbox[1].floor() as i32).clamp(0, h - 1);
    let x_max = (bbox[2].ceil() as i32).clamp(0, w - 1);
    let y_max = (bbox[3].ceil() as i32).clamp(0, h - 1);
    if x_min >= x_max || y_min >= y_max {
      return;
    }

    // 向内加粗
    for t in 0..self.thickness as i32 {
      let (width, height) = (x_max - x_min - 2 * t + 1, y_max - y_min - 2 * t + 1);
      if width <= 0 || height <= 0 {
        break;
      }
      let rect = Rect::at(x_min + t, y_min + t).of_size(width as u32, height as u32);
      draw_hollow_rect_mut(image, rect, Rgb(self.color));
    }
  }

  /// 在行图像上绘制该行的检测结果
  pub fn draw_detections(&self, image: &mut RgbImage, row: &RowRecord, detections: &[&Detection]) {
    for detection in detections {
      self.draw_bbox(image, &detection.row_local_bbox(row));
    }
  }
}

/// 逐行文本记录：`class, score, cx, cy`（全局坐标）
pub struct Record {
  pub label_with_name: bool,
}

impl Record {
  pub fn record(&self, detections: &[&Detection], path: &Path) -> Result<(), std::io::Error> {
    let records: Vec<String> = detections
      .iter()
      .map(|d| {
        let name = if self.label_with_name {
          d.class.clone()
        } else {
          d.class_id.to_string()
        };
        format!(
          "{}, {:.4}, {:.2}, {:.2}",
          name, d.score, d.center[0], d.center[1]
        )
      })
      .collect();
    std::fs::write(path.with_extension("txt"), records.join("\n"))
  }
}
