// 该文件是 Tianye （田野） 项目的一部分。
// src/stitch/align.rs - 相邻帧对齐
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

//! # 相邻帧对齐
//!
//! 取后一帧左侧条带作为模板，在前一帧中搜索最佳匹配位置，
//! 以零均值归一化互相关（ZNCC）作为置信度。
//! 先在缩小的灰度图上粗搜索，再回到全分辨率在 ±(缩放倍数 + 1) 像素内精化。

use std::ops::RangeInclusive;

use image::RgbImage;
use thiserror::Error;

use crate::{config::StitchConfig, error::ErrorKind};

const VARIANCE_EPSILON: f64 = 1e-6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlignmentFailure {
  #[error("对齐置信度 {confidence:.3} 低于阈值 {threshold:.3}")]
  LowConfidence { confidence: f32, threshold: f32 },
  #[error("模板无纹理，无法对齐")]
  Degenerate,
  #[error("帧尺寸不一致: {0:?} 与 {1:?}")]
  SizeMismatch((u32, u32), (u32, u32)),
}

impl AlignmentFailure {
  pub fn kind(&self) -> ErrorKind {
    ErrorKind::Alignment
  }

  /// 失败时的置信度（退化对齐视为 0）
  pub fn confidence(&self) -> f32 {
    match self {
      AlignmentFailure::LowConfidence { confidence, .. } => *confidence,
      _ => 0.0,
    }
  }
}

/// 后一帧相对前一帧的位移
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Alignment {
  pub dx: i64,
  pub dy: i64,
  pub confidence: f32,
}

/// 灰度平面
#[derive(Debug, Clone)]
pub struct GrayPlane {
  width: usize,
  height: usize,
  data: Vec<f32>,
}

impl GrayPlane {
  /// 转灰度并按 `factor × factor` 块取均值缩小
  pub fn from_rgb(image: &RgbImage, factor: u32) -> Self {
    let factor = factor.max(1) as usize;
    let (src_w, src_h) = (image.width() as usize, image.height() as usize);
    let width = src_w / factor;
    let height = src_h / factor;
    let scale = 1.0 / (factor * factor) as f32;
    let mut data = vec![0f32; width * height];
    for (y, row) in data.chunks_mut(width.max(1)).enumerate().take(height) {
      for (x, value) in row.iter_mut().enumerate() {
        let mut sum = 0f32;
        for sy in y * factor..(y + 1) * factor {
          for sx in x * factor..(x + 1) * factor {
            let [r, g, b] = image.get_pixel(sx as u32, sy as u32).0;
            sum += 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
          }
        }
        *value = sum * scale;
      }
    }
    Self {
      width,
      height,
      data,
    }
  }

  pub fn width(&self) -> usize {
    self.width
  }

  pub fn height(&self) -> usize {
    self.height
  }

  #[inline]
  fn at(&self, x: usize, y: usize) -> f32 {
    self.data[y * self.width + x]
  }
}

/// 积分图（和与平方和），用于 O(1) 求任意窗口的均值与方差
#[derive(Debug, Clone)]
struct Integral {
  stride: usize,
  sum: Vec<f64>,
  sq: Vec<f64>,
}

impl Integral {
  fn new(plane: &GrayPlane) -> Self {
    let stride = plane.width + 1;
    let mut sum = vec![0f64; stride * (plane.height + 1)];
    let mut sq = vec![0f64; stride * (plane.height + 1)];
    for y in 0..plane.height {
      let mut row_sum = 0f64;
      let mut row_sq = 0f64;
      for x in 0..plane.width {
        let v = plane.at(x, y) as f64;
        row_sum += v;
        row_sq += v * v;
        let idx = (y + 1) * stride + x + 1;
        sum[idx] = sum[idx - stride] + row_sum;
        sq[idx] = sq[idx - stride] + row_sq;
      }
    }
    Self { stride, sum, sq }
  }

  fn window(&self, x: usize, y: usize, w: usize, h: usize) -> (f64, f64) {
    let s = self.stride;
    let (a, b, c, d) = (y * s + x, y * s + x + w, (y + h) * s + x, (y + h) * s + x + w);
    (
      self.sum[d] - self.sum[b] - self.sum[c] + self.sum[a],
      self.sq[d] - self.sq[b] - self.sq[c] + self.sq[a],
    )
  }
}

struct Level {
  plane: GrayPlane,
  integral: Integral,
}

impl Level {
  fn new(plane: GrayPlane) -> Self {
    let integral = Integral::new(&plane);
    Self { plane, integral }
  }
}

/// 预处理后的帧（全分辨率与缩小后的灰度平面）
pub struct AlignFrame {
  dimensions: (u32, u32),
  full: Level,
  coarse: Option<Level>,
  factor: usize,
}

impl AlignFrame {
  pub fn dimensions(&self) -> (u32, u32) {
    self.dimensions
  }
}

/// 模板在前一帧中的搜索参数
struct Search {
  strip: usize,
  margin: usize,
  xs: RangeInclusive<usize>,
  ys: RangeInclusive<usize>,
}

struct Match {
  x: usize,
  y: usize,
  score: f64,
}

/// 模板取自 `next` 的左侧条带（纵向去掉 `margin`），在 `previous` 中逐位置计算 ZNCC
fn best_match(previous: &Level, next: &GrayPlane, search: &Search) -> Result<Match, AlignmentFailure> {
  let th = next.height.saturating_sub(2 * search.margin);
  let tw = search.strip;
  if tw == 0 || th == 0 {
    return Err(AlignmentFailure::Degenerate);
  }
  let n = (tw * th) as f64;

  let mut template = Vec::with_capacity(tw * th);
  for y in search.margin..search.margin + th {
    for x in 0..tw {
      template.push(next.at(x, y) as f64);
    }
  }
  let mean = template.iter().sum::<f64>() / n;
  template.iter_mut().for_each(|v| *v -= mean);
  let template_norm = template.iter().map(|v| v * v).sum::<f64>();
  if template_norm <= VARIANCE_EPSILON * n {
    return Err(AlignmentFailure::Degenerate);
  }

  let mut best: Option<Match> = None;
  for y in search.ys.clone() {
    for x in search.xs.clone() {
      let (sum, sq) = previous.integral.window(x, y, tw, th);
      let variance = sq - sum * sum / n;
      let score = if variance <= VARIANCE_EPSILON * n {
        0.0
      } else {
        let mut cross = 0f64;
        for (j, t_row) in template.chunks(tw).enumerate() {
          for (i, t) in t_row.iter().enumerate() {
            cross += t * previous.plane.at(x + i, y + j) as f64;
          }
        }
        cross / (template_norm * variance).sqrt()
      };
      if best.as_ref().is_none_or(|b| score > b.score) {
        best = Some(Match { x, y, score });
      }
    }
  }
  best.ok_or(AlignmentFailure::Degenerate)
}

/// 帧对齐器
#[derive(Debug, Clone)]
pub struct Aligner {
  min_confidence: f32,
  min_overlap: f32,
  max_vertical_shift: u32,
  align_width: u32,
}

impl Aligner {
  pub fn new(config: &StitchConfig) -> Self {
    Self {
      min_confidence: config.min_confidence,
      min_overlap: config.min_overlap,
      max_vertical_shift: config.max_vertical_shift,
      align_width: config.align_width,
    }
  }

  pub fn prepare(&self, image: &RgbImage) -> AlignFrame {
    let factor = image.width().div_ceil(self.align_width).max(1);
    let full = Level::new(GrayPlane::from_rgb(image, 1));
    let coarse = (factor > 1).then(|| Level::new(GrayPlane::from_rgb(image, factor)));
    AlignFrame {
      dimensions: image.dimensions(),
      full,
      coarse,
      factor: factor as usize,
    }
  }

  /// 求 `next` 相对 `previous` 的位移
  ///
  /// 只搜索向前（`dx ≥ 0`）的位移；置信度低于阈值时返回 [`AlignmentFailure::LowConfidence`]。
  pub fn align(&self, previous: &AlignFrame, next: &AlignFrame) -> Result<Alignment, AlignmentFailure> {
    if previous.dimensions != next.dimensions {
      return Err(AlignmentFailure::SizeMismatch(
        previous.dimensions,
        next.dimensions,
      ));
    }
    let (w, h) = (previous.full.plane.width, previous.full.plane.height);
    if w == 0 || h == 0 {
      return Err(AlignmentFailure::Degenerate);
    }
    let strip = ((self.min_overlap as f64 * w as f64).round() as usize).clamp(1, w.max(1));
    let margin = (self.max_vertical_shift as usize).min(h.saturating_sub(1) / 2);
    let max_x = w - strip;

    let (xs, ys) = match (&previous.coarse, &next.coarse) {
      (Some(prev_coarse), Some(next_coarse)) => {
        let f = previous.factor;
        let cw = prev_coarse.plane.width;
        let coarse_strip = ((strip as f64 / f as f64).round() as usize).clamp(1, cw.max(1));
        let coarse_margin = margin.div_ceil(f).min(prev_coarse.plane.height.saturating_sub(1) / 2);
        let coarse = best_match(
          prev_coarse,
          &next_coarse.plane,
          &Search {
            strip: coarse_strip,
            margin: coarse_margin,
            xs: 0..=cw.saturating_sub(coarse_strip),
            ys: 0..=2 * coarse_margin,
          },
        )?;
        let radius = f + 1;
        let x_est = coarse.x * f;
        let dy_est = (coarse.y as i64 - coarse_margin as i64) * f as i64;
        let y_est = (dy_est + margin as i64).clamp(0, 2 * margin as i64) as usize;
        (
          x_est.saturating_sub(radius).min(max_x)..=(x_est + radius).min(max_x),
          y_est.saturating_sub(radius)..=(y_est + radius).min(2 * margin),
        )
      }
      _ => (0..=max_x, 0..=2 * margin),
    };

    let found = best_match(
      &previous.full,
      &next.full.plane,
      &Search {
        strip,
        margin,
        xs,
        ys,
      },
    )?;
    let confidence = found.score as f32;
    if confidence < self.min_confidence {
      return Err(AlignmentFailure::LowConfidence {
        confidence,
        threshold: self.min_confidence,
      });
    }
    Ok(Alignment {
      dx: found.x as i64,
      dy: found.y as i64 - margin as i64,
      confidence,
    })
  }
}
