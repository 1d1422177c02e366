// 该文件是 Tianye （田野） 项目的一部分。
// src/model.rs - 检测模型
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

use image::RgbImage;
use thiserror::Error;
use tracing::debug;

use crate::FromUrl;

#[cfg(feature = "model_yolo26")]
mod yolo26;
#[cfg(feature = "model_yolo26")]
pub use self::yolo26::{Yolo26, Yolo26Builder, Yolo26Error};

/// 检测模型
///
/// 输入为任意尺寸的行图像，输出的检测框为该图像内的像素坐标。
pub trait Model {
  type Error: std::error::Error;

  fn infer(&self, image: &RgbImage) -> Result<DetectResult, Self::Error>;

  /// 一次推理一个批次，结果与输入一一对应
  fn infer_batch(&self, images: &[&RgbImage]) -> Result<Vec<DetectResult>, Self::Error> {
    images.iter().map(|image| self.infer(image)).collect()
  }
}

/// 模型工厂
///
/// 每个检测线程各自创建一个模型实例，因此模型本身无需 `Sync`。
pub trait ModelFactory: Sync {
  type Model: Model;
  type Error: std::error::Error;

  fn create(&self) -> Result<Self::Model, Self::Error>;
}

impl<F, M, E> ModelFactory for F
where
  F: Fn() -> Result<M, E> + Sync,
  M: Model,
  E: std::error::Error,
{
  type Model = M;
  type Error = E;

  fn create(&self) -> Result<M, E> {
    self()
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectItem {
  pub class_id: u32,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]
}

impl DetectItem {
  pub fn center(&self) -> [f32; 2] {
    [
      (self.bbox[0] + self.bbox[2]) / 2.0,
      (self.bbox[1] + self.bbox[3]) / 2.0,
    ]
  }

  fn area(&self) -> f32 {
    (self.bbox[2] - self.bbox[0]).max(0.0) * (self.bbox[3] - self.bbox[1]).max(0.0)
  }

  pub fn iou(&self, other: &DetectItem) -> f32 {
    let x0 = self.bbox[0].max(other.bbox[0]);
    let y0 = self.bbox[1].max(other.bbox[1]);
    let x1 = self.bbox[2].min(other.bbox[2]);
    let y1 = self.bbox[3].min(other.bbox[3]);
    let inter = (x1 - x0).max(0.0) * (y1 - y0).max(0.0);
    let union = self.area() + other.area() - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
  }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectResult {
  pub items: Box<[DetectItem]>,
}

/// 同类别非极大值抑制，返回按得分降序排列的保留结果
pub fn non_max_suppression(items: Vec<DetectItem>, iou_threshold: f32) -> Vec<DetectItem> {
  let mut items = items;
  items.sort_by(|a, b| b.score.total_cmp(&a.score));
  let mut kept: Vec<DetectItem> = Vec::with_capacity(items.len());
  for item in items {
    let suppressed = kept
      .iter()
      .any(|k| k.class_id == item.class_id && k.iou(&item) > iou_threshold);
    if !suppressed {
      kept.push(item);
    }
  }
  kept
}

/// 类别名称表，每行一个名称，行号即类别编号
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Labels {
  names: Vec<String>,
}

impl Labels {
  pub fn new(names: Vec<String>) -> Self {
    Self { names }
  }

  pub fn load(path: &Path) -> std::io::Result<Self> {
    let text = std::fs::read_to_string(path)?;
    let names: Vec<String> = text
      .lines()
      .map(str::trim)
      .filter(|line| !line.is_empty())
      .map(str::to_string)
      .collect();
    debug!("从 {} 读取 {} 个类别名称", path.display(), names.len());
    Ok(Self { names })
  }

  /// 未知编号以编号本身作为名称
  pub fn name(&self, class_id: u32) -> String {
    self
      .names
      .get(class_id as usize)
      .cloned()
      .unwrap_or_else(|| class_id.to_string())
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }
}

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("不支持的模型 URI 方案: {0}")]
  UnsupportedScheme(String),
  #[cfg(feature = "model_yolo26")]
  #[error("YOLO26 模型错误: {0}")]
  Yolo26(#[from] Yolo26Error),
}

/// 按 URL 方案选择的模型后端
pub enum ModelWrapper {
  #[cfg(feature = "model_yolo26")]
  Yolo26(Yolo26),
}

impl FromUrl for ModelWrapper {
  type Error = ModelError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "model_yolo26")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == Yolo26Builder::SCHEME {
        let model = Yolo26Builder::from_url(url)?.build()?;
        return Ok(ModelWrapper::Yolo26(model));
      }
    }
    Err(ModelError::UnsupportedScheme(url.scheme().to_string()))
  }
}

impl Model for ModelWrapper {
  type Error = ModelError;

  fn infer(&self, image: &RgbImage) -> Result<DetectResult, Self::Error> {
    match *self {
      #[cfg(feature = "model_yolo26")]
      ModelWrapper::Yolo26(ref model) => Ok(model.infer(image)?),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn item(class_id: u32, score: f32, bbox: [f32; 4]) -> DetectItem {
    DetectItem {
      class_id,
      score,
      bbox,
    }
  }

  #[test]
  fn nms_suppresses_overlapping_boxes_of_same_class_only() {
    let kept = non_max_suppression(
      vec![
        item(0, 0.6, [0.0, 0.0, 10.0, 10.0]),
        item(0, 0.9, [1.0, 1.0, 11.0, 11.0]),
        item(1, 0.5, [1.0, 1.0, 11.0, 11.0]),
        item(0, 0.7, [50.0, 50.0, 60.0, 60.0]),
      ],
      0.45,
    );
    let scores: Vec<f32> = kept.iter().map(|i| i.score).collect();
    assert_eq!(scores, vec![0.9, 0.7, 0.5]);
  }

  #[test]
  fn labels_fall_back_to_numeric_id() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("labels.txt");
    std::fs::write(&path, "weed\n\n crop \n").unwrap();
    let labels = Labels::load(&path).unwrap();
    assert_eq!(labels.len(), 2);
    assert_eq!(labels.name(1), "crop");
    assert_eq!(labels.name(7), "7");
  }

  #[test]
  fn unknown_model_scheme_is_rejected() {
    let url = url::Url::parse("onnx:///tmp/model.onnx").unwrap();
    assert!(matches!(
      ModelWrapper::from_url(&url),
      Err(ModelError::UnsupportedScheme(_))
    ));
  }

  #[test]
  fn closures_are_model_factories() {
    struct Empty;
    impl Model for Empty {
      type Error = std::io::Error;
      fn infer(&self, _image: &RgbImage) -> Result<DetectResult, Self::Error> {
        Ok(DetectResult::default())
      }
    }
    let factory = || Ok::<_, std::io::Error>(Empty);
    let model = factory.create().unwrap();
    let image = RgbImage::new(2, 2);
    assert_eq!(model.infer_batch(&[&image, &image]).unwrap().len(), 2);
  }
}
