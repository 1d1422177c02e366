// 该文件是 Tianye （田野） 项目的一部分。
// src/output/directory_record.rs - 标注结果目录记录
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

use std::path::{Path, PathBuf};

use chrono::{Datelike, Local};
use image::RgbImage;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
  FromUrl, FromUrlWithScheme,
  output::{
    AnnotatedRow, Render,
    draw::{Draw, Record},
  },
  url_path,
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 标注输出目录
///
/// 每次运行在 `<根目录>/<年>/<月>/<日>/<时-分-秒>/` 下保存带检测框的行图像
/// 以及同名的 `.txt` 文本记录。
pub struct DirectoryRecordOutput {
  run_dir: PathBuf,
  draw: Draw,
  record: Record,
  always: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  /// `folder:///path?record=id&always`
  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }
    let label_with_name = !uri.query_pairs().any(|(k, v)| k == "record" && v == "id");
    let always = uri.query_pairs().any(|(k, _)| k == "always");
    let mut output = Self::new(&url_path(uri))?;
    output.record.label_with_name = label_with_name;
    output.always = always;
    Ok(output)
  }
}

impl DirectoryRecordOutput {
  pub fn new(root: &Path) -> Result<Self, DirectoryRecordOutputError> {
    let now = Local::now();
    let run_dir = root
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()))
      .join(now.format("%H-%M-%S").to_string());
    std::fs::create_dir_all(&run_dir)?;
    info!("标注结果保存到 {}", run_dir.display());
    Ok(Self {
      run_dir,
      draw: Draw::default(),
      record: Record {
        label_with_name: true,
      },
      always: true,
    })
  }

  pub fn run_dir(&self) -> &Path {
    &self.run_dir
  }
}

impl Render<RgbImage, AnnotatedRow<'_>> for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn render_result(&self, image: &RgbImage, result: &AnnotatedRow<'_>) -> Result<(), Self::Error> {
    if !self.always && result.detections.is_empty() {
      return Ok(());
    }
    let path = self.run_dir.join(&result.row.image);
    let mut annotated = image.clone();
    self
      .draw
      .draw_detections(&mut annotated, result.row, &result.detections);
    annotated.save(&path)?;
    self.record.record(&result.detections, &path)?;
    debug!(
      "行 {} 标注结果已保存: {} 个目标",
      result.row.row,
      result.detections.len()
    );
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::detect::Detection;
  use crate::offset::{FramePlacement, RowAnchor, RowRecord};

  fn row() -> RowRecord {
    RowRecord {
      row: 2,
      image: "row_0002.png".to_string(),
      origin: [100, 4],
      width: 40,
      height: 20,
      anchor: RowAnchor::Aligned,
      frames: vec![FramePlacement {
        frame: 6,
        offset: [0, 0],
        confidence: Some(0.95),
      }],
    }
  }

  fn detection() -> Detection {
    Detection {
      center: [110.0, 14.0],
      bbox: [105.0, 9.0, 115.0, 19.0],
      class: "weed".to_string(),
      class_id: 3,
      score: 0.8,
      batch: 0,
      row: 2,
      frame: Some(6),
    }
  }

  fn folder_url(root: &Path, query: &str) -> url::Url {
    let mut url = url::Url::parse("folder:///").unwrap();
    url.set_path(&root.to_string_lossy());
    url.set_query(Some(query).filter(|q| !q.is_empty()));
    url
  }

  #[test]
  fn query_selects_id_records_and_skips_empty_rows() {
    let dir = tempfile::tempdir().unwrap();
    let output = DirectoryRecordOutput::from_url(&folder_url(dir.path(), "record=id")).unwrap();
    assert!(output.run_dir().starts_with(dir.path()));

    let row = row();
    let image = RgbImage::new(40, 20);
    let empty = AnnotatedRow {
      row: &row,
      detections: Vec::new(),
    };
    output.render_result(&image, &empty).unwrap();
    assert!(!output.run_dir().join("row_0002.png").exists());

    let found = detection();
    let annotated = AnnotatedRow {
      row: &row,
      detections: vec![&found],
    };
    output.render_result(&image, &annotated).unwrap();
    assert!(output.run_dir().join("row_0002.png").is_file());
    let record = std::fs::read_to_string(output.run_dir().join("row_0002.txt")).unwrap();
    assert_eq!(record, "3, 0.8000, 110.00, 14.00");
  }

  #[test]
  fn always_keeps_rows_without_detections() {
    let dir = tempfile::tempdir().unwrap();
    let output = DirectoryRecordOutput::from_url(&folder_url(dir.path(), "always")).unwrap();
    let row = row();
    let empty = AnnotatedRow {
      row: &row,
      detections: Vec::new(),
    };
    output.render_result(&RgbImage::new(40, 20), &empty).unwrap();
    assert!(output.run_dir().join("row_0002.png").is_file());
  }

  #[test]
  fn other_schemes_are_rejected() {
    let url = url::Url::parse("file:///tmp/out").unwrap();
    assert!(matches!(
      DirectoryRecordOutput::from_url(&url),
      Err(DirectoryRecordOutputError::SchemeMismatch)
    ));
  }
}
