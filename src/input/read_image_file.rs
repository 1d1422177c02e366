// 该文件是 Tianye （田野） 项目的一部分。
// src/input/read_image_file.rs - 图像序列输入
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

use image::ImageReader;
use tracing::{debug, error};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, url_path,
  input::{DecodedFrame, FrameExtractError, VideoSource},
};

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// 图像序列输入
///
/// 把单张图片或一个目录下的图片（按文件名排序）当作视频逐帧读取。
/// `image:///path/to/frames` 或 `image:///path/to/one.png`。
pub struct ImageSequenceInput {
  root: PathBuf,
  paths: std::vec::IntoIter<PathBuf>,
}

impl FromUrlWithScheme for ImageSequenceInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageSequenceInput {
  type Error = FrameExtractError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(FrameExtractError::SchemeMismatch(url.scheme().to_string()));
    }
    Self::open(&url_path(url))
  }
}

fn is_image_file(path: &Path) -> bool {
  path.is_file()
    && path
      .extension()
      .and_then(|ext| ext.to_str())
      .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
      .unwrap_or(false)
}

impl ImageSequenceInput {
  pub fn open(path: &Path) -> Result<Self, FrameExtractError> {
    let paths = if path.is_dir() {
      let mut paths = std::fs::read_dir(path)
        .map_err(|e| FrameExtractError::OpenVideo(format!("{}: {}", path.display(), e)))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| is_image_file(path))
        .collect::<Vec<_>>();
      paths.sort();
      paths
    } else if is_image_file(path) {
      vec![path.to_path_buf()]
    } else {
      return Err(FrameExtractError::OpenVideo(format!(
        "{}: 不是图像文件或目录",
        path.display()
      )));
    };

    if paths.is_empty() {
      return Err(FrameExtractError::OpenVideo(format!(
        "{}: 目录中没有图像",
        path.display()
      )));
    }

    debug!("图像序列 {} 共 {} 张", path.display(), paths.len());
    Ok(Self {
      root: path.to_path_buf(),
      paths: paths.into_iter(),
    })
  }
}

impl Iterator for ImageSequenceInput {
  type Item = Result<DecodedFrame, FrameExtractError>;

  fn next(&mut self) -> Option<Self::Item> {
    let path = self.paths.next()?;
    let image = ImageReader::open(&path)
      .map_err(|e| e.to_string())
      .and_then(|reader| reader.decode().map_err(|e| e.to_string()));
    Some(match image {
      Ok(image) => Ok(DecodedFrame {
        image: image.into_rgb8(),
        timestamp_ms: None,
      }),
      Err(reason) => Err(FrameExtractError::Decode(format!(
        "{}: {}",
        path.display(),
        reason
      ))),
    })
  }
}

impl VideoSource for ImageSequenceInput {
  fn describe(&self) -> String {
    format!("image://{}", self.root.display())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::{Rgb, RgbImage};

  #[test]
  fn directory_is_read_in_name_order_and_bad_files_are_decode_errors() {
    let dir = tempfile::tempdir().unwrap();
    RgbImage::from_pixel(4, 4, Rgb([2, 0, 0]))
      .save(dir.path().join("b.png"))
      .unwrap();
    RgbImage::from_pixel(4, 4, Rgb([1, 0, 0]))
      .save(dir.path().join("a.png"))
      .unwrap();
    std::fs::write(dir.path().join("c.png"), b"not a png").unwrap();
    std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

    let url = Url::from_directory_path(dir.path()).unwrap();
    let url = Url::parse(&url.as_str().replacen("file", "image", 1)).unwrap();
    let frames: Vec<_> = ImageSequenceInput::from_url(&url).unwrap().collect();
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0].as_ref().unwrap().image.get_pixel(0, 0)[0], 1);
    assert_eq!(frames[1].as_ref().unwrap().image.get_pixel(0, 0)[0], 2);
    assert!(matches!(frames[2], Err(FrameExtractError::Decode(_))));
  }

  #[test]
  fn missing_path_fails_to_open() {
    let err = ImageSequenceInput::open(Path::new("/definitely/not/here")).err().unwrap();
    assert!(matches!(err, FrameExtractError::OpenVideo(_)));
  }
}
