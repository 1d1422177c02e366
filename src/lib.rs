// 该文件是 Tianye （田野） 项目的一部分。
// src/lib.rs - 库主文件
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

//! # Tianye 田野
//!
//! 将俯拍田地视频拼接为条带（行）马赛克，并在马赛克上分批运行目标检测，
//! 最终得到统一全局坐标系下的检测中心与类别。
//!
//! 管线分三个阶段，严格顺序执行：
//!
//! 1. [`input::FrameExtractor`] 按采样间隔抽帧，写入帧暂存目录；
//! 2. [`stitch::RowStitcher`] 将相邻帧拼接为行图像，并写出偏移表；
//! 3. [`detect::BatchDetector`] 按批次推理，并借助偏移表重投影到全局坐标。
//!
//! [`pipeline::Pipeline`] 负责串联三个阶段，并保证暂存目录在任何退出路径上被清理。

pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod input;
pub mod model;
pub mod offset;
pub mod output;
pub mod pipeline;
pub mod stitch;
pub mod task;

use std::path::PathBuf;

pub trait FromUrl {
  type Error;
  fn from_url(url: &url::Url) -> Result<Self, Self::Error>
  where
    Self: Sized;
}

pub trait FromUrlWithScheme: FromUrl {
  const SCHEME: &'static str;
}

/// 取出 URL 中的本地路径，并解码百分号转义
pub fn url_path(url: &url::Url) -> PathBuf {
  let raw = url.path();
  match urlencoding::decode(raw) {
    Ok(path) => PathBuf::from(path.into_owned()),
    Err(_) => PathBuf::from(raw),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn url_path_decodes_escapes() {
    let url = url::Url::parse("image:///data/field%20run/frames").unwrap();
    assert_eq!(url_path(&url), PathBuf::from("/data/field run/frames"));
  }

  #[test]
  fn url_path_keeps_host_out_of_path() {
    let url = url::Url::parse("gst://file/videos/a.mp4").unwrap();
    assert_eq!(url.host_str(), Some("file"));
    assert_eq!(url_path(&url), PathBuf::from("/videos/a.mp4"));
  }
}
