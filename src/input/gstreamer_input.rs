// 该文件是 Tianye （田野） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 视频解码输入
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

//! # GStreamer 视频输入模块
//!
//! 使用 GStreamer 解码视频文件，逐帧拉取 RGB 图像。
//! 与实时预览不同，抽帧要求不丢帧，因此 appsink 关闭了 `drop` 并以非同步方式运行。
//!
//! ## 系统依赖
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev
//! ```
//!
//! ## 基本用法
//!
//! ```no_run
//! use tianye::{FromUrl, input::GStreamerInputPipelineBuilder};
//! use url::Url;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let url = Url::parse("gst://file/data/field.mp4")?;
//! let input = GStreamerInputPipelineBuilder::from_url(&url)?.build()?;
//! for frame in input {
//!     let frame = frame?;
//!     println!("帧: {}x{}", frame.image.width(), frame.image.height());
//! }
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, url_path,
  input::{DecodedFrame, FrameExtractError, VideoSource},
};

/// GStreamer 输入错误类型
#[derive(Error, Debug)]
pub enum GStreamerInputError {
  /// URI scheme 不匹配（期望 "gst://file/..."）
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  /// GStreamer 库错误
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  /// GStreamer 布尔操作错误
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  /// 无法获取 appsink 元素
  #[error("Failed to get appsink element")]
  AppSinkNotFound,
  /// 无法转换元素为 appsink
  #[error("Failed to convert element to appsink")]
  AppSinkConversionFailed,
  /// 管道错误
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  /// 状态改变错误
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
}

pub enum GStreamerInputBuilderItem {
  FileSource(PathBuf),
  TargetFormat { format: String },
}

impl GStreamerInputBuilderItem {
  fn to_pipeline(&self) -> String {
    match self {
      GStreamerInputBuilderItem::FileSource(path) => {
        format!("filesrc location=\"{}\" ! decodebin", path.display())
      }
      GStreamerInputBuilderItem::TargetFormat { format } => {
        format!("videoconvert ! video/x-raw,format={}", format)
      }
    }
  }
}

/// GStreamer 输入管道构建器
pub struct GStreamerInputPipelineBuilder {
  path: PathBuf,
  items: Vec<GStreamerInputBuilderItem>,
}

impl FromUrlWithScheme for GStreamerInputPipelineBuilder {
  const SCHEME: &'static str = "gst";
}

impl FromUrl for GStreamerInputPipelineBuilder {
  type Error = GStreamerInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(GStreamerInputError::SchemeMismatch);
    }
    match url.host_str() {
      Some("file") => Ok(Self::file(url_path(url))),
      _ => Err(GStreamerInputError::SchemeMismatch),
    }
  }
}

impl GStreamerInputPipelineBuilder {
  pub fn file(path: impl Into<PathBuf>) -> Self {
    let path = path.into();
    let items = vec![
      GStreamerInputBuilderItem::FileSource(path.clone()),
      GStreamerInputBuilderItem::TargetFormat {
        format: "RGB".to_string(),
      },
    ];
    Self { path, items }
  }

  pub fn build(self) -> Result<GStreamerInput, FrameExtractError> {
    if !self.path.is_file() {
      return Err(FrameExtractError::OpenVideo(format!(
        "{}: 文件不存在",
        self.path.display()
      )));
    }

    gst::init().map_err(GStreamerInputError::from)?;

    let basic_pipeline = self
      .items
      .iter()
      .map(GStreamerInputBuilderItem::to_pipeline)
      .collect::<Vec<String>>()
      .join(" ! ");
    // 抽帧不能丢帧：关闭 drop，sync=false 以解码速度拉取
    let full_pipeline = format!(
      "{} ! appsink max-buffers=4 drop=false sync=false name=sink",
      basic_pipeline
    );

    info!("GStreamer pipeline description: {}", full_pipeline);

    let pipeline = gst::parse::launch(&full_pipeline)
      .map_err(GStreamerInputError::from)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerInputError::PipelineError("Failed to create pipeline".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerInputError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerInputError::AppSinkConversionFailed)?;

    pipeline.set_state(gst::State::Playing).map_err(|e| {
      FrameExtractError::OpenVideo(format!("{}: {}", self.path.display(), e))
    })?;

    Ok(GStreamerInput {
      path: self.path,
      pipeline,
      appsink,
      finished: false,
    })
  }
}

/// GStreamer 视频输入
///
/// 按解码顺序产出 RGB 帧，到达 EOS 后结束。
pub struct GStreamerInput {
  path: PathBuf,
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  finished: bool,
}

impl Drop for GStreamerInput {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
  }
}

impl GStreamerInput {
  /// 取出总线上的错误消息
  fn bus_error(&self) -> Option<String> {
    let bus = self.pipeline.bus()?;
    let message = bus.pop_filtered(&[gst::MessageType::Error])?;
    match message.view() {
      gst::MessageView::Error(err) => Some(format!(
        "{} ({:?})",
        err.error(),
        err.debug()
      )),
      _ => None,
    }
  }
}

impl Iterator for GStreamerInput {
  type Item = Result<DecodedFrame, FrameExtractError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.finished {
      return None;
    }
    match self.appsink.pull_sample() {
      Ok(sample) => Some(convert_sample(sample)),
      Err(e) => {
        self.finished = true;
        if self.appsink.is_eos() {
          return None;
        }
        let reason = self.bus_error().unwrap_or_else(|| e.to_string());
        error!("GStreamer 拉取帧失败: {}", reason);
        Some(Err(
          GStreamerInputError::PipelineError(reason).into(),
        ))
      }
    }
  }
}

impl VideoSource for GStreamerInput {
  fn describe(&self) -> String {
    format!("gst://file{}", self.path.display())
  }
}

/// 将 RGB 样本转为图像，逐行处理 stride 对齐
fn convert_sample(sample: gst::Sample) -> Result<DecodedFrame, FrameExtractError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| FrameExtractError::Decode("No buffer in sample".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| FrameExtractError::Decode("No caps in sample".to_string()))?;

  let video_info = gst_video::VideoInfo::from_caps(caps)
    .map_err(|e| FrameExtractError::Decode(format!("Failed to get video info: {}", e)))?;
  if video_info.format() != gst_video::VideoFormat::Rgb {
    return Err(FrameExtractError::Decode(format!(
      "Unsupported video format: {:?}",
      video_info.format()
    )));
  }

  let width = video_info.width() as usize;
  let height = video_info.height() as usize;
  let stride = video_info.stride()[0] as usize;
  let timestamp_ms = buffer.pts().map(|pts| pts.mseconds());

  let map = buffer
    .map_readable()
    .map_err(|e| FrameExtractError::Decode(format!("Failed to map buffer: {}", e)))?;
  let data = map.as_slice();

  let row_bytes = width * 3;
  if stride < row_bytes || data.len() < stride * height.saturating_sub(1) + row_bytes {
    return Err(FrameExtractError::Decode(format!(
      "Buffer size mismatch: {} bytes for {}x{} (stride {})",
      data.len(),
      width,
      height,
      stride
    )));
  }

  let mut pixels = Vec::with_capacity(row_bytes * height);
  for row in 0..height {
    let start = row * stride;
    pixels.extend_from_slice(&data[start..start + row_bytes]);
  }

  let image = RgbImage::from_raw(width as u32, height as u32, pixels)
    .ok_or_else(|| FrameExtractError::Decode("Failed to build RGB image".to_string()))?;
  Ok(DecodedFrame {
    image,
    timestamp_ms,
  })
}
