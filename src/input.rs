// 该文件是 Tianye （田野） 项目的一部分。
// src/input.rs - 视频输入与抽帧
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

use image::{ImageFormat, RgbImage};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  FromUrl,
  error::ErrorKind,
  frame::{FrameManifest, FrameRecord, frame_file_name},
  task::{CancelToken, Cancelled},
};

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::ImageSequenceInput;

#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_input::{
  GStreamerInput, GStreamerInputError, GStreamerInputPipelineBuilder,
};

#[derive(Error, Debug)]
pub enum FrameExtractError {
  #[error("采样间隔必须为正整数，实际为 {0}")]
  InvalidInterval(u32),
  #[error("无法打开视频: {0}")]
  OpenVideo(String),
  #[error("视频帧解码失败: {0}")]
  Decode(String),
  #[error("视频中没有任何可解码的帧")]
  NoFrames,
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("写入帧 {path} 失败: {source}")]
  Write {
    path: PathBuf,
    source: image::ImageError,
  },
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[cfg(feature = "gstreamer_input")]
  #[error("GStreamer 输入错误: {0}")]
  GStreamer(#[from] GStreamerInputError),
  #[error(transparent)]
  Cancelled(#[from] Cancelled),
}

impl FrameExtractError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      FrameExtractError::Write { .. } | FrameExtractError::Io(_) => ErrorKind::Io,
      FrameExtractError::Cancelled(_) => ErrorKind::Cancelled,
      _ => ErrorKind::InvalidInput,
    }
  }
}

/// 解码器输出的一帧
#[derive(Debug, Clone)]
pub struct DecodedFrame {
  pub image: RgbImage,
  pub timestamp_ms: Option<u64>,
}

/// 视频源
///
/// 按解码顺序逐帧产出。单帧解码失败以 [`FrameExtractError::Decode`] 表示，
/// 该帧仍占据一个解码位置；其它错误视为整个视频不可用。
pub trait VideoSource: Iterator<Item = Result<DecodedFrame, FrameExtractError>> {
  /// 用于日志的描述
  fn describe(&self) -> String;
}

pub enum InputWrapper {
  #[cfg(feature = "gstreamer_input")]
  GStreamerInput(GStreamerInput),
  #[cfg(feature = "read_image_file")]
  ReadImageFile(ImageSequenceInput),
}

impl FromUrl for InputWrapper {
  type Error = FrameExtractError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "gstreamer_input")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == GStreamerInputPipelineBuilder::SCHEME {
        let input = GStreamerInputPipelineBuilder::from_url(url)?.build()?;
        return Ok(InputWrapper::GStreamerInput(input));
      }
    }
    #[cfg(feature = "read_image_file")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == ImageSequenceInput::SCHEME {
        let input = ImageSequenceInput::from_url(url)?;
        return Ok(InputWrapper::ReadImageFile(input));
      }
    }
    Err(FrameExtractError::SchemeMismatch(url.scheme().to_string()))
  }
}

impl Iterator for InputWrapper {
  type Item = Result<DecodedFrame, FrameExtractError>;

  fn next(&mut self) -> Option<Self::Item> {
    match self {
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamerInput(input) => input.next(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.next(),
    }
  }
}

impl VideoSource for InputWrapper {
  fn describe(&self) -> String {
    match self {
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamerInput(input) => input.describe(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.describe(),
    }
  }
}

/// 抽帧器
///
/// 每 `interval` 帧保留一帧：解码位置 `p` 满足 `(p + 1) % interval == 0` 时保留，
/// 因此 `F` 帧的视频恰好产出 `⌊F / interval⌋` 帧。
#[derive(Debug, Clone)]
pub struct FrameExtractor {
  frames_dir: PathBuf,
  interval: u32,
}

impl FrameExtractor {
  pub fn new(frames_dir: impl Into<PathBuf>, interval: u32) -> Result<Self, FrameExtractError> {
    if interval == 0 {
      return Err(FrameExtractError::InvalidInterval(interval));
    }
    Ok(Self {
      frames_dir: frames_dir.into(),
      interval,
    })
  }

  pub fn frames_dir(&self) -> &Path {
    &self.frames_dir
  }

  /// 惰性抽帧
  ///
  /// 返回的迭代器只能消费一次；重新开始需要重新打开视频。
  pub fn frames<S: VideoSource>(&self, source: S) -> Result<ExtractedFrames<S>, FrameExtractError> {
    std::fs::create_dir_all(&self.frames_dir)?;
    info!(
      "开始抽帧: {} -> {}, 采样间隔 {}",
      source.describe(),
      self.frames_dir.display(),
      self.interval
    );
    Ok(ExtractedFrames {
      source,
      frames_dir: self.frames_dir.clone(),
      interval: self.interval as u64,
      position: 0,
      next_index: 0,
      decoded_ok: 0,
      skipped: Vec::new(),
      finished: false,
    })
  }

  /// 抽取全部帧并写出帧清单
  pub fn extract<S: VideoSource>(
    &self,
    source: S,
    cancel: &CancelToken,
  ) -> Result<FrameManifest, FrameExtractError> {
    let mut frames = self.frames(source)?;
    let mut records = Vec::new();
    for record in frames.by_ref() {
      records.push(record?);
      cancel.check()?;
    }
    let manifest = frames.into_manifest(records);
    manifest.save(&self.frames_dir)?;
    info!(
      "抽帧完成: 解码 {} 帧, 跳过 {} 帧, 输出 {} 帧",
      manifest.decoded,
      manifest.skipped.len(),
      manifest.frames.len()
    );
    Ok(manifest)
  }
}

/// 抽帧迭代器
pub struct ExtractedFrames<S> {
  source: S,
  frames_dir: PathBuf,
  interval: u64,
  position: u64,
  next_index: u64,
  decoded_ok: u64,
  skipped: Vec<u64>,
  finished: bool,
}

impl<S> ExtractedFrames<S> {
  fn write_frame(&mut self, frame: DecodedFrame, source_frame: u64) -> Result<FrameRecord, FrameExtractError> {
    let index = self.next_index;
    let file = frame_file_name(index);
    let path = self.frames_dir.join(&file);
    frame
      .image
      .save_with_format(&path, ImageFormat::Png)
      .map_err(|source| FrameExtractError::Write {
        path: path.clone(),
        source,
      })?;
    self.next_index += 1;
    debug!("帧 {} (解码位置 {}) 已写入 {}", index, source_frame, path.display());
    Ok(FrameRecord {
      index,
      source_frame,
      timestamp_ms: frame.timestamp_ms,
      file,
      width: frame.image.width(),
      height: frame.image.height(),
    })
  }

  /// 消费完毕后生成帧清单
  pub fn into_manifest(self, frames: Vec<FrameRecord>) -> FrameManifest {
    FrameManifest {
      interval: self.interval as u32,
      decoded: self.position,
      skipped: self.skipped,
      frames,
    }
  }
}

impl<S: VideoSource> Iterator for ExtractedFrames<S> {
  type Item = Result<FrameRecord, FrameExtractError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.finished {
      return None;
    }
    loop {
      match self.source.next() {
        None => {
          self.finished = true;
          if self.decoded_ok == 0 {
            return Some(Err(FrameExtractError::NoFrames));
          }
          return None;
        }
        Some(Err(FrameExtractError::Decode(reason))) => {
          warn!("解码位置 {} 的帧损坏，已跳过: {}", self.position, reason);
          self.skipped.push(self.position);
          self.position += 1;
        }
        Some(Err(e)) => {
          self.finished = true;
          return Some(Err(e));
        }
        Some(Ok(frame)) => {
          let position = self.position;
          self.position += 1;
          self.decoded_ok += 1;
          if (position + 1) % self.interval != 0 {
            continue;
          }
          let record = self.write_frame(frame, position);
          if record.is_err() {
            self.finished = true;
          }
          return Some(record);
        }
      }
    }
  }
}
