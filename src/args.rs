// 该文件是 Tianye （田野） 项目的一部分。
// src/args.rs - 命令行参数
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

use std::num::{NonZeroU32, NonZeroUsize};
use std::path::PathBuf;

use clap::Parser;
use url::Url;

use tianye::config::{DetectConfig, PipelineConfig, StitchConfig};

/// Tianye 田野巡检参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入视频
  /// - gst://file/path/to/video.mp4
  /// - image:///path/to/frames/
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,

  /// 检测模型，例如 yolo26:///path/to/model.rknn
  #[arg(long, value_name = "MODEL")]
  pub model: Url,

  /// 类别名称文件（每行一个）
  #[arg(long, value_name = "FILE")]
  pub labels: Option<PathBuf>,

  /// 帧暂存目录
  #[arg(long, value_name = "DIR", default_value = "frames")]
  pub frames_dir: PathBuf,

  /// 行图像暂存目录
  #[arg(long, value_name = "DIR", default_value = "batch")]
  pub stitched_dir: PathBuf,

  /// 偏移表路径（默认位于行图像暂存目录内）
  #[arg(long, value_name = "FILE")]
  pub offset_file: Option<PathBuf>,

  /// 采样间隔：每 N 帧保留一帧
  #[arg(long, value_name = "N", default_value = "8")]
  pub frame_interval: NonZeroU32,

  /// 对齐置信度下限 (-1.0 - 1.0)
  #[arg(long, value_name = "THRESHOLD")]
  pub min_confidence: f32,

  /// 单行最大宽度（像素）
  #[arg(long, value_name = "PIXELS")]
  pub max_row_width: u32,

  /// 每批次行数
  #[arg(long, value_name = "ROWS")]
  pub batch_size: NonZeroUsize,

  /// 检测工作线程数
  #[arg(long, value_name = "COUNT", default_value = "1")]
  pub workers: NonZeroUsize,

  /// 检测置信度阈值 (0.0 - 1.0)
  #[arg(long, value_name = "THRESHOLD", default_value = "0.5")]
  pub score_threshold: f32,

  /// NMS IOU 阈值 (0.0 - 1.0)，不设置则不做抑制
  #[arg(long, value_name = "THRESHOLD")]
  pub nms_threshold: Option<f32>,

  /// 单批次推理失败后的重试次数
  #[arg(long, value_name = "COUNT", default_value = "0")]
  pub retries: u32,

  /// 粗对齐缩放宽度（像素）
  #[arg(long, value_name = "PIXELS", default_value = "320")]
  pub align_width: u32,

  /// 最大纵向偏移（像素）
  #[arg(long, value_name = "PIXELS", default_value = "16")]
  pub max_vertical_shift: u32,

  /// 对齐模板占帧宽的比例 (0.0 - 1.0]
  #[arg(long, value_name = "RATIO", default_value = "0.25")]
  pub min_overlap: f32,

  /// 标注结果输出
  /// - folder:///path/to/output
  /// - folder:///path/to/output?record=id&always
  #[arg(long, value_name = "OUTPUT")]
  pub annotate: Option<Url>,

  /// 中断后强制退出前的等待时间（秒）
  #[arg(long, value_name = "SECONDS", default_value = "10")]
  pub grace: u64,
}

impl Args {
  pub fn pipeline_config(&self) -> PipelineConfig {
    let stitch = StitchConfig::new(self.min_confidence, self.max_row_width)
      .with_min_overlap(self.min_overlap)
      .with_max_vertical_shift(self.max_vertical_shift)
      .with_align_width(self.align_width);
    let detect = DetectConfig::new(self.batch_size)
      .with_workers(self.workers)
      .with_score_threshold(self.score_threshold)
      .with_nms_threshold(self.nms_threshold)
      .with_retries(self.retries);
    let config = PipelineConfig::new(
      &self.frames_dir,
      &self.stitched_dir,
      self.frame_interval,
      stitch,
      detect,
    )
    .with_annotate(self.annotate.clone());
    match &self.offset_file {
      Some(offset_file) => config.with_offset_file(offset_file),
      None => config,
    }
  }
}
