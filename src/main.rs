// 该文件是 Tianye （田野） 项目的一部分。
// src/main.rs - 项目主程序
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

mod args;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use tianye::{
  FromUrl,
  model::{Labels, ModelWrapper},
  output::JsonEnvelopeSink,
  pipeline::Pipeline,
  task::{CancelToken, install_interrupt_handler},
};

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = args::Args::parse();

  info!("输入来源: {}", args.input);
  info!("模型: {}", args.model);
  info!("采样间隔: {}", args.frame_interval);

  let cancel = CancelToken::new();
  install_interrupt_handler(cancel.clone(), Duration::from_secs(args.grace))?;

  let labels = match &args.labels {
    Some(path) => Labels::load(path)?,
    None => Labels::default(),
  };
  let model_url = args.model.clone();
  let factory = move || ModelWrapper::from_url(&model_url);

  let pipeline = Pipeline::new(args.pipeline_config())
    .with_labels(labels)
    .with_cancel_token(cancel);
  let mut sink = JsonEnvelopeSink::new(std::io::stdout().lock());

  let now = std::time::Instant::now();
  let run = pipeline.run_url(&args.input, &factory, &mut sink)?;
  if run.is_complete() {
    info!(
      "完成: {} 个目标, 耗时 {:.2?}",
      run.detections.len(),
      now.elapsed()
    );
  } else {
    warn!(
      "完成: {} 个目标, {} 个批次失败, 耗时 {:.2?}",
      run.detections.len(),
      run.failed_batches.len(),
      now.elapsed()
    );
  }

  Ok(())
}
