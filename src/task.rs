// 该文件是 Tianye （田野） 项目的一部分。
// src/task.rs - 任务与取消
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

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::{thread, time::Duration};

use thiserror::Error;
use tracing::{info, warn};

/// 输入 + 模型 + 输出 组成的任务
pub trait Task<I, M, O>: Sized {
  type Output;
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<Self::Output, Self::Error>;
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("任务已取消")]
pub struct Cancelled;

/// 协作式取消令牌
///
/// 各阶段在处理完一帧、一行或一个批次之后检查令牌。
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
  flag: Arc<AtomicBool>,
}

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.flag.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.flag.load(Ordering::SeqCst)
  }

  pub fn check(&self) -> Result<(), Cancelled> {
    if self.is_cancelled() {
      Err(Cancelled)
    } else {
      Ok(())
    }
  }
}

/// 将 Ctrl-C 绑定到取消令牌
///
/// 收到中断信号后置位令牌；若 `grace` 时间内进程仍未退出，则强制退出。
pub fn install_interrupt_handler(token: CancelToken, grace: Duration) -> Result<(), ctrlc::Error> {
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    token.cancel();
    thread::spawn(move || {
      thread::sleep(grace);
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn clones_share_cancellation() {
    let token = CancelToken::new();
    let other = token.clone();
    assert!(token.check().is_ok());
    other.cancel();
    assert!(token.is_cancelled());
    assert_eq!(token.check(), Err(Cancelled));
  }
}
