// 该文件是 Tianye （田野） 项目的一部分。
// src/error.rs - 错误分类
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

use std::fmt;

/// 错误类别
///
/// 各模块的错误类型都通过 `kind()` 归入以下类别之一。
/// `Alignment` 与 `Inference` 只在单帧/单批次范围内发生，由所在阶段就地恢复；
/// 其余类别对所在阶段是致命的，由编排器在清理之后向上报告。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
  /// 视频、模型路径或配置无效
  InvalidInput,
  /// 单帧拼接失败
  Alignment,
  /// 单批次推理失败
  Inference,
  /// 暂存目录读写失败
  Io,
  /// 任务被取消
  Cancelled,
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ErrorKind::InvalidInput => "InvalidInputError",
      ErrorKind::Alignment => "AlignmentFailure",
      ErrorKind::Inference => "InferenceFailure",
      ErrorKind::Io => "IOError",
      ErrorKind::Cancelled => "Cancelled",
    };
    f.write_str(name)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn display_uses_taxonomy_names() {
    assert_eq!(ErrorKind::Io.to_string(), "IOError");
    assert_eq!(ErrorKind::InvalidInput.to_string(), "InvalidInputError");
  }
}
