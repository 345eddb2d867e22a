//! 错误类型定义
//!
//! 只有真正的故障才是错误：网络失败、响应格式错误、文件读写失败。
//! "队列已满"、"无图片产出"、"远端任务失败/取消"属于合法的业务结果，
//! 用各自的枚举值表达（见 `clients` 与 `workflow` 模块），不进入错误类型。

use thiserror::Error;

/// 流水线错误类型
#[derive(Debug, Error)]
pub enum PipelineError {
    /// 网络请求失败（传输层故障）
    #[error("网络请求失败 ({endpoint}): {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// API 返回错误响应（非队列已满的业务错误码）
    #[error("API返回错误响应 ({endpoint}): code={code:?}, message={message:?}")]
    BadResponse {
        endpoint: String,
        code: Option<i64>,
        message: Option<String>,
    },

    /// 文件操作失败
    #[error("文件操作失败 ({path}): {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// JSON 解析失败
    #[error("JSON解析失败: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// 创建传输层错误
    pub fn transport(endpoint: impl Into<String>, source: reqwest::Error) -> Self {
        PipelineError::Transport {
            endpoint: endpoint.into(),
            source,
        }
    }

    /// 创建文件操作错误
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }
}

/// 流水线结果类型别名
pub type Result<T> = std::result::Result<T, PipelineError>;
