//! 远端服务客户端层
//!
//! 两个外部服务的无状态请求封装：
//! - `gemini` - OpenRouter 上的 Gemini 图像预处理（单次请求/响应）
//! - `runninghub` - RunningHub 工作流（上传/提交/轮询/取结果/取消）
//!
//! 客户端只做 I/O，不含任何重试逻辑；重试和退避由 `workflow` 层负责。
//! 两个客户端都以 trait 作为接缝，测试时用桩实现替换。

pub mod gemini;
pub mod runninghub;

pub use gemini::{GeminiClient, ImageKind, PreprocessClient, PreprocessReply};
pub use runninghub::{
    NodeSlot, RunningHubClient, SubmitReply, TaskOutput, TaskStatus, WorkflowClient,
};
