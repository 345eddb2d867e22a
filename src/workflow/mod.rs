//! 流程层
//!
//! 定义"一对图片"的完整处理流程（两阶段状态机）：
//!
//! ```text
//! 预处理（每张图独立）: 查缓存 → Gemini 调用 → 无产出重试 → 兜底用原图
//! 提交与等待:          上传 → 提交（队列满退避）→ 轮询 → 取结果
//! ```
//!
//! 所有等待点都响应协作式取消（`CancelToken`）；任何失败都折叠为
//! 终态结果值，不向上抛异常。

pub mod cancel;
pub mod stage_runner;

pub use cancel::CancelToken;
pub use stage_runner::{
    AwaitOutcome, ItemOutcome, PairInput, Preprocessed, StageRunner, SubmitOutcome,
};
