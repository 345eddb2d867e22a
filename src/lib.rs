//! # Hairstyle Pipeline
//!
//! 一个用于批量发型迁移处理的 Rust 应用程序
//!
//! ## 架构设计
//!
//! 本系统采用严格的分层架构：
//!
//! ### ① 缓存层（Cache）
//! - `cache/` - 以内容指纹为键的结果缓存
//! - `Fingerprint` - 文件内容的 SHA-256 指纹
//! - `ResultCache` - 按类别分目录的 JSON 索引
//!
//! ### ② 客户端层（Clients）
//! - `clients/` - 两个远端服务的无状态封装，trait 接缝
//! - `GeminiClient` - OpenRouter 图像预处理能力
//! - `RunningHubClient` - 工作流提交/轮询/取结果能力
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一对图片"的完整处理流程
//! - `StageRunner` - 两阶段状态机（预处理 → 提交与等待）
//! - `CancelToken` - 协作式取消
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/batch_processor` - 批量处理器，管理资源和并发
//! - `orchestrator/pair_processor` - 单个组合处理器
//! - `session/` - 面向服务端场景的会话调度（单组合、可取消、TTL 清理）
//!
//! ## 模块结构

pub mod cache;
pub mod clients;
pub mod config;
pub mod error;

pub mod orchestrator;
pub mod session;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use cache::{fingerprint_file, CacheCategory, Fingerprint, ResultCache};
pub use clients::{GeminiClient, ImageKind, PreprocessClient, RunningHubClient, WorkflowClient};
pub use config::{Config, RetryPolicy};
pub use error::{PipelineError, Result};
pub use orchestrator::{App, PipelineStats};
pub use session::{SessionStatus, SessionStore, SessionTask};
pub use workflow::{CancelToken, ItemOutcome, PairInput, StageRunner};
