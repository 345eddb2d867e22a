//! 编排层
//!
//! - `batch_processor` - 批量处理器，管理资源、并发与全局统计
//! - `pair_processor` - 单个组合处理器，带编号日志与计时

pub mod batch_processor;
pub mod pair_processor;

pub use batch_processor::{App, PipelineStats};
pub use pair_processor::process_pair_indexed;
