//! 会话层
//!
//! 面向服务端场景的单组合处理：一个会话对应一次"上传两张图 →
//! 处理 → 查询结果"的交互。会话状态全部收拢在 `SessionStore` 里，
//! 外部只能通过 store 的方法读写；`SessionTask` 负责把一个就绪的
//! 会话交给 `StageRunner` 异步执行。

pub mod store;
pub mod task;

pub use store::{SessionSnapshot, SessionStatus, SessionStore, SlotKind};
pub use task::{SessionTask, StartOutcome};
