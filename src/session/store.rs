//! 会话存储
//!
//! 所有会话状态集中在一把锁后面的 HashMap 里，字段读写只能经由
//! store 的方法完成，锁的临界区都很短，不含任何 IO 或 await。

use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::workflow::{CancelToken, ItemOutcome};

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// 刚创建，图片未齐
    Created,
    /// 两张图都已就位，可以启动
    Ready,
    /// 处理中
    Processing,
    /// 处理成功
    Completed,
    /// 处理失败
    Failed,
    /// 已取消
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }
}

/// 会话的两个图片槽位
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    User,
    Style,
}

/// 会话内部状态（只在 store 内可见）
#[derive(Debug)]
struct Session {
    user_image: Option<PathBuf>,
    style_image: Option<PathBuf>,
    status: SessionStatus,
    active_task_id: Option<String>,
    cancel: CancelToken,
    created_at: DateTime<Local>,
    outputs: Vec<String>,
    error: Option<String>,
}

impl Session {
    fn new() -> Self {
        Self {
            user_image: None,
            style_image: None,
            status: SessionStatus::Created,
            active_task_id: None,
            cancel: CancelToken::new(),
            created_at: Local::now(),
            outputs: Vec::new(),
            error: None,
        }
    }
}

/// 会话的对外快照
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub status: SessionStatus,
    pub active_task_id: Option<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Local>,
    pub outputs: Vec<String>,
    pub error: Option<String>,
}

/// 启动判定结果
#[derive(Debug)]
pub(crate) enum BeginRun {
    /// 可以启动，附两张图的路径与本次运行的取消令牌
    Started {
        user_image: PathBuf,
        style_image: PathBuf,
        cancel: CancelToken,
    },
    /// 已经在运行（每个会话同时至多一次运行）
    AlreadyProcessing,
    /// 图片未齐或已终态
    NotReady,
    NotFound,
}

/// 会话存储，可随意 clone，所有副本共享同一张表
#[derive(Clone, Default)]
pub struct SessionStore {
    inner: Arc<Mutex<HashMap<Uuid, Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Session>> {
        // 临界区内不会 panic，锁不会中毒；即便中毒也继续使用数据
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// 创建新会话，返回会话号
    pub fn create(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().insert(id, Session::new());
        info!("✓ 创建会话: {}", id);
        id
    }

    /// 填充一个图片槽位
    ///
    /// 两个槽位都就位后状态变为 `Ready`。处理中或已终态的会话
    /// 不接受新图片。返回是否写入成功。
    pub fn fill_slot(&self, id: Uuid, slot: SlotKind, path: PathBuf) -> bool {
        let mut sessions = self.lock();
        let Some(session) = sessions.get_mut(&id) else {
            return false;
        };
        if !matches!(session.status, SessionStatus::Created | SessionStatus::Ready) {
            return false;
        }
        match slot {
            SlotKind::User => session.user_image = Some(path),
            SlotKind::Style => session.style_image = Some(path),
        }
        if session.user_image.is_some() && session.style_image.is_some() {
            session.status = SessionStatus::Ready;
        }
        true
    }

    /// 读取会话快照
    pub fn snapshot(&self, id: Uuid) -> Option<SessionSnapshot> {
        let sessions = self.lock();
        sessions.get(&id).map(|s| SessionSnapshot {
            id,
            status: s.status,
            active_task_id: s.active_task_id.clone(),
            cancel_requested: s.cancel.is_cancelled(),
            created_at: s.created_at,
            outputs: s.outputs.clone(),
            error: s.error.clone(),
        })
    }

    /// 请求取消
    ///
    /// 只置位取消令牌并立即返回；终态由运行中的任务在下一个
    /// 检查点发布。对不存在的会话返回 false。
    pub fn request_cancel(&self, id: Uuid) -> bool {
        let sessions = self.lock();
        match sessions.get(&id) {
            Some(session) => {
                session.cancel.cancel();
                info!("✓ 会话 {} 已请求取消", id);
                true
            }
            None => false,
        }
    }

    /// 原子地判定并进入 `Processing`
    pub(crate) fn begin_run(&self, id: Uuid) -> BeginRun {
        let mut sessions = self.lock();
        let Some(session) = sessions.get_mut(&id) else {
            return BeginRun::NotFound;
        };
        if session.status == SessionStatus::Processing {
            return BeginRun::AlreadyProcessing;
        }
        let (Some(user), Some(style)) = (&session.user_image, &session.style_image) else {
            return BeginRun::NotReady;
        };
        if session.status.is_terminal() {
            return BeginRun::NotReady;
        }
        let user_image = user.clone();
        let style_image = style.clone();
        session.status = SessionStatus::Processing;
        session.active_task_id = None;
        BeginRun::Started {
            user_image,
            style_image,
            cancel: session.cancel.clone(),
        }
    }

    /// 登记运行中的远端任务号
    pub(crate) fn set_active_task(&self, id: Uuid, task_id: &str) {
        let mut sessions = self.lock();
        if let Some(session) = sessions.get_mut(&id) {
            session.active_task_id = Some(task_id.to_string());
        }
    }

    /// 发布终态
    ///
    /// 取消单调性：一旦请求过取消，终态不会是 `Completed`，
    /// 即使流程恰好在取消生效前跑完了。
    pub(crate) fn finish(&self, id: Uuid, outcome: ItemOutcome) {
        let mut sessions = self.lock();
        let Some(session) = sessions.get_mut(&id) else {
            return;
        };
        session.active_task_id = None;

        let cancel_requested = session.cancel.is_cancelled();
        match outcome {
            ItemOutcome::Success { outputs } | ItemOutcome::Cached { outputs } => {
                if cancel_requested {
                    session.status = SessionStatus::Cancelled;
                } else {
                    session.status = SessionStatus::Completed;
                    session.outputs = outputs;
                }
            }
            ItemOutcome::Failed { reason } => {
                session.status = SessionStatus::Failed;
                session.error = Some(reason);
            }
            ItemOutcome::Cancelled => {
                session.status = SessionStatus::Cancelled;
            }
        }
        info!("会话 {} 终态: {:?}", id, session.status);
    }

    /// 清理过期会话，返回被清理的数量
    ///
    /// 运行中的会话不清理，留给下一轮。被清理会话的临时图片
    /// 一并删除。
    pub fn reap_expired(&self, ttl: Duration) -> usize {
        let cutoff = Local::now()
            - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(24));

        let expired: Vec<(Uuid, Session)> = {
            let mut sessions = self.lock();
            let ids: Vec<Uuid> = sessions
                .iter()
                .filter(|(_, s)| s.created_at < cutoff && s.status != SessionStatus::Processing)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| sessions.remove(&id).map(|s| (id, s)))
                .collect()
        };

        for (id, session) in &expired {
            info!("🧹 清理过期会话: {}", id);
            for path in [&session.user_image, &session.style_image]
                .into_iter()
                .flatten()
            {
                if let Err(e) = std::fs::remove_file(path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("删除会话临时文件失败 {}: {}", path.display(), e);
                    }
                }
            }
        }
        expired.len()
    }

    /// 启动后台清理任务
    pub fn spawn_reaper(&self, ttl: Duration, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let reaped = store.reap_expired(ttl);
                if reaped > 0 {
                    info!("🧹 本轮清理了 {} 个过期会话", reaped);
                }
            }
        })
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, id: Uuid, age: Duration) {
        let mut sessions = self.lock();
        if let Some(session) = sessions.get_mut(&id) {
            session.created_at = Local::now()
                - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());
        }
    }
}
