//! 会话任务
//!
//! 把一个就绪的会话交给 `StageRunner` 在后台执行：启动时做
//! "同一会话至多一次运行"的判定，结束时把终态与结果发布回
//! store，并清理会话的临时输入文件。

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::ResultCache;
use crate::clients::{PreprocessClient, WorkflowClient};
use crate::config::RetryPolicy;
use crate::session::store::{BeginRun, SessionStore};
use crate::workflow::{PairInput, StageRunner};

/// 启动请求的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// 已进入后台处理
    Started,
    /// 该会话已有运行中的任务
    AlreadyProcessing,
    /// 图片未齐或会话已终态
    NotReady,
    /// 会话不存在
    NotFound,
}

/// 会话任务调度器
///
/// 持有构建 `StageRunner` 所需的共享资源；每次启动用会话自己的
/// 取消令牌新建一个 runner，取消因此只影响本会话。
pub struct SessionTask {
    store: SessionStore,
    cache: Arc<ResultCache>,
    preprocess_client: Arc<dyn PreprocessClient>,
    workflow_client: Arc<dyn WorkflowClient>,
    policy: RetryPolicy,
    results_dir: PathBuf,
}

impl SessionTask {
    pub fn new(
        store: SessionStore,
        cache: Arc<ResultCache>,
        preprocess_client: Arc<dyn PreprocessClient>,
        workflow_client: Arc<dyn WorkflowClient>,
        policy: RetryPolicy,
        results_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            cache,
            preprocess_client,
            workflow_client,
            policy,
            results_dir: results_dir.into(),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// 启动一个会话的处理
    ///
    /// 判定通过后立即返回 `Started`，实际处理在后台任务中进行；
    /// 调用方轮询 `snapshot` 获取终态。
    pub fn start(&self, id: Uuid) -> StartOutcome {
        let (user_image, style_image, cancel) = match self.store.begin_run(id) {
            BeginRun::Started {
                user_image,
                style_image,
                cancel,
            } => (user_image, style_image, cancel),
            BeginRun::AlreadyProcessing => return StartOutcome::AlreadyProcessing,
            BeginRun::NotReady => return StartOutcome::NotReady,
            BeginRun::NotFound => return StartOutcome::NotFound,
        };

        info!("🚀 会话 {} 开始处理", id);
        let runner = StageRunner::new(
            self.cache.clone(),
            self.preprocess_client.clone(),
            self.workflow_client.clone(),
            self.policy.clone(),
            &self.results_dir,
            cancel,
        );

        let store = self.store.clone();
        tokio::spawn(async move {
            let pair = PairInput::new(&user_image, &style_image);
            let task_store = store.clone();
            let outcome = runner
                .process_pair_observed(&pair, &move |task_id| {
                    task_store.set_active_task(id, task_id);
                })
                .await;

            store.finish(id, outcome);
            cleanup_temp_inputs(&[user_image, style_image]);
        });

        StartOutcome::Started
    }

    /// 请求取消一个会话
    ///
    /// 立即返回；运行中的任务在下一个检查点响应。
    pub fn cancel(&self, id: Uuid) -> bool {
        self.store.request_cancel(id)
    }
}

/// 会话输入是上传得来的临时文件，终态发布后即可删除
fn cleanup_temp_inputs(paths: &[PathBuf]) {
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => debug!("已删除会话临时文件: {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!("删除会话临时文件失败 {}: {}", path.display(), e),
        }
    }
}
