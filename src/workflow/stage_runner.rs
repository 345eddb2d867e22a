//! 两阶段状态机执行器
//!
//! 一个 `StageRunner` 驱动一对图片走完整个流程。失败语义：所有远端
//! 故障都在本层折叠为终态结果值（`Failed(原因)` / `Cancelled`），
//! 调用方永远拿到结果枚举，不会收到未处理的错误。
//!
//! 预处理是增强而非硬依赖：Gemini 无产出或调用失败时，用尽重试次数后
//! 回退到原图继续后续流程，绝不因此让整个组合失败。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{fingerprint_file, CacheCategory, Fingerprint, ResultCache};
use crate::clients::{
    ImageKind, NodeSlot, PreprocessClient, PreprocessReply, SubmitReply, TaskOutput, TaskStatus,
    WorkflowClient,
};
use crate::config::RetryPolicy;
use crate::workflow::cancel::CancelToken;

/// 一对待处理的输入图片
#[derive(Debug, Clone)]
pub struct PairInput {
    /// 用户照片
    pub user_path: PathBuf,
    /// 发型参考图
    pub style_path: PathBuf,
}

impl PairInput {
    pub fn new(user_path: impl Into<PathBuf>, style_path: impl Into<PathBuf>) -> Self {
        Self {
            user_path: user_path.into(),
            style_path: style_path.into(),
        }
    }

    /// 日志与结果文件名用的组合名
    pub fn label(&self) -> String {
        format!("{} + {}", file_stem(&self.user_path), file_stem(&self.style_path))
    }
}

/// 单张图预处理的结果
#[derive(Debug, Clone)]
pub enum Preprocessed {
    /// 可用于后续流程的图片路径（可能是缓存产物、新产物或回退的原图）
    Ready { path: PathBuf, from_cache: bool },
    /// 预处理期间观察到取消请求
    Cancelled,
}

/// 任务提交阶段的结果
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Submitted(String),
    Failed(String),
    Cancelled,
}

/// 任务等待阶段的结果
#[derive(Debug, Clone)]
pub enum AwaitOutcome {
    Success(Vec<TaskOutput>),
    Failed(String),
    Cancelled,
}

/// 一个组合的最终结果（四态，不是布尔加错误）
#[derive(Debug, Clone)]
pub enum ItemOutcome {
    /// 远端处理成功，附本地结果文件路径
    Success { outputs: Vec<String> },
    /// 整对命中最终结果缓存，未发起远端任务
    Cached { outputs: Vec<String> },
    /// 处理失败，附可读原因
    Failed { reason: String },
    /// 被协作式取消
    Cancelled,
}

/// 两阶段状态机执行器
pub struct StageRunner {
    cache: Arc<ResultCache>,
    preprocess_client: Arc<dyn PreprocessClient>,
    workflow_client: Arc<dyn WorkflowClient>,
    policy: RetryPolicy,
    results_dir: PathBuf,
    cancel: CancelToken,
}

impl StageRunner {
    pub fn new(
        cache: Arc<ResultCache>,
        preprocess_client: Arc<dyn PreprocessClient>,
        workflow_client: Arc<dyn WorkflowClient>,
        policy: RetryPolicy,
        results_dir: impl Into<PathBuf>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            cache,
            preprocess_client,
            workflow_client,
            policy,
            results_dir: results_dir.into(),
            cancel,
        }
    }

    // ========== 阶段一：预处理 ==========

    /// 预处理一张图
    ///
    /// 1. 指纹 → 查缓存，命中直接返回缓存产物
    /// 2. 未命中调 Gemini；无产出时重试到次数上限
    /// 3. 仍无产出（或调用一直失败）则回退用原图
    ///
    /// 每次远端调用前和每次重试等待都检查取消。
    pub async fn preprocess_image(&self, path: &Path, kind: ImageKind) -> Preprocessed {
        if self.cancel.is_cancelled() {
            return Preprocessed::Cancelled;
        }

        let category = match kind {
            ImageKind::User => CacheCategory::PreprocessedUser,
            ImageKind::Hairstyle => CacheCategory::PreprocessedStyle,
        };

        // 指纹算不出来就当缓存未命中，照常处理但不写缓存
        let fingerprint = match fingerprint_file(path) {
            Ok(fp) => Some(fp),
            Err(e) => {
                warn!("计算文件指纹失败，跳过缓存: {}", e);
                None
            }
        };

        if let Some(fp) = &fingerprint {
            if let Some(cached) = self.cache.lookup(fp, category).await {
                info!("✓ 找到缓存的{}图像: {}", kind.label(), file_stem(&cached));
                return Preprocessed::Ready {
                    path: cached,
                    from_cache: true,
                };
            }
        }

        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("读取图片失败，使用原图: {} ({})", path.display(), e);
                return self.degraded(path);
            }
        };

        for attempt in 1..=self.policy.preprocess_attempts {
            if self.cancel.is_cancelled() {
                return Preprocessed::Cancelled;
            }

            match self.preprocess_client.preprocess(&bytes, kind).await {
                Ok(PreprocessReply::Image(output)) => {
                    match self.save_preprocessed(path, kind, category, &fingerprint, &output).await
                    {
                        Ok(saved) => {
                            info!("✓ Gemini {}预处理成功: {}", kind.label(), file_stem(&saved));
                            return Preprocessed::Ready {
                                path: saved,
                                from_cache: false,
                            };
                        }
                        Err(e) => {
                            warn!("保存预处理产物失败，使用原图: {}", e);
                            return self.degraded(path);
                        }
                    }
                }
                Ok(PreprocessReply::NoImage) => {
                    warn!(
                        "预处理响应中无图片数据 (尝试 {}/{})",
                        attempt, self.policy.preprocess_attempts
                    );
                }
                Err(e) => {
                    warn!(
                        "预处理调用失败 (尝试 {}/{}): {}",
                        attempt, self.policy.preprocess_attempts, e
                    );
                }
            }

            if attempt < self.policy.preprocess_attempts
                && self
                    .cancel
                    .sleep_interruptible(self.policy.preprocess_retry_delay)
                    .await
            {
                return Preprocessed::Cancelled;
            }
        }

        self.degraded(path)
    }

    fn degraded(&self, original: &Path) -> Preprocessed {
        info!("达到最大重试次数，使用原图: {}", file_stem(original));
        Preprocessed::Ready {
            path: original.to_path_buf(),
            from_cache: false,
        }
    }

    /// 保存预处理产物并登记缓存
    async fn save_preprocessed(
        &self,
        source: &Path,
        kind: ImageKind,
        category: CacheCategory,
        fingerprint: &Option<Fingerprint>,
        bytes: &[u8],
    ) -> crate::error::Result<PathBuf> {
        let suffix = match fingerprint {
            Some(fp) => fp.short().to_string(),
            None => chrono::Local::now().format("%Y%m%d_%H%M%S").to_string(),
        };
        let file_name = format!("{}_{}_gemini_processed.png", file_stem(source), suffix);
        let dest = self.cache.category_dir(category).join(file_name);

        tokio::fs::write(&dest, bytes)
            .await
            .map_err(|e| crate::error::PipelineError::io(dest.display().to_string(), e))?;

        if let Some(fp) = fingerprint {
            self.cache.insert(fp, category, source, &dest).await?;
        } else {
            debug!("无指纹，{}预处理产物不登记缓存", kind.label());
        }
        Ok(dest)
    }

    // ========== 阶段二：提交与等待 ==========

    /// 提交任务，队列已满时按固定间隔退避重试
    ///
    /// 每次提交前和每次退避等待都检查取消；重试次数用尽仍满则判失败
    /// （"容量耗尽"）。传输失败同样消耗一次尝试机会。
    pub async fn submit_with_retry(&self, slots: &[NodeSlot]) -> SubmitOutcome {
        let max_retries = self.policy.submit_max_retries;

        for attempt in 1..=max_retries {
            if self.cancel.is_cancelled() {
                return SubmitOutcome::Cancelled;
            }

            match self.workflow_client.submit(slots).await {
                Ok(SubmitReply::Submitted(task_id)) => {
                    info!("✓ 任务提交成功: {}", task_id);
                    return SubmitOutcome::Submitted(task_id);
                }
                Ok(SubmitReply::Busy) => {
                    warn!(
                        "任务队列已满 (尝试 {}/{})，等待 {:?} 后重试...",
                        attempt, max_retries, self.policy.submit_retry_delay
                    );
                }
                Err(e) => {
                    warn!("任务提交失败 (尝试 {}/{}): {}", attempt, max_retries, e);
                }
            }

            if attempt < max_retries
                && self
                    .cancel
                    .sleep_interruptible(self.policy.submit_retry_delay)
                    .await
            {
                return SubmitOutcome::Cancelled;
            }
        }

        SubmitOutcome::Failed("任务队列已满，重试次数耗尽".to_string())
    }

    /// 轮询等待任务终态
    ///
    /// 每轮：检查取消 → 查状态 → 睡一个轮询间隔，整体受墙钟超时约束。
    /// 观察到取消后会尽力通知远端取消（其失败不影响本地结果），
    /// 并且不再发起除取消外的任何远端调用。
    pub async fn await_task(&self, task_id: &str) -> AwaitOutcome {
        let deadline = Instant::now() + self.policy.poll_timeout;

        loop {
            if self.cancel.is_cancelled() {
                self.cancel_remote(task_id).await;
                return AwaitOutcome::Cancelled;
            }

            if Instant::now() >= deadline {
                warn!("任务 {} 等待超时", task_id);
                return AwaitOutcome::Failed("任务超时".to_string());
            }

            match self.workflow_client.poll(task_id).await {
                Ok(TaskStatus::Success) => break,
                Ok(TaskStatus::Failed) => {
                    return AwaitOutcome::Failed("远端任务失败: FAILED".to_string());
                }
                Ok(TaskStatus::Cancelled) => {
                    info!("任务 {} 已在远端被取消", task_id);
                    return AwaitOutcome::Cancelled;
                }
                Ok(status) => {
                    debug!("任务 {} 状态: {}，继续等待", task_id, status);
                }
                Err(e) => {
                    // 单次查询失败不判死刑，留给超时兜底
                    warn!("状态查询失败，继续等待: {}", e);
                }
            }

            if self
                .cancel
                .sleep_interruptible(self.policy.poll_interval)
                .await
            {
                self.cancel_remote(task_id).await;
                return AwaitOutcome::Cancelled;
            }
        }

        match self.workflow_client.fetch(task_id).await {
            Ok(outputs) => {
                info!("✓ 任务 {} 完成，产出 {} 个文件", task_id, outputs.len());
                AwaitOutcome::Success(outputs)
            }
            Err(e) => AwaitOutcome::Failed(format!("获取结果失败: {}", e)),
        }
    }

    /// 尽力通知远端取消；失败只记日志，不改变本地结果
    async fn cancel_remote(&self, task_id: &str) {
        match self.workflow_client.cancel(task_id).await {
            Ok(true) => info!("✓ 已通知远端取消任务 {}", task_id),
            Ok(false) => warn!("远端未确认取消任务 {}", task_id),
            Err(e) => warn!("远端取消调用失败 (任务 {}): {}", task_id, e),
        }
    }

    /// 上传两张图并提交任务，等到终态
    pub async fn run_workflow(&self, user_path: &Path, style_path: &Path) -> AwaitOutcome {
        self.run_workflow_observed(user_path, style_path, &|_| {}).await
    }

    /// 同 `run_workflow`，提交成功后把任务号回调给调用方
    ///
    /// 会话场景用它在提交与等待之间登记 active_task_id。
    pub async fn run_workflow_observed(
        &self,
        user_path: &Path,
        style_path: &Path,
        on_submitted: &(dyn Fn(&str) + Send + Sync),
    ) -> AwaitOutcome {
        if self.cancel.is_cancelled() {
            return AwaitOutcome::Cancelled;
        }

        let user_name = match self.workflow_client.upload(user_path).await {
            Ok(name) => name,
            Err(e) => return AwaitOutcome::Failed(format!("用户图片上传失败: {}", e)),
        };

        if self.cancel.is_cancelled() {
            return AwaitOutcome::Cancelled;
        }

        let style_name = match self.workflow_client.upload(style_path).await {
            Ok(name) => name,
            Err(e) => return AwaitOutcome::Failed(format!("发型图片上传失败: {}", e)),
        };

        let slots = [NodeSlot::hairstyle(style_name), NodeSlot::user(user_name)];

        let task_id = match self.submit_with_retry(&slots).await {
            SubmitOutcome::Submitted(id) => id,
            SubmitOutcome::Failed(reason) => return AwaitOutcome::Failed(reason),
            SubmitOutcome::Cancelled => return AwaitOutcome::Cancelled,
        };
        on_submitted(&task_id);

        self.await_task(&task_id).await
    }

    // ========== 整对流程 ==========

    /// 处理一对图片，产出四态结果
    ///
    /// 组合指纹命中最终结果缓存时整对跳过远端流程（`Cached`）。
    pub async fn process_pair(&self, pair: &PairInput) -> ItemOutcome {
        self.process_pair_observed(pair, &|_| {}).await
    }

    /// 同 `process_pair`，提交成功后把任务号回调给调用方
    pub async fn process_pair_observed(
        &self,
        pair: &PairInput,
        on_submitted: &(dyn Fn(&str) + Send + Sync),
    ) -> ItemOutcome {
        // 整对缓存检查
        let combined = self.pair_fingerprint(pair);
        if let Some(fp) = &combined {
            if let Some(cached) = self.cache.lookup(fp, CacheCategory::FinalOutput).await {
                info!("✓ 组合命中最终结果缓存: {}", pair.label());
                return ItemOutcome::Cached {
                    outputs: vec![cached.display().to_string()],
                };
            }
        }

        // 两张图互不依赖，并行预处理
        let (user_result, style_result) = futures::future::join(
            self.preprocess_image(&pair.user_path, ImageKind::User),
            self.preprocess_image(&pair.style_path, ImageKind::Hairstyle),
        )
        .await;
        let user_ready = match user_result {
            Preprocessed::Ready { path, .. } => path,
            Preprocessed::Cancelled => return ItemOutcome::Cancelled,
        };
        let style_ready = match style_result {
            Preprocessed::Ready { path, .. } => path,
            Preprocessed::Cancelled => return ItemOutcome::Cancelled,
        };

        // 提交远端工作流并等待
        let outputs = match self
            .run_workflow_observed(&user_ready, &style_ready, on_submitted)
            .await
        {
            AwaitOutcome::Success(outputs) => outputs,
            AwaitOutcome::Failed(reason) => return ItemOutcome::Failed { reason },
            AwaitOutcome::Cancelled => return ItemOutcome::Cancelled,
        };

        // 取消可能恰好落在远端完成之后
        if self.cancel.is_cancelled() {
            return ItemOutcome::Cancelled;
        }

        // 下载结果并登记最终结果缓存；下载期间观察到取消则结果作废
        match self.collect_outputs(pair, &outputs, &combined).await {
            Some(_) if self.cancel.is_cancelled() => ItemOutcome::Cancelled,
            Some(local) => ItemOutcome::Success { outputs: local },
            None if self.cancel.is_cancelled() => ItemOutcome::Cancelled,
            None => ItemOutcome::Failed {
                reason: "结果下载失败".to_string(),
            },
        }
    }

    fn pair_fingerprint(&self, pair: &PairInput) -> Option<Fingerprint> {
        let user = fingerprint_file(&pair.user_path).ok()?;
        let style = fingerprint_file(&pair.style_path).ok()?;
        Some(user.combine(&style))
    }

    /// 下载全部产出；单个文件失败跳过，全军覆没才算失败
    ///
    /// 每个文件下载前检查取消，取消打断下载时半套结果整体作废。
    /// 只有全部产出都落盘才登记最终结果缓存，残缺结果不能污染
    /// 后续同组合的查询。
    async fn collect_outputs(
        &self,
        pair: &PairInput,
        outputs: &[TaskOutput],
        combined: &Option<Fingerprint>,
    ) -> Option<Vec<String>> {
        if let Err(e) = tokio::fs::create_dir_all(&self.results_dir).await {
            warn!("创建结果目录失败: {}", e);
            return None;
        }

        let mut local_paths = Vec::new();
        for (i, output) in outputs.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!("下载被取消，丢弃已下载的 {} 个结果", local_paths.len());
                return None;
            }
            let file_name = format!(
                "{}_{}_result_{}.png",
                file_stem(&pair.user_path),
                file_stem(&pair.style_path),
                i
            );
            let dest = self.results_dir.join(file_name);
            match self.workflow_client.download(&output.file_url, &dest).await {
                Ok(()) => local_paths.push(dest),
                Err(e) => warn!("下载结果失败 ({}): {}", output.file_url, e),
            }
        }

        if local_paths.is_empty() {
            return None;
        }

        if local_paths.len() == outputs.len() {
            if let Some(fp) = combined {
                if let Err(e) = self
                    .cache
                    .insert(fp, CacheCategory::FinalOutput, &pair.user_path, &local_paths[0])
                    .await
                {
                    warn!("登记最终结果缓存失败: {}", e);
                }
            }
        }

        Some(local_paths.iter().map(|p| p.display().to_string()).collect())
    }
}

/// 不带扩展名的文件名（日志与产物命名用）
fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// 毫秒级策略，测试不打瞌睡
    fn fast_policy(submit_max_retries: usize) -> RetryPolicy {
        RetryPolicy {
            preprocess_attempts: 2,
            preprocess_retry_delay: Duration::from_millis(5),
            submit_max_retries,
            submit_retry_delay: Duration::from_millis(10),
            poll_interval: Duration::from_millis(10),
            poll_timeout: Duration::from_millis(200),
        }
    }

    /// 预处理桩：固定应答并统计调用次数
    struct StubPreprocess {
        reply: fn() -> crate::error::Result<PreprocessReply>,
        calls: AtomicUsize,
    }

    impl StubPreprocess {
        fn no_image() -> Self {
            Self {
                reply: || Ok(PreprocessReply::NoImage),
                calls: AtomicUsize::new(0),
            }
        }

        fn with_image() -> Self {
            Self {
                reply: || Ok(PreprocessReply::Image(b"generated".to_vec())),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PreprocessClient for StubPreprocess {
        async fn preprocess(
            &self,
            _image_bytes: &[u8],
            _kind: ImageKind,
        ) -> crate::error::Result<PreprocessReply> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.reply)()
        }
    }

    /// 工作流桩
    struct StubWorkflow {
        submit_calls: AtomicUsize,
        cancel_calls: AtomicUsize,
        always_busy: bool,
        poll_status: TaskStatus,
    }

    impl StubWorkflow {
        fn busy() -> Self {
            Self {
                submit_calls: AtomicUsize::new(0),
                cancel_calls: AtomicUsize::new(0),
                always_busy: true,
                poll_status: TaskStatus::Running,
            }
        }

        fn with_status(status: TaskStatus) -> Self {
            Self {
                submit_calls: AtomicUsize::new(0),
                cancel_calls: AtomicUsize::new(0),
                always_busy: false,
                poll_status: status,
            }
        }
    }

    #[async_trait]
    impl WorkflowClient for StubWorkflow {
        async fn upload(&self, image_path: &Path) -> crate::error::Result<String> {
            Ok(file_stem(image_path))
        }

        async fn submit(&self, _slots: &[NodeSlot]) -> crate::error::Result<SubmitReply> {
            self.submit_calls.fetch_add(1, Ordering::SeqCst);
            if self.always_busy {
                Ok(SubmitReply::Busy)
            } else {
                Ok(SubmitReply::Submitted("task-1".to_string()))
            }
        }

        async fn poll(&self, _task_id: &str) -> crate::error::Result<TaskStatus> {
            Ok(self.poll_status)
        }

        async fn fetch(&self, _task_id: &str) -> crate::error::Result<Vec<TaskOutput>> {
            Ok(vec![TaskOutput {
                file_url: "https://example.com/result.png".to_string(),
                file_type: "png".to_string(),
                cost_time: Some(1.5),
            }])
        }

        async fn cancel(&self, _task_id: &str) -> crate::error::Result<bool> {
            self.cancel_calls.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }

        async fn download(&self, _url: &str, dest: &Path) -> crate::error::Result<()> {
            tokio::fs::write(dest, b"downloaded")
                .await
                .map_err(|e| crate::error::PipelineError::io(dest.display().to_string(), e))
        }
    }

    /// 提交即成功、两个产出文件，第一个下载完成后触发取消的桩
    struct CancelMidDownloadWorkflow {
        cancel: CancelToken,
        download_calls: AtomicUsize,
    }

    #[async_trait]
    impl WorkflowClient for CancelMidDownloadWorkflow {
        async fn upload(&self, image_path: &Path) -> crate::error::Result<String> {
            Ok(file_stem(image_path))
        }

        async fn submit(&self, _slots: &[NodeSlot]) -> crate::error::Result<SubmitReply> {
            Ok(SubmitReply::Submitted("task-1".to_string()))
        }

        async fn poll(&self, _task_id: &str) -> crate::error::Result<TaskStatus> {
            Ok(TaskStatus::Success)
        }

        async fn fetch(&self, _task_id: &str) -> crate::error::Result<Vec<TaskOutput>> {
            Ok(vec![
                TaskOutput {
                    file_url: "https://example.com/r0.png".to_string(),
                    file_type: "png".to_string(),
                    cost_time: None,
                },
                TaskOutput {
                    file_url: "https://example.com/r1.png".to_string(),
                    file_type: "png".to_string(),
                    cost_time: None,
                },
            ])
        }

        async fn cancel(&self, _task_id: &str) -> crate::error::Result<bool> {
            Ok(true)
        }

        async fn download(&self, _url: &str, dest: &Path) -> crate::error::Result<()> {
            tokio::fs::write(dest, b"downloaded")
                .await
                .map_err(|e| crate::error::PipelineError::io(dest.display().to_string(), e))?;
            self.download_calls.fetch_add(1, Ordering::SeqCst);
            self.cancel.cancel();
            Ok(())
        }
    }

    fn make_runner(
        dir: &Path,
        preprocess: Arc<StubPreprocess>,
        workflow: Arc<StubWorkflow>,
        policy: RetryPolicy,
        cancel: CancelToken,
    ) -> StageRunner {
        let cache = Arc::new(ResultCache::new(dir.join("outputs")).unwrap());
        StageRunner::new(
            cache,
            preprocess,
            workflow,
            policy,
            dir.join("results"),
            cancel,
        )
    }

    fn write_input(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[tokio::test]
    async fn test_busy_retry_bound_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = Arc::new(StubWorkflow::busy());
        let runner = make_runner(
            dir.path(),
            Arc::new(StubPreprocess::no_image()),
            workflow.clone(),
            fast_policy(4),
            CancelToken::new(),
        );

        let outcome = runner.submit_with_retry(&[NodeSlot::user("u.png")]).await;

        match outcome {
            SubmitOutcome::Failed(reason) => assert!(reason.contains("队列已满")),
            other => panic!("应当判失败，实际: {:?}", other),
        }
        // 恰好 N 次提交调用，不多不少
        assert_eq!(workflow.submit_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_degrade_to_original_when_no_image() {
        let dir = tempfile::tempdir().unwrap();
        let preprocess = Arc::new(StubPreprocess::no_image());
        let runner = make_runner(
            dir.path(),
            preprocess.clone(),
            Arc::new(StubWorkflow::with_status(TaskStatus::Success)),
            fast_policy(1),
            CancelToken::new(),
        );

        let input = write_input(dir.path(), "user.jpg", b"user photo");
        let result = runner.preprocess_image(&input, ImageKind::User).await;

        match result {
            Preprocessed::Ready { path, from_cache } => {
                // 兜底：原图原样返回，不算失败
                assert_eq!(path, input);
                assert!(!from_cache);
            }
            Preprocessed::Cancelled => panic!("不应被取消"),
        }
        assert_eq!(preprocess.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_preprocess_result_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let preprocess = Arc::new(StubPreprocess::with_image());
        let runner = make_runner(
            dir.path(),
            preprocess.clone(),
            Arc::new(StubWorkflow::with_status(TaskStatus::Success)),
            fast_policy(1),
            CancelToken::new(),
        );

        let input = write_input(dir.path(), "user.jpg", b"same bytes");

        let first = runner.preprocess_image(&input, ImageKind::User).await;
        let Preprocessed::Ready { from_cache: false, .. } = first else {
            panic!("第一次应当是新产物");
        };

        // 相同字节的第二次处理必须完全走缓存，不再调远端
        let second = runner.preprocess_image(&input, ImageKind::User).await;
        let Preprocessed::Ready { from_cache: true, .. } = second else {
            panic!("第二次应当命中缓存");
        };
        assert_eq!(preprocess.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_submit_makes_no_calls() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = Arc::new(StubWorkflow::busy());
        let cancel = CancelToken::new();
        cancel.cancel();

        let runner = make_runner(
            dir.path(),
            Arc::new(StubPreprocess::no_image()),
            workflow.clone(),
            fast_policy(5),
            cancel,
        );

        let outcome = runner.submit_with_retry(&[NodeSlot::user("u.png")]).await;
        assert!(matches!(outcome, SubmitOutcome::Cancelled));
        assert_eq!(workflow.submit_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_busy_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = Arc::new(StubWorkflow::busy());
        let cancel = CancelToken::new();

        let policy = RetryPolicy {
            submit_retry_delay: Duration::from_secs(30),
            ..fast_policy(10)
        };
        let runner = make_runner(
            dir.path(),
            Arc::new(StubPreprocess::no_image()),
            workflow.clone(),
            policy,
            cancel.clone(),
        );

        let background = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            background.cancel();
        });

        let outcome = runner.submit_with_retry(&[NodeSlot::user("u.png")]).await;
        assert!(matches!(outcome, SubmitOutcome::Cancelled));
        // 第一次提交后进入退避，取消打断了等待，不会有第二次提交
        assert_eq!(workflow.submit_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_await_task_success_fetches_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let runner = make_runner(
            dir.path(),
            Arc::new(StubPreprocess::no_image()),
            Arc::new(StubWorkflow::with_status(TaskStatus::Success)),
            fast_policy(1),
            CancelToken::new(),
        );

        match runner.await_task("task-1").await {
            AwaitOutcome::Success(outputs) => assert_eq!(outputs.len(), 1),
            other => panic!("应当成功，实际: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_await_task_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let runner = make_runner(
            dir.path(),
            Arc::new(StubPreprocess::no_image()),
            Arc::new(StubWorkflow::with_status(TaskStatus::Running)),
            fast_policy(1),
            CancelToken::new(),
        );

        match runner.await_task("task-1").await {
            AwaitOutcome::Failed(reason) => assert!(reason.contains("超时")),
            other => panic!("应当超时失败，实际: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_await_task_remote_failure_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let runner = make_runner(
            dir.path(),
            Arc::new(StubPreprocess::no_image()),
            Arc::new(StubWorkflow::with_status(TaskStatus::Failed)),
            fast_policy(1),
            CancelToken::new(),
        );

        match runner.await_task("task-1").await {
            AwaitOutcome::Failed(reason) => assert!(reason.contains("FAILED")),
            other => panic!("应当失败，实际: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_during_poll_notifies_remote() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = Arc::new(StubWorkflow::with_status(TaskStatus::Running));
        let cancel = CancelToken::new();

        let runner = make_runner(
            dir.path(),
            Arc::new(StubPreprocess::no_image()),
            workflow.clone(),
            RetryPolicy {
                poll_timeout: Duration::from_secs(30),
                ..fast_policy(1)
            },
            cancel.clone(),
        );

        let background = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            background.cancel();
        });

        let outcome = runner.await_task("task-1").await;
        assert!(matches!(outcome, AwaitOutcome::Cancelled));
        assert_eq!(workflow.cancel_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_download_discards_partial_results() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();
        let workflow = Arc::new(CancelMidDownloadWorkflow {
            cancel: cancel.clone(),
            download_calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(ResultCache::new(dir.path().join("outputs")).unwrap());
        let runner = StageRunner::new(
            cache.clone(),
            Arc::new(StubPreprocess::no_image()),
            workflow.clone(),
            fast_policy(1),
            dir.path().join("results"),
            cancel,
        );

        let user = write_input(dir.path(), "user.jpg", b"user bytes");
        let style = write_input(dir.path(), "style.jpg", b"style bytes");
        let pair = PairInput::new(&user, &style);

        // 第一个结果下载后触发取消：半套结果作废，整对判取消
        let outcome = runner.process_pair(&pair).await;
        assert!(matches!(outcome, ItemOutcome::Cancelled));
        assert_eq!(workflow.download_calls.load(Ordering::SeqCst), 1);

        // 残缺结果不得登记最终结果缓存
        let stats = cache.stats(CacheCategory::FinalOutput).await;
        assert_eq!(stats.total, 0);
    }

    #[tokio::test]
    async fn test_process_pair_full_flow_then_cached() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = Arc::new(StubWorkflow::with_status(TaskStatus::Success));
        let runner = make_runner(
            dir.path(),
            Arc::new(StubPreprocess::with_image()),
            workflow.clone(),
            fast_policy(1),
            CancelToken::new(),
        );

        let user = write_input(dir.path(), "user.jpg", b"user bytes");
        let style = write_input(dir.path(), "style.jpg", b"style bytes");
        let pair = PairInput::new(&user, &style);

        let first = runner.process_pair(&pair).await;
        assert!(matches!(first, ItemOutcome::Success { .. }));
        assert_eq!(workflow.submit_calls.load(Ordering::SeqCst), 1);

        // 同一对输入的第二次处理整对命中最终结果缓存，不再提交任务
        let second = runner.process_pair(&pair).await;
        assert!(matches!(second, ItemOutcome::Cached { .. }));
        assert_eq!(workflow.submit_calls.load(Ordering::SeqCst), 1);
    }
}
