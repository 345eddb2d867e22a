//! 批量发型处理器 - 编排层
//!
//! ## 职责
//!
//! 本模块是命令行入口的顶层编排器，负责批量组合的处理和资源管理。
//!
//! ## 核心功能
//!
//! 1. **应用初始化**：启动日志、建缓存目录、创建两个远端客户端
//! 2. **组合加载**：扫描 user/ 与 hairstyle/ 目录并做笛卡尔积
//! 3. **并发控制**：使用 Semaphore 限制同时在途的组合数量
//! 4. **全局统计**：按结果四态计数，汇总耗时与吞吐
//!
//! ## 设计特点
//!
//! - **顶层编排**：不处理单个组合的细节，向下委托 pair_processor
//! - **资源所有者**：唯一持有客户端与缓存的模块，经 Arc 共享给任务

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tracing::{error, info, warn};

use crate::cache::ResultCache;
use crate::clients::{GeminiClient, RunningHubClient};
use crate::config::Config;
use crate::orchestrator::pair_processor;
use crate::utils::image::scan_image_files;
use crate::utils::logging;
use crate::workflow::{CancelToken, ItemOutcome, PairInput, StageRunner};

/// 应用主结构
pub struct App {
    config: Config,
    runner: Arc<StageRunner>,
}

impl App {
    /// 初始化应用
    pub async fn initialize(config: Config) -> Result<Self> {
        // 初始化日志文件
        logging::init_log_file(&config.output_log_file)?;
        logging::log_startup(config.max_workers);

        let cache = Arc::new(ResultCache::new(&config.output_base_dir)?);
        let gemini = Arc::new(GeminiClient::new(&config));
        let runninghub = Arc::new(RunningHubClient::new(&config));

        let runner = Arc::new(StageRunner::new(
            cache,
            gemini,
            runninghub,
            config.retry_policy(),
            &config.results_dir,
            CancelToken::new(),
        ));

        Ok(Self { config, runner })
    }

    /// 运行应用主逻辑
    pub async fn run(&self) -> Result<()> {
        let all_pairs = self.load_pairs();

        if all_pairs.is_empty() {
            warn!("⚠️ 没有找到待处理的图片组合，程序结束");
            return Ok(());
        }

        let stats = self.process_all_pairs(all_pairs).await;
        print_final_stats(&stats, &self.config);

        Ok(())
    }

    /// 扫描输入目录并构建组合
    ///
    /// `input_dir/user/` 的每张图与 `input_dir/hairstyle/` 的每张图
    /// 两两组合。
    fn load_pairs(&self) -> Vec<PairInput> {
        info!("\n📁 正在扫描待处理的图片...");
        let input_dir = Path::new(&self.config.input_dir);
        let users = scan_image_files(&input_dir.join("user"));
        let styles = scan_image_files(&input_dir.join("hairstyle"));

        let mut pairs = Vec::with_capacity(users.len() * styles.len());
        for user in &users {
            for style in &styles {
                pairs.push(PairInput::new(user, style));
            }
        }
        logging::log_pairs_loaded(users.len(), styles.len(), pairs.len());
        pairs
    }

    /// 处理所有组合
    ///
    /// 一次性 spawn 全部任务，由 Semaphore 保证同时在途的数量
    /// 不超过 `max_workers`。每个任务完成后立即在共享统计里记账，
    /// 统计与完成顺序无关。
    async fn process_all_pairs(&self, all_pairs: Vec<PairInput>) -> PipelineStats {
        let semaphore = Arc::new(Semaphore::new(self.config.max_workers));
        let started = Instant::now();
        let stats = Arc::new(Mutex::new(PipelineStats::new(all_pairs.len())));

        let mut handles = Vec::with_capacity(all_pairs.len());
        for (idx, pair) in all_pairs.into_iter().enumerate() {
            let pair_index = idx + 1;
            let semaphore = semaphore.clone();
            let runner = self.runner.clone();
            let stats = stats.clone();

            let handle = tokio::spawn(async move {
                // acquire 只在 Semaphore 被 close 时出错，这里不会发生
                let _permit = semaphore.acquire_owned().await;
                let (outcome, elapsed) =
                    pair_processor::process_pair_indexed(&runner, &pair, pair_index).await;
                stats.lock().await.record(&outcome, elapsed);
            });
            handles.push((pair_index, handle));
        }

        for (pair_index, handle) in handles {
            if let Err(e) = handle.await {
                error!("[组合 {}] 任务执行失败: {}", pair_index, e);
                stats.lock().await.record(
                    &ItemOutcome::Failed {
                        reason: e.to_string(),
                    },
                    Duration::ZERO,
                );
            }
        }

        let mut stats = stats.lock().await.clone();
        stats.wall_time = started.elapsed();
        stats
    }
}

/// 全局处理统计
#[derive(Debug, Clone)]
pub struct PipelineStats {
    pub total: usize,
    pub success: usize,
    pub cached: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// 全程墙钟时间
    pub wall_time: Duration,
    latency_min: Option<Duration>,
    latency_max: Duration,
    latency_sum: Duration,
    latency_count: usize,
}

impl PipelineStats {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            success: 0,
            cached: 0,
            failed: 0,
            cancelled: 0,
            wall_time: Duration::ZERO,
            latency_min: None,
            latency_max: Duration::ZERO,
            latency_sum: Duration::ZERO,
            latency_count: 0,
        }
    }

    /// 记录一个组合的结果与耗时
    pub fn record(&mut self, outcome: &ItemOutcome, elapsed: Duration) {
        match outcome {
            ItemOutcome::Success { .. } => self.success += 1,
            ItemOutcome::Cached { .. } => self.cached += 1,
            ItemOutcome::Failed { .. } => self.failed += 1,
            ItemOutcome::Cancelled => self.cancelled += 1,
        }
        // 缓存命中几乎不耗时，不计入延迟分布
        if matches!(outcome, ItemOutcome::Success { .. } | ItemOutcome::Failed { .. }) {
            self.latency_min = Some(self.latency_min.map_or(elapsed, |m| m.min(elapsed)));
            self.latency_max = self.latency_max.max(elapsed);
            self.latency_sum += elapsed;
            self.latency_count += 1;
        }
    }

    /// 实际处理过的组合的平均耗时
    pub fn latency_mean(&self) -> Option<Duration> {
        if self.latency_count == 0 {
            None
        } else {
            Some(self.latency_sum / self.latency_count as u32)
        }
    }

    pub fn latency_min(&self) -> Option<Duration> {
        self.latency_min
    }

    pub fn latency_max(&self) -> Option<Duration> {
        if self.latency_count == 0 {
            None
        } else {
            Some(self.latency_max)
        }
    }

    /// 每秒完成的组合数（按墙钟时间）
    pub fn throughput(&self) -> f64 {
        let secs = self.wall_time.as_secs_f64();
        if secs > 0.0 {
            (self.success + self.cached + self.failed + self.cancelled) as f64 / secs
        } else {
            0.0
        }
    }
}

// ========== 日志辅助函数 ==========

fn print_final_stats(stats: &PipelineStats, config: &Config) {
    info!("\n{}", "=".repeat(60));
    info!("📊 全部处理完成统计");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("✅ 成功: {}/{}", stats.success, stats.total);
    info!("💾 缓存命中: {}", stats.cached);
    info!("❌ 失败: {}", stats.failed);
    if stats.cancelled > 0 {
        info!("⚠️ 取消: {}", stats.cancelled);
    }
    if let (Some(min), Some(mean), Some(max)) = (
        stats.latency_min(),
        stats.latency_mean(),
        stats.latency_max(),
    ) {
        info!(
            "⏱️ 单组耗时: 最短 {:.1}s / 平均 {:.1}s / 最长 {:.1}s",
            min.as_secs_f64(),
            mean.as_secs_f64(),
            max.as_secs_f64()
        );
    }
    info!(
        "🚄 吞吐: {:.2} 组/秒（总耗时 {:.1}s）",
        stats.throughput(),
        stats.wall_time.as_secs_f64()
    );
    info!("{}", "=".repeat(60));
    info!("\n日志已保存至: {}", config.output_log_file);
}
