//! 单个组合处理器 - 编排层
//!
//! 负责一个"用户图 + 发型图"组合的处理：带编号的日志前缀、
//! 计时，并把结果原样上交给批量处理器汇总。
//! 流程细节全部委托给 `StageRunner`。

use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::utils::logging::truncate_text;
use crate::workflow::{ItemOutcome, PairInput, StageRunner};

/// 处理单个组合并计时
///
/// # 参数
/// - `runner`: 流程执行器
/// - `pair`: 待处理组合
/// - `pair_index`: 组合编号（用于日志，从 1 开始）
pub async fn process_pair_indexed(
    runner: &StageRunner,
    pair: &PairInput,
    pair_index: usize,
) -> (ItemOutcome, Duration) {
    info!("[组合 {}] 开始处理: {}", pair_index, pair.label());
    let started = Instant::now();

    let outcome = runner.process_pair(pair).await;
    let elapsed = started.elapsed();

    match &outcome {
        ItemOutcome::Success { outputs } => {
            info!(
                "[组合 {}] ✓ 处理成功，{} 个结果文件，耗时 {:.1}s",
                pair_index,
                outputs.len(),
                elapsed.as_secs_f64()
            );
        }
        ItemOutcome::Cached { .. } => {
            info!("[组合 {}] ✓ 命中缓存，跳过远端处理", pair_index);
        }
        ItemOutcome::Failed { reason } => {
            // 失败原因可能带着整包远端响应，日志里截断
            error!("[组合 {}] ❌ 处理失败: {}", pair_index, truncate_text(reason, 200));
        }
        ItemOutcome::Cancelled => {
            warn!("[组合 {}] ⚠️ 处理被取消", pair_index);
        }
    }

    (outcome, elapsed)
}
