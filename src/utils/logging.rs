/// 日志工具模块
///
/// 提供日志初始化、格式化和输出的辅助函数
use anyhow::Result;
use std::fs;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// 初始化日志订阅器
///
/// 默认级别 info，可通过 `RUST_LOG` 环境变量覆盖；
/// `verbose` 为 true 时默认级别提升为 debug。
pub fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 初始化运行日志文件
///
/// # 参数
/// - `log_file_path`: 日志文件路径
pub fn init_log_file(log_file_path: &str) -> Result<()> {
    let log_header = format!(
        "{}\n发型处理日志 - {}\n{}\n\n",
        "=".repeat(60),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        "=".repeat(60)
    );
    fs::write(log_file_path, log_header)?;
    Ok(())
}

/// 记录程序启动信息
///
/// # 参数
/// - `max_workers`: 最大并发数
pub fn log_startup(max_workers: usize) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 批量发型处理模式");
    info!("📊 最大并发数: {}", max_workers);
    info!("{}", "=".repeat(60));
}

/// 记录组合加载信息
///
/// # 参数
/// - `users`: 用户图片数量
/// - `styles`: 发型图片数量
/// - `pairs`: 组合总数
pub fn log_pairs_loaded(users: usize, styles: usize, pairs: usize) {
    info!("✓ 找到 {} 张用户图片、{} 张发型图片", users, styles);
    info!("📋 共 {} 个组合待处理\n", pairs);
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_short_text_unchanged() {
        assert_eq!(truncate_text("短文本", 10), "短文本");
    }

    #[test]
    fn test_truncate_long_text() {
        let text = "这是一段很长很长的文本内容";
        let truncated = truncate_text(text, 5);
        assert_eq!(truncated, "这是一段很...");
    }
}
