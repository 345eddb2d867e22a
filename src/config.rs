use std::time::Duration;

/// 程序配置
#[derive(Clone, Debug)]
pub struct Config {
    /// 同时处理的组合数量
    pub max_workers: usize,
    /// 输入图片根目录（其下应有 user/ 与 hairstyle/ 两个子目录）
    pub input_dir: String,
    /// 输出根目录（缓存索引与结果图都在这里）
    pub output_base_dir: String,
    /// 结果图保存目录
    pub results_dir: String,
    /// 是否显示详细日志
    pub verbose_logging: bool,
    /// 输出日志文件
    pub output_log_file: String,
    // --- Gemini 预处理配置 ---
    pub openrouter_api_key: String,
    pub openrouter_base_url: String,
    pub gemini_model_name: String,
    /// 无图片产出时的总尝试次数
    pub preprocess_attempts: usize,
    /// 预处理重试间隔（秒）
    pub preprocess_retry_delay_secs: u64,
    // --- RunningHub 工作流配置 ---
    pub runninghub_api_key: String,
    pub runninghub_webapp_id: String,
    pub runninghub_base_url: String,
    /// 队列已满时的最大重试次数
    pub submit_max_retries: usize,
    /// 队列已满重试间隔（秒）
    pub submit_retry_delay_secs: u64,
    /// 任务状态轮询间隔（秒）
    pub poll_interval_secs: u64,
    /// 任务等待总超时（秒）
    pub poll_timeout_secs: u64,
    // --- 会话配置 ---
    /// 会话过期时间（秒）
    pub session_ttl_secs: u64,
    /// 过期会话清理间隔（秒）
    pub reaper_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: 3,
            input_dir: "inputs".to_string(),
            output_base_dir: "outputs".to_string(),
            results_dir: "results".to_string(),
            verbose_logging: false,
            output_log_file: "output.txt".to_string(),
            openrouter_api_key: String::new(),
            openrouter_base_url: "https://openrouter.ai/api/v1".to_string(),
            gemini_model_name: "google/gemini-2.5-flash-image-preview".to_string(),
            preprocess_attempts: 2,
            preprocess_retry_delay_secs: 1,
            runninghub_api_key: String::new(),
            runninghub_webapp_id: String::new(),
            runninghub_base_url: "https://www.runninghub.cn".to_string(),
            submit_max_retries: 10,
            submit_retry_delay_secs: 20,
            poll_interval_secs: 10,
            poll_timeout_secs: 300,
            session_ttl_secs: 24 * 3600,
            reaper_interval_secs: 3600,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            max_workers: std::env::var("MAX_WORKERS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.max_workers),
            input_dir: std::env::var("INPUT_DIR").unwrap_or(default.input_dir),
            output_base_dir: std::env::var("OUTPUT_BASE_DIR").unwrap_or(default.output_base_dir),
            results_dir: std::env::var("RESULTS_DIR").unwrap_or(default.results_dir),
            verbose_logging: std::env::var("VERBOSE_LOGGING").ok().and_then(|v| v.parse().ok()).unwrap_or(default.verbose_logging),
            output_log_file: std::env::var("OUTPUT_LOG_FILE").unwrap_or(default.output_log_file),
            openrouter_api_key: std::env::var("OPENROUTER_API_KEY").unwrap_or(default.openrouter_api_key),
            openrouter_base_url: std::env::var("OPENROUTER_BASE_URL").unwrap_or(default.openrouter_base_url),
            gemini_model_name: std::env::var("GEMINI_MODEL_NAME").unwrap_or(default.gemini_model_name),
            preprocess_attempts: std::env::var("PREPROCESS_ATTEMPTS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.preprocess_attempts),
            preprocess_retry_delay_secs: std::env::var("PREPROCESS_RETRY_DELAY_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.preprocess_retry_delay_secs),
            runninghub_api_key: std::env::var("RUNNINGHUB_API_KEY").unwrap_or(default.runninghub_api_key),
            runninghub_webapp_id: std::env::var("RUNNINGHUB_WEBAPP_ID").unwrap_or(default.runninghub_webapp_id),
            runninghub_base_url: std::env::var("RUNNINGHUB_BASE_URL").unwrap_or(default.runninghub_base_url),
            submit_max_retries: std::env::var("SUBMIT_MAX_RETRIES").ok().and_then(|v| v.parse().ok()).unwrap_or(default.submit_max_retries),
            submit_retry_delay_secs: std::env::var("SUBMIT_RETRY_DELAY_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.submit_retry_delay_secs),
            poll_interval_secs: std::env::var("POLL_INTERVAL_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.poll_interval_secs),
            poll_timeout_secs: std::env::var("POLL_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.poll_timeout_secs),
            session_ttl_secs: std::env::var("SESSION_TTL_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.session_ttl_secs),
            reaper_interval_secs: std::env::var("REAPER_INTERVAL_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.reaper_interval_secs),
        }
    }

    /// 提取状态机使用的重试策略
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            preprocess_attempts: self.preprocess_attempts,
            preprocess_retry_delay: Duration::from_secs(self.preprocess_retry_delay_secs),
            submit_max_retries: self.submit_max_retries,
            submit_retry_delay: Duration::from_secs(self.submit_retry_delay_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            poll_timeout: Duration::from_secs(self.poll_timeout_secs),
        }
    }
}

/// 重试与轮询策略
///
/// 与 `Config` 分离，便于测试中直接构造毫秒级的参数。
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub preprocess_attempts: usize,
    pub preprocess_retry_delay: Duration,
    pub submit_max_retries: usize,
    pub submit_retry_delay: Duration,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Config::default().retry_policy()
    }
}
