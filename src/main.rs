use anyhow::Result;
use hairstyle_pipeline::orchestrator::App;
use hairstyle_pipeline::utils::logging;
use hairstyle_pipeline::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // 加载配置
    let config = Config::from_env();

    // 初始化日志
    logging::init_logging(config.verbose_logging);

    // 初始化并运行应用
    App::initialize(config).await?.run().await?;

    Ok(())
}
