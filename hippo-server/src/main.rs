//! 海马体积分析服务主程序

use anyhow::Result;
use clap::Parser;
use hippo_admin::{build_watcher, init_logging, ConfigManager, ConfigValidator};
use hippo_pipeline::{InferenceConfig, SegmentationModel};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

/// 海马体积分析服务命令行参数
#[derive(Parser, Debug)]
#[command(name = "hippo-server")]
#[command(about = "监视实例存储，对海马裁剪序列做体积分析并把报告发送到归档")]
struct Args {
    /// 配置文件路径 (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 实例存储根目录，覆盖配置文件
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// 日志级别，覆盖配置文件
    #[arg(short, long)]
    log_level: Option<String>,

    /// 只扫描一轮后退出
    #[arg(long)]
    once: bool,

    /// 打印默认配置后退出
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_default_config {
        print!("{}", ConfigManager::default_toml()?);
        return Ok(());
    }

    let mut config = ConfigManager::load_config(args.config.as_deref())?;
    if let Some(root) = args.root {
        config.watch.root = root;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    // 初始化日志
    init_logging(&config.logging)?;
    info!("启动海马体积分析服务...");

    ConfigValidator::new().validate(&config)?;

    info!("服务配置:");
    info!("  实例存储: {:?}", config.watch.root);
    info!("  静默期: {:?}", config.watch.quiet_period);
    info!(
        "  归档: {}@{}:{}",
        config.archive.called_ae_title, config.archive.host, config.archive.port
    );

    let model = load_model(&config.inference)?;
    let watcher = build_watcher(&config, model)?;

    if args.once {
        let mut watcher = watcher;
        let outcomes = watcher.run_once().await?;
        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        info!("单轮扫描完成: {} 个检查，失败 {} 个", outcomes.len(), failed);
        if failed > 0 {
            anyhow::bail!("{} 个检查处理失败", failed);
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut watcher = watcher.with_shutdown(shutdown_rx);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("收到中断信号，处理完当前检查后退出");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => error!("无法监听中断信号: {}", e),
        }
    });

    if let Err(e) = watcher.run().await {
        error!("服务异常退出: {}", e);
        return Err(e.into());
    }

    Ok(())
}

#[cfg(feature = "onnx")]
fn load_model(config: &InferenceConfig) -> Result<Arc<dyn SegmentationModel>> {
    use anyhow::Context;
    use hippo_pipeline::{ModelConfig, OnnxUNetModel};

    match &config.model {
        ModelConfig::Onnx { path, patch_size } => {
            let model = OnnxUNetModel::load(path, *patch_size)
                .with_context(|| format!("Failed to load model {:?}", path))?;
            Ok(Arc::new(model))
        }
    }
}

#[cfg(not(feature = "onnx"))]
fn load_model(config: &InferenceConfig) -> Result<Arc<dyn SegmentationModel>> {
    anyhow::bail!(
        "模型 {:?} 需要 ONNX 推理支持，请使用 `--features onnx` 构建",
        config.model
    )
}
