//! 配置管理
//!
//! 配置按以下顺序叠加：内置默认值、TOML 配置文件（可选）、`HIPPO__` 前缀的
//! 环境变量（如 `HIPPO__ARCHIVE__PORT=11112`）。加载后立即验证，
//! 验证失败时进程不应启动。

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use hippo_pipeline::{
    default_labels, AssemblyConfig, BackoffConfig, InferenceConfig, LabelDefinition, ModelConfig,
    ReportConfig, RetryPolicy, SelectionRule, WatchConfig,
};
use hippo_dicom::StoreScuConfig;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};

/// 流水线完整配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// 实例存储监视
    pub watch: WatchConfig,
    /// 序列选择规则
    pub selection: SelectionRule,
    /// 体数据重建容差
    pub assembly: AssemblyConfig,
    /// 分割模型
    pub inference: InferenceConfig,
    /// 报告内容
    pub report: ReportConfig,
    /// 归档目标
    pub archive: ArchiveConfig,
    /// 标签定义
    pub labels: Vec<LabelDefinition>,
    /// 日志
    pub logging: LoggingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            watch: WatchConfig::default(),
            selection: SelectionRule::default(),
            assembly: AssemblyConfig::default(),
            inference: InferenceConfig::default(),
            report: ReportConfig::default(),
            archive: ArchiveConfig::default(),
            labels: default_labels(),
            logging: LoggingConfig::default(),
        }
    }
}

/// 归档配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// 归档主机
    pub host: String,
    /// 归档端口
    pub port: u16,
    /// 归档的AE标题
    pub called_ae_title: String,
    /// 本端AE标题
    pub calling_ae_title: String,
    /// 最大PDU长度
    pub max_pdu_length: u32,
    /// 提交重试策略
    pub retry: RetryPolicy,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 104,
            called_ae_title: "ARCHIVE".to_string(),
            calling_ae_title: "HIPPOAI".to_string(),
            max_pdu_length: 16384,
            retry: RetryPolicy::default(),
        }
    }
}

impl ArchiveConfig {
    /// 转换为存储客户端配置
    pub fn store_scu(&self) -> StoreScuConfig {
        StoreScuConfig {
            host: self.host.clone(),
            port: self.port,
            called_ae_title: self.called_ae_title.clone(),
            calling_ae_title: self.calling_ae_title.clone(),
            max_pdu_length: self.max_pdu_length,
            timeout: self.retry.attempt_timeout,
        }
    }
}

/// 日志输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别，`RUST_LOG` 优先
    pub level: String,
    /// 日志格式
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

/// 配置管理器
#[derive(Debug)]
pub struct ConfigManager {
    /// 配置数据
    config: PipelineConfig,
    /// 配置文件路径
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// 加载并验证配置
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let config = Self::load_config(config_path)?;
        ConfigValidator::new().validate(&config)?;

        Ok(Self {
            config,
            config_path: config_path.map(Path::to_path_buf),
        })
    }

    /// 叠加配置文件和环境变量，不做验证
    pub fn load_config(config_path: Option<&Path>) -> Result<PipelineConfig> {
        let mut builder = Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix("HIPPO")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: PipelineConfig = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        match config_path {
            Some(path) => info!("配置已加载: {:?}", path),
            None => info!("未指定配置文件，使用默认配置和环境变量"),
        }
        Ok(config)
    }

    /// 获取配置
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// 取出配置
    pub fn into_config(self) -> PipelineConfig {
        self.config
    }

    /// 默认配置的 TOML 文本
    pub fn default_toml() -> Result<String> {
        toml::to_string_pretty(&PipelineConfig::default())
            .context("Failed to serialize default configuration")
    }

    /// 把默认配置写入文件作为模板
    pub fn write_default(path: &Path) -> Result<()> {
        let config_str = Self::default_toml()?;
        std::fs::write(path, config_str)
            .with_context(|| format!("Failed to write configuration file {:?}", path))?;

        info!("默认配置已写入: {:?}", path);
        Ok(())
    }
}

/// 配置验证器
#[derive(Debug)]
pub struct ConfigValidator {
    /// 验证规则
    validation_rules: Vec<ValidationRule>,
}

/// 验证规则
#[derive(Debug)]
struct ValidationRule {
    /// 字段路径
    field_path: &'static str,
    /// 验证函数
    validator: fn(&PipelineConfig) -> Result<()>,
}

impl ConfigValidator {
    /// 创建新的配置验证器
    pub fn new() -> Self {
        let validation_rules = vec![
            ValidationRule {
                field_path: "archive.port",
                validator: |config| {
                    anyhow::ensure!(config.archive.port != 0, "归档端口不能为 0");
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "archive.called_ae_title",
                validator: |config| check_ae_title(&config.archive.called_ae_title),
            },
            ValidationRule {
                field_path: "archive.calling_ae_title",
                validator: |config| check_ae_title(&config.archive.calling_ae_title),
            },
            ValidationRule {
                field_path: "archive.retry.max_attempts",
                validator: |config| {
                    anyhow::ensure!(config.archive.retry.max_attempts >= 1, "至少需要尝试一次");
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "archive.retry.attempt_timeout",
                validator: |config| {
                    check_non_zero(config.archive.retry.attempt_timeout.unwrap_or(Duration::MAX))
                },
            },
            ValidationRule {
                field_path: "archive.retry.backoff",
                validator: |config| match &config.archive.retry.backoff {
                    BackoffConfig::Exponential { multiplier, .. } => {
                        anyhow::ensure!(
                            multiplier.is_finite() && *multiplier >= 1.0,
                            "退避倍数必须是不小于 1.0 的有限数: {}",
                            multiplier
                        );
                        Ok(())
                    }
                    BackoffConfig::Fixed { .. } | BackoffConfig::Linear { .. } => Ok(()),
                },
            },
            ValidationRule {
                field_path: "report.page_size",
                validator: |config| {
                    let size = config.report.page_size;
                    anyhow::ensure!(
                        size >= 1 && size <= u32::from(u16::MAX),
                        "报告页面尺寸必须在 1 到 {} 之间: {}",
                        u16::MAX,
                        size
                    );
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "watch.quiet_period",
                validator: |config| check_non_zero(config.watch.quiet_period),
            },
            ValidationRule {
                field_path: "watch.poll_interval",
                validator: |config| check_non_zero(config.watch.poll_interval),
            },
            ValidationRule {
                field_path: "watch.load_timeout",
                validator: |config| check_non_zero(config.watch.load_timeout),
            },
            ValidationRule {
                field_path: "inference.timeout",
                validator: |config| check_non_zero(config.inference.timeout),
            },
            ValidationRule {
                field_path: "selection.description_regex",
                validator: |config| {
                    if let Some(pattern) = &config.selection.description_regex {
                        Regex::new(pattern)
                            .with_context(|| format!("无法编译正则表达式 {:?}", pattern))?;
                    }
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "labels",
                validator: |config| {
                    anyhow::ensure!(!config.labels.is_empty(), "至少需要一个标签");
                    let mut seen = HashSet::new();
                    for label in &config.labels {
                        anyhow::ensure!(label.value != 0, "标签 {} 不能使用背景值 0", label.name);
                        anyhow::ensure!(
                            label.value <= config.inference.max_label,
                            "标签 {} 的值 {} 超过 inference.max_label {}",
                            label.name,
                            label.value,
                            config.inference.max_label
                        );
                        anyhow::ensure!(seen.insert(label.value), "标签值 {} 重复", label.value);
                    }
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "inference.model",
                validator: |config| match &config.inference.model {
                    ModelConfig::Onnx { path, patch_size } => {
                        anyhow::ensure!(*patch_size > 0, "patch_size 必须大于 0");
                        anyhow::ensure!(path.is_file(), "模型文件不存在: {:?}", path);
                        Ok(())
                    }
                },
            },
        ];

        Self { validation_rules }
    }

    /// 验证配置，返回第一条失败的规则
    pub fn validate(&self, config: &PipelineConfig) -> Result<()> {
        for rule in &self.validation_rules {
            if let Err(e) = (rule.validator)(config) {
                error!("配置项 {} 验证失败: {}", rule.field_path, e);
                return Err(e.context(format!("Invalid configuration: {}", rule.field_path)));
            }
        }

        info!("配置验证通过");
        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn check_ae_title(title: &str) -> Result<()> {
    let trimmed = title.trim();
    anyhow::ensure!(
        !trimmed.is_empty() && trimmed.len() <= 16,
        "AE标题长度必须在 1 到 16 之间: {:?}",
        title
    );
    Ok(())
}

fn check_non_zero(duration: Duration) -> Result<()> {
    anyhow::ensure!(!duration.is_zero(), "时长不能为 0");
    Ok(())
}
