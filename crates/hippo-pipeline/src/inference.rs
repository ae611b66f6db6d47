//! 分割推理适配
//!
//! 模型只需要实现 `SegmentationModel`。适配器负责在阻塞线程中运行模型、
//! 限制时间，并检查输出掩码是否满足约定：形状与输入一致，标签不超过上限。
//! 任何失败都重试一次，第二次失败即为推理契约错误。

use crate::retry::{BackoffConfig, RetryPolicy};
use hippo_core::{HippoError, Result, SegmentationMask, Volume};
use ndarray::{Array3, ArrayView3};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// 分割模型接口
///
/// 输入为 (slices, rows, columns) 的体数据，输出同形状的整数标签掩码。
/// 实现应当是纯函数，不依赖调用之间的状态。
pub trait SegmentationModel: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    fn segment(&self, volume: ArrayView3<'_, f32>) -> Result<Array3<u8>>;
}

/// 模型选择
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelConfig {
    /// 二维 U-Net ONNX 模型，逐切片推理
    Onnx {
        path: PathBuf,
        /// 切片补零后的最小边长
        #[serde(default = "default_patch_size")]
        patch_size: usize,
    },
}

const fn default_patch_size() -> usize {
    64
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig::Onnx {
            path: PathBuf::from("models/hippocampus_unet.onnx"),
            patch_size: default_patch_size(),
        }
    }
}

/// 推理参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub model: ModelConfig,

    /// 单次推理的超时
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// 掩码允许的最大标签值
    pub max_label: u8,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            timeout: Duration::from_secs(300),
            max_label: 2,
        }
    }
}

/// 推理适配器
#[derive(Clone)]
pub struct InferenceAdapter {
    model: Arc<dyn SegmentationModel>,
    max_label: u8,
    retry: RetryPolicy,
}

impl std::fmt::Debug for InferenceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceAdapter")
            .field("model", &self.model.name())
            .field("max_label", &self.max_label)
            .field("retry", &self.retry)
            .finish()
    }
}

impl InferenceAdapter {
    pub fn new(model: Arc<dyn SegmentationModel>, timeout: Duration, max_label: u8) -> Self {
        // 失败后立即重试一次
        let retry = RetryPolicy {
            max_attempts: 2,
            backoff: BackoffConfig::Fixed {
                delay: Duration::ZERO,
            },
            attempt_timeout: Some(timeout),
        };
        Self {
            model,
            max_label,
            retry,
        }
    }

    pub fn from_config(model: Arc<dyn SegmentationModel>, config: &InferenceConfig) -> Self {
        Self::new(model, config.timeout, config.max_label)
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn model_version(&self) -> &str {
        self.model.version()
    }

    /// 运行分割并检查输出
    ///
    /// 超时的推理线程无法被中断，会在后台运行结束后被丢弃。
    pub async fn segment(&self, volume: Arc<Volume>) -> Result<SegmentationMask> {
        let expected = volume.dim();
        let max_label = self.max_label;
        let model_name = self.model.name().to_string();

        let outcome = self
            .retry
            .run("分割推理", |attempt| {
                let model = Arc::clone(&self.model);
                let volume = Arc::clone(&volume);
                async move {
                    debug!("推理第 {} 次尝试，形状 {:?}", attempt, expected);
                    let labels = tokio::task::spawn_blocking(move || model.segment(volume.view()))
                        .await
                        .map_err(|e| {
                            HippoError::InferenceContract(format!("推理线程异常终止: {}", e))
                        })??;
                    Self::check_output(labels, expected, max_label)
                }
            })
            .await;

        match outcome {
            Ok(mask) => {
                info!(
                    "模型 {} 推理完成: 前景体素 {}",
                    model_name,
                    mask.foreground_count()
                );
                Ok(mask)
            }
            Err(exhausted) => Err(HippoError::InferenceContract(format!(
                "模型 {} 在 {} 次尝试后失败: {}",
                model_name, exhausted.attempts, exhausted.last_error
            ))),
        }
    }

    fn check_output(
        labels: Array3<u8>,
        expected: (usize, usize, usize),
        max_label: u8,
    ) -> Result<SegmentationMask> {
        let mask = SegmentationMask::new(labels);
        if mask.dim() != expected {
            return Err(HippoError::InferenceContract(format!(
                "掩码形状 {:?} 与体数据形状 {:?} 不一致",
                mask.dim(),
                expected
            )));
        }
        let observed = mask.max_label();
        if observed > max_label {
            return Err(HippoError::InferenceContract(format!(
                "掩码标签 {} 超过上限 {}",
                observed, max_label
            )));
        }
        Ok(mask)
    }
}
