//! 错误定义模块

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// 流水线阶段，用于标注失败发生的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineStage {
    Scan,
    Selection,
    Assembly,
    Inference,
    Quantification,
    Report,
    Submission,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Scan => "scan",
            PipelineStage::Selection => "selection",
            PipelineStage::Assembly => "assembly",
            PipelineStage::Inference => "inference",
            PipelineStage::Quantification => "quantification",
            PipelineStage::Report => "report",
            PipelineStage::Submission => "submission",
        };
        f.write_str(name)
    }
}

/// 流水线统一错误类型
#[derive(Error, Debug)]
pub enum HippoError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("检查尚未接收完成: {0}")]
    IncompleteStudy(String),

    #[error("DICOM解析错误: {0}")]
    DicomParse(String),

    #[error("序列选择失败: {reason}; 候选序列: [{}]", .candidates.join("; "))]
    Selection {
        reason: String,
        candidates: Vec<String>,
    },

    #[error("几何一致性错误: {reason} (实例: {})", .instance_uids.join(", "))]
    Geometry {
        reason: String,
        instance_uids: Vec<String>,
    },

    #[error("推理契约错误: {0}")]
    InferenceContract(String),

    #[error("报告生成错误: {0}")]
    Report(String),

    #[error("报告提交失败: 目标 {endpoint}, 共尝试 {attempts} 次, 最后错误: {last_error}")]
    Submission {
        endpoint: String,
        attempts: u32,
        last_error: String,
    },

    #[error("网络错误: {0}")]
    Network(String),

    #[error("操作超时: {operation} ({timeout_ms} ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("系统内部错误: {0}")]
    Internal(String),
}

impl HippoError {
    /// 构造几何错误
    pub fn geometry(reason: impl Into<String>, instance_uids: Vec<String>) -> Self {
        HippoError::Geometry {
            reason: reason.into(),
            instance_uids,
        }
    }

    /// 是否为瞬时错误（下一个扫描周期重试）
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HippoError::IncompleteStudy(_) | HippoError::Timeout { .. } | HippoError::Network(_)
        )
    }

    /// 错误默认归属的流水线阶段
    pub fn stage(&self) -> Option<PipelineStage> {
        match self {
            HippoError::IncompleteStudy(_) | HippoError::DicomParse(_) => Some(PipelineStage::Scan),
            HippoError::Selection { .. } => Some(PipelineStage::Selection),
            HippoError::Geometry { .. } => Some(PipelineStage::Assembly),
            HippoError::InferenceContract(_) => Some(PipelineStage::Inference),
            HippoError::Report(_) => Some(PipelineStage::Report),
            HippoError::Submission { .. } | HippoError::Network(_) => {
                Some(PipelineStage::Submission)
            }
            _ => None,
        }
    }
}

/// 流水线统一结果类型
pub type Result<T> = std::result::Result<T, HippoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_error_lists_instances() {
        let err = HippoError::geometry("重复的切片位置", vec!["1.2.3".into(), "1.2.4".into()]);
        let message = err.to_string();
        assert!(message.contains("1.2.3, 1.2.4"));
        assert_eq!(err.stage(), Some(PipelineStage::Assembly));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transient_errors() {
        assert!(HippoError::IncompleteStudy("s".into()).is_transient());
        assert!(HippoError::Timeout {
            operation: "load".into(),
            timeout_ms: 10
        }
        .is_transient());
        assert!(!HippoError::InferenceContract("shape".into()).is_transient());
    }
}
