//! # 海马体积分析流水线
//!
//! 从实例存储中的检查到归档中的报告，包括：
//! - 序列选择：按规则挑出唯一的海马裁剪序列
//! - 体数据重建：按空间位置排序切片并推算体素间距
//! - 分割推理：在受时间限制的阻塞线程中运行分割模型
//! - 体积计算与报告：按标签统计体积，生成并编码二次捕获报告
//! - 报告提交：按重试策略发送到归档
//! - 监视：周期扫描实例存储并驱动以上步骤

pub mod assembler;
pub mod engine;
pub mod inference;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod quantifier;
pub mod report;
pub mod retry;
pub mod selector;
pub mod state_machine;
pub mod submitter;
pub mod watcher;

// 重新导出主要类型
pub use assembler::{AssemblyConfig, VolumeAssembler};
pub use engine::{StudyOutcome, StudyPipeline};
pub use inference::{InferenceAdapter, InferenceConfig, ModelConfig, SegmentationModel};
#[cfg(feature = "onnx")]
pub use onnx::OnnxUNetModel;
pub use quantifier::{default_labels, LabelDefinition, VolumeQuantifier, TOTAL_LABEL_NAME};
pub use report::{ReportBuilder, ReportConfig};
pub use retry::{BackoffConfig, RetryExhausted, RetryPolicy};
pub use selector::{SelectionRule, SeriesSelector};
pub use state_machine::{StudyEvent, StudyState, StudyStateMachine, StudyTracker};
pub use submitter::{ReportSubmitter, SubmissionReceipt};
pub use watcher::{StudyWatcher, WatchConfig};
