//! 流水线引擎
//!
//! 对一个已接收完成的检查依次执行：序列选择、体数据重建、分割推理、
//! 体积计算、报告构建与编码、报告提交。任何一步失败只终止当前检查。

use crate::assembler::VolumeAssembler;
use crate::inference::InferenceAdapter;
use crate::quantifier::VolumeQuantifier;
use crate::report::ReportBuilder;
use crate::selector::SeriesSelector;
use crate::submitter::{ReportSubmitter, SubmissionReceipt};
use hippo_core::{HippoError, PipelineStage, Study, VolumeMeasurement};
use hippo_dicom::encode_report;
use std::sync::Arc;
use tracing::{error, info, warn};

/// 单个检查的处理结果
#[derive(Debug)]
pub enum StudyOutcome {
    Reported {
        study_uid: String,
        series_uid: String,
        report_uid: String,
        measurement: VolumeMeasurement,
        receipt: SubmissionReceipt,
    },
    Failed {
        study_uid: String,
        stage: PipelineStage,
        error: HippoError,
    },
}

impl StudyOutcome {
    pub fn failed(study_uid: &str, stage: PipelineStage, error: HippoError) -> Self {
        StudyOutcome::Failed {
            study_uid: study_uid.to_string(),
            stage,
            error,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StudyOutcome::Reported { .. })
    }

    pub fn study_uid(&self) -> &str {
        match self {
            StudyOutcome::Reported { study_uid, .. } | StudyOutcome::Failed { study_uid, .. } => {
                study_uid
            }
        }
    }

    /// 输出一条结构化的结果日志
    pub fn log(&self) {
        match self {
            StudyOutcome::Reported {
                study_uid,
                series_uid,
                report_uid,
                measurement,
                receipt,
            } => info!(
                study_uid = %study_uid,
                series_uid = %series_uid,
                report_uid = %report_uid,
                total_mm3 = measurement.total.volume_mm3,
                endpoint = %receipt.endpoint,
                attempts = receipt.attempts,
                "检查处理完成: {}",
                measurement.summary()
            ),
            StudyOutcome::Failed {
                study_uid,
                stage,
                error,
            } if error.is_transient() => warn!(
                study_uid = %study_uid,
                stage = %stage,
                error = %error,
                "检查暂缓处理"
            ),
            StudyOutcome::Failed {
                study_uid,
                stage,
                error,
            } => error!(
                study_uid = %study_uid,
                stage = %stage,
                error = %error,
                "检查处理失败"
            ),
        }
    }
}

/// 检查到报告的流水线
#[derive(Debug)]
pub struct StudyPipeline {
    selector: SeriesSelector,
    assembler: VolumeAssembler,
    inference: InferenceAdapter,
    quantifier: VolumeQuantifier,
    reports: ReportBuilder,
    submitter: ReportSubmitter,
}

impl StudyPipeline {
    pub fn new(
        selector: SeriesSelector,
        assembler: VolumeAssembler,
        inference: InferenceAdapter,
        quantifier: VolumeQuantifier,
        reports: ReportBuilder,
        submitter: ReportSubmitter,
    ) -> Self {
        Self {
            selector,
            assembler,
            inference,
            quantifier,
            reports,
            submitter,
        }
    }

    /// 处理一个检查，失败被转换为带阶段信息的结果而不是向上传播
    pub async fn process_study(&self, study: &Study) -> StudyOutcome {
        let study_uid = study.study_uid();
        info!(
            "开始处理检查 {}: {} 个序列, {} 个实例",
            study_uid,
            study.series.len(),
            study.instance_count()
        );

        match self.run(study).await {
            Ok(outcome) => outcome,
            Err((stage, error)) => StudyOutcome::failed(study_uid, stage, error),
        }
    }

    async fn run(
        &self,
        study: &Study,
    ) -> std::result::Result<StudyOutcome, (PipelineStage, HippoError)> {
        let at = |stage: PipelineStage| move |error: HippoError| (stage, error);

        let series = self
            .selector
            .select(study)
            .map_err(at(PipelineStage::Selection))?;

        let volume = Arc::new(
            self.assembler
                .assemble(series)
                .map_err(at(PipelineStage::Assembly))?,
        );

        let mask = self
            .inference
            .segment(Arc::clone(&volume))
            .await
            .map_err(at(PipelineStage::Inference))?;

        let measurement = self.quantifier.measure(&mask, &volume.spacing);

        let report = self
            .reports
            .build(study, series, &volume, &mask, measurement.clone())
            .map_err(at(PipelineStage::Report))?;
        // 体数据和掩码到此不再需要
        drop(mask);
        drop(volume);

        let encoded = encode_report(&report).map_err(at(PipelineStage::Report))?;
        let receipt = self
            .submitter
            .submit(encoded)
            .await
            .map_err(at(PipelineStage::Submission))?;

        Ok(StudyOutcome::Reported {
            study_uid: study.study_uid().to_string(),
            series_uid: series.info.series_uid.clone(),
            report_uid: report.sop_instance_uid,
            measurement,
            receipt,
        })
    }
}
