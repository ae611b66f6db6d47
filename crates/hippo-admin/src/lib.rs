//! # 运维模块
//!
//! 配置加载与验证、日志初始化，以及由配置装配完整流水线

pub mod config;
pub mod logging;

pub use config::{
    ArchiveConfig, ConfigManager, ConfigValidator, LogFormat, LoggingConfig, PipelineConfig,
};
pub use logging::init_logging;

use anyhow::{Context, Result};
use hippo_dicom::DicomStoreClient;
use hippo_pipeline::{
    InferenceAdapter, ReportBuilder, ReportSubmitter, SegmentationModel, SeriesSelector,
    StudyPipeline, StudyWatcher, VolumeAssembler, VolumeQuantifier,
};
use std::sync::Arc;
use tracing::info;

/// 由配置和已加载的模型装配监视器
pub fn build_watcher(
    config: &PipelineConfig,
    model: Arc<dyn SegmentationModel>,
) -> Result<StudyWatcher> {
    let selector = SeriesSelector::new(config.selection.clone())
        .context("Failed to build series selector")?;
    let assembler = VolumeAssembler::new(config.assembly.clone());
    let quantifier = VolumeQuantifier::new(config.labels.clone())
        .context("Failed to build volume quantifier")?;
    let reports = ReportBuilder::new(config.report.clone(), model.name(), model.version());
    let inference = InferenceAdapter::from_config(model, &config.inference);

    let client = Arc::new(DicomStoreClient::new(config.archive.store_scu()));
    let submitter = ReportSubmitter::new(client, config.archive.retry.clone())
        .with_output_dir(config.report.output_dir.clone());

    info!(
        "流水线已装配: 模型 {} {}，归档 {}",
        inference.model_name(),
        inference.model_version(),
        submitter.endpoint()
    );

    let pipeline = StudyPipeline::new(
        selector,
        assembler,
        inference,
        quantifier,
        reports,
        submitter,
    );
    Ok(StudyWatcher::new(config.watch.clone(), Arc::new(pipeline)))
}
