//! 实例存储监视
//!
//! 周期性扫描实例存储，把静默期已过且尚未处理的检查逐个交给流水线。
//! 每个检查在独立任务中运行并被等待，任务崩溃只影响当前检查。

use crate::engine::{StudyOutcome, StudyPipeline};
use crate::state_machine::{StudyEvent, StudyTracker};
use hippo_core::{HippoError, PipelineStage, Result, Study};
use hippo_dicom::{InstanceStoreScanner, StudyDirectory};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// 监视参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// 实例存储根目录，每个检查一个子目录
    pub root: PathBuf,

    /// 目录在此时长内无变化即视为接收完成
    #[serde(with = "humantime_serde")]
    pub quiet_period: Duration,

    /// 扫描间隔
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// 解析一个检查目录的超时
    #[serde(with = "humantime_serde")]
    pub load_timeout: Duration,

    /// 报告提交成功后删除检查目录
    pub cleanup_on_success: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/data/incoming"),
            quiet_period: Duration::from_secs(30),
            poll_interval: Duration::from_secs(10),
            load_timeout: Duration::from_secs(120),
            cleanup_on_success: false,
        }
    }
}

/// 实例存储监视器
#[derive(Debug)]
pub struct StudyWatcher {
    config: WatchConfig,
    scanner: InstanceStoreScanner,
    pipeline: Arc<StudyPipeline>,
    tracker: StudyTracker,
    shutdown: Option<watch::Receiver<bool>>,
}

impl StudyWatcher {
    pub fn new(config: WatchConfig, pipeline: Arc<StudyPipeline>) -> Self {
        let scanner = InstanceStoreScanner::new(config.root.clone(), config.quiet_period);
        Self {
            config,
            scanner,
            pipeline,
            tracker: StudyTracker::new(),
            shutdown: None,
        }
    }

    /// 收到 true 后在当前检查处理完时停止
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// 持续扫描直到收到停止信号
    pub async fn run(&mut self) -> Result<()> {
        info!(
            "开始监视实例存储 {:?}，静默期 {:?}，扫描间隔 {:?}",
            self.config.root, self.config.quiet_period, self.config.poll_interval
        );

        loop {
            match self.run_once().await {
                Ok(outcomes) if !outcomes.is_empty() => {
                    let reported = outcomes.iter().filter(|o| o.is_success()).count();
                    info!(
                        "本轮处理 {} 个检查，成功 {} 个",
                        outcomes.len(),
                        reported
                    );
                }
                Ok(_) => {}
                Err(e) => error!("扫描实例存储失败: {}", e),
            }

            if self.shutdown_requested() {
                break;
            }

            let sleep = tokio::time::sleep(self.config.poll_interval);
            let sender_closed = match self.shutdown.as_mut() {
                Some(rx) => {
                    tokio::select! {
                        _ = sleep => false,
                        changed = rx.changed() => changed.is_err(),
                    }
                }
                None => {
                    sleep.await;
                    false
                }
            };
            if self.shutdown_requested() {
                break;
            }
            if sender_closed {
                // 发送端已关闭，之后只按间隔扫描
                self.shutdown = None;
            }
        }

        info!("实例存储监视已停止");
        Ok(())
    }

    /// 执行一轮扫描，返回本轮处理过的检查结果
    pub async fn run_once(&mut self) -> Result<Vec<StudyOutcome>> {
        let directories = self.scanner.survey(SystemTime::now())?;
        let present: HashSet<PathBuf> = directories.iter().map(|d| d.path.clone()).collect();
        self.tracker.retain_present(&present);

        let mut outcomes = Vec::new();
        for directory in &directories {
            if self.shutdown_requested() {
                info!("收到停止信号，跳过剩余检查");
                break;
            }
            if !self.tracker.observe(directory)? {
                debug!("检查目录未就绪或已处理: {:?}", directory.path);
                continue;
            }

            self.tracker
                .apply(&directory.path, StudyEvent::ProcessingStarted)?;
            let directory_outcomes = self.process_directory(directory).await;

            let event = if directory_outcomes.iter().all(StudyOutcome::is_success) {
                StudyEvent::ReportSubmitted
            } else if directory_outcomes.iter().any(|o| {
                matches!(o, StudyOutcome::Failed { error, .. } if error.is_transient())
            }) {
                StudyEvent::Deferred
            } else {
                StudyEvent::ProcessingFailed
            };
            self.tracker.apply(&directory.path, event)?;

            if event == StudyEvent::ReportSubmitted && self.config.cleanup_on_success {
                self.cleanup(&directory.path);
            }

            outcomes.extend(directory_outcomes);
        }

        Ok(outcomes)
    }

    /// 解析目录并逐个处理其中的检查
    async fn process_directory(&self, directory: &StudyDirectory) -> Vec<StudyOutcome> {
        let label = directory.name.as_str();
        let studies = match self.load(&directory.path).await {
            Ok(studies) => studies,
            Err(error) => {
                let outcome = StudyOutcome::failed(label, PipelineStage::Scan, error);
                outcome.log();
                return vec![outcome];
            }
        };

        let mut outcomes = Vec::with_capacity(studies.len());
        for study in studies {
            let study_uid = study.study_uid().to_string();
            let pipeline = Arc::clone(&self.pipeline);
            let handle = tokio::spawn(async move { pipeline.process_study(&study).await });

            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_error) => StudyOutcome::failed(
                    &study_uid,
                    PipelineStage::Scan,
                    HippoError::Internal(format!("处理任务异常终止: {}", join_error)),
                ),
            };
            outcome.log();
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn load(&self, path: &Path) -> Result<Vec<Study>> {
        let scanner = self.scanner.clone();
        let path = path.to_path_buf();
        let timeout = self.config.load_timeout;

        match tokio::time::timeout(
            timeout,
            tokio::task::spawn_blocking(move || scanner.load_study(&path)),
        )
        .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(HippoError::Internal(format!(
                "解析任务异常终止: {}",
                join_error
            ))),
            Err(_) => Err(HippoError::Timeout {
                operation: "加载检查".to_string(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    fn cleanup(&self, path: &Path) {
        match std::fs::remove_dir_all(path) {
            Ok(()) => info!("已删除处理完成的检查目录 {:?}", path),
            Err(e) => warn!("删除检查目录 {:?} 失败: {}", path, e),
        }
    }
}
