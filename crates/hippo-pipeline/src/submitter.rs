//! 报告提交
//!
//! 把编码好的报告发送到归档，每次尝试都受超时约束，失败时按重试策略重试。
//! 配置了输出目录时，发送前先保存一份副本以便人工补发。

use crate::retry::RetryPolicy;
use hippo_core::{HippoError, Result};
use hippo_dicom::{ArchiveClient, EncodedReport};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// 提交成功的回执
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionReceipt {
    pub endpoint: String,
    pub attempts: u32,
    pub saved_copy: Option<PathBuf>,
}

/// 报告提交器
#[derive(Clone)]
pub struct ReportSubmitter {
    client: Arc<dyn ArchiveClient>,
    retry: RetryPolicy,
    output_dir: Option<PathBuf>,
}

impl std::fmt::Debug for ReportSubmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportSubmitter")
            .field("endpoint", &self.client.endpoint())
            .field("retry", &self.retry)
            .field("output_dir", &self.output_dir)
            .finish()
    }
}

impl ReportSubmitter {
    pub fn new(client: Arc<dyn ArchiveClient>, retry: RetryPolicy) -> Self {
        Self {
            client,
            retry,
            output_dir: None,
        }
    }

    pub fn with_output_dir(mut self, output_dir: Option<PathBuf>) -> Self {
        self.output_dir = output_dir;
        self
    }

    pub fn endpoint(&self) -> String {
        self.client.endpoint()
    }

    /// 保存副本并发送报告
    pub async fn submit(&self, report: EncodedReport) -> Result<SubmissionReceipt> {
        let saved_copy = self.save_copy(&report)?;
        let endpoint = self.client.endpoint();
        let study_uid = report.study_uid.clone();
        let report = Arc::new(report);

        let outcome = self
            .retry
            .run(&format!("提交报告到 {}", endpoint), |attempt| {
                let client = Arc::clone(&self.client);
                let report = Arc::clone(&report);
                async move {
                    tracing::debug!("第 {} 次提交 {}", attempt, report.sop_instance_uid);
                    client.store(report).await.map(|_| attempt)
                }
            })
            .await;

        match outcome {
            Ok(attempts) => {
                info!(
                    study_uid = %study_uid,
                    report_uid = %report.sop_instance_uid,
                    endpoint = %endpoint,
                    attempts,
                    "报告提交成功"
                );
                Ok(SubmissionReceipt {
                    endpoint,
                    attempts,
                    saved_copy,
                })
            }
            Err(exhausted) => {
                error!(
                    study_uid = %study_uid,
                    endpoint = %endpoint,
                    attempts = exhausted.attempts,
                    error = %exhausted.last_error,
                    saved_copy = ?saved_copy,
                    "报告提交失败，重试次数已耗尽"
                );
                Err(HippoError::Submission {
                    endpoint,
                    attempts: exhausted.attempts,
                    last_error: exhausted.last_error.to_string(),
                })
            }
        }
    }

    fn save_copy(&self, report: &EncodedReport) -> Result<Option<PathBuf>> {
        let Some(dir) = &self.output_dir else {
            return Ok(None);
        };
        std::fs::create_dir_all(dir)?;
        let path = dir.join(report.file_name());
        report.save(&path)?;
        info!("报告副本已保存: {:?}", path);
        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::BackoffConfig;
    use async_trait::async_trait;
    use hippo_dicom::fixtures::SyntheticSlice;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct CountingArchive {
        fail_first: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ArchiveClient for CountingArchive {
        fn endpoint(&self) -> String {
            "TEST@archive:104".to_string()
        }

        async fn store(&self, _report: Arc<EncodedReport>) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(HippoError::Network("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    fn encoded() -> EncodedReport {
        let slice = SyntheticSlice::new("1.2.3", "1.2.3.1", 0, 0.0);
        EncodedReport {
            sop_class_uid: "1.2.840.10008.5.1.4.1.1.7".into(),
            sop_instance_uid: "2.25.42".into(),
            study_uid: slice.study_uid.clone(),
            object: slice.to_object().unwrap(),
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: BackoffConfig::Fixed {
                delay: Duration::ZERO,
            },
            attempt_timeout: Some(Duration::from_secs(5)),
        }
    }

    #[tokio::test]
    async fn test_submit_retries_then_succeeds() {
        let archive = Arc::new(CountingArchive {
            fail_first: 2,
            calls: AtomicU32::new(0),
        });
        let dir = tempfile::tempdir().unwrap();
        let submitter = ReportSubmitter::new(archive.clone(), policy(3))
            .with_output_dir(Some(dir.path().join("reports")));

        let receipt = submitter.submit(encoded()).await.unwrap();
        assert_eq!(receipt.attempts, 3);
        let copy = receipt.saved_copy.unwrap();
        assert!(copy.ends_with("2.25.42.dcm"));
        assert!(copy.exists());
    }

    #[tokio::test]
    async fn test_submit_exhausted() {
        let archive = Arc::new(CountingArchive {
            fail_first: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let submitter = ReportSubmitter::new(archive.clone(), policy(2));

        match submitter.submit(encoded()).await.unwrap_err() {
            HippoError::Submission {
                endpoint, attempts, ..
            } => {
                assert_eq!(endpoint, "TEST@archive:104");
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(archive.calls.load(Ordering::SeqCst), 2);
    }
}
