//! 归档提交（C-STORE SCU）
//!
//! `ArchiveClient` 是流水线与归档之间的接缝；`DicomStoreClient` 通过
//! DICOM 网络协议把报告发送到归档节点。dicom-ul 的关联是同步的，
//! 因此每次发送都在阻塞线程池中完成。

use crate::dimse::{DimseCommand, StoreStatus};
use crate::report_writer::EncodedReport;
use async_trait::async_trait;
use dicom::dictionary_std::uids;
use dicom::object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries::{
    EXPLICIT_VR_LITTLE_ENDIAN, IMPLICIT_VR_LITTLE_ENDIAN,
};
use dicom_ul::pdu::{PDataValue, PDataValueType, Pdu};
use dicom_ul::ClientAssociationOptions;
use hippo_core::{HippoError, Result};
use std::io::Write;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 归档客户端
#[async_trait]
pub trait ArchiveClient: Send + Sync {
    /// 归档端点的描述，用于日志和错误信息
    fn endpoint(&self) -> String;

    /// 发送一份报告，返回前归档须已确认接收
    async fn store(&self, report: Arc<EncodedReport>) -> Result<()>;
}

/// C-STORE SCU 的连接参数
#[derive(Debug, Clone)]
pub struct StoreScuConfig {
    pub host: String,
    pub port: u16,
    pub called_ae_title: String,
    pub calling_ae_title: String,
    pub max_pdu_length: u32,
    /// 套接字的连接、读、写超时，None 表示不限制
    pub timeout: Option<Duration>,
}

/// 基于 dicom-ul 的归档客户端
#[derive(Debug)]
pub struct DicomStoreClient {
    config: StoreScuConfig,
    next_message_id: AtomicU16,
}

impl DicomStoreClient {
    pub fn new(config: StoreScuConfig) -> Self {
        Self {
            config,
            next_message_id: AtomicU16::new(1),
        }
    }

    fn address(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }
}

#[async_trait]
impl ArchiveClient for DicomStoreClient {
    fn endpoint(&self) -> String {
        format!("{}@{}", self.config.called_ae_title, self.address())
    }

    async fn store(&self, report: Arc<EncodedReport>) -> Result<()> {
        let config = self.config.clone();
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let endpoint = self.endpoint();

        let status = tokio::task::spawn_blocking(move || {
            send_report(&config, message_id, &report)
        })
        .await
        .map_err(|e| HippoError::Internal(format!("C-STORE 任务异常终止: {}", e)))??;

        match status {
            StoreStatus::Success => {
                info!("报告已归档到 {}", endpoint);
                Ok(())
            }
            StoreStatus::Warning(code) => {
                warn!("归档 {} 接收报告但返回警告状态 0x{:04X}", endpoint, code);
                Ok(())
            }
            StoreStatus::Failure(code) => Err(HippoError::Network(format!(
                "归档 {} 拒绝报告，状态 0x{:04X}",
                endpoint, code
            ))),
        }
    }
}

/// 建立关联、发送 C-STORE-RQ 并等待响应
fn send_report(
    config: &StoreScuConfig,
    message_id: u16,
    report: &EncodedReport,
) -> Result<StoreStatus> {
    let address = format!("{}:{}", config.host, config.port);
    let network = |what: &str, e: &dyn std::fmt::Display| {
        HippoError::Network(format!("{} {}: {}", what, address, e))
    };

    let mut options = ClientAssociationOptions::new()
        .calling_ae_title(config.calling_ae_title.as_str())
        .called_ae_title(config.called_ae_title.as_str())
        .max_pdu_length(config.max_pdu_length)
        .with_presentation_context(
            report.sop_class_uid.as_str(),
            vec![uids::EXPLICIT_VR_LITTLE_ENDIAN, uids::IMPLICIT_VR_LITTLE_ENDIAN],
        );
    if let Some(timeout) = config.timeout {
        options = options
            .connection_timeout(timeout)
            .read_timeout(timeout)
            .write_timeout(timeout);
    }

    let mut association = options
        .establish(address.as_str())
        .map_err(|e| network("建立关联失败", &e))?;

    let context = association
        .presentation_contexts()
        .first()
        .ok_or_else(|| {
            HippoError::Network(format!(
                "{} 未接受 {} 的表示上下文",
                address, report.sop_class_uid
            ))
        })?;
    let context_id = context.id;
    let transfer_syntax = if context.transfer_syntax.trim_end_matches('\0')
        == uids::EXPLICIT_VR_LITTLE_ENDIAN
    {
        EXPLICIT_VR_LITTLE_ENDIAN.erased()
    } else {
        IMPLICIT_VR_LITTLE_ENDIAN.erased()
    };
    debug!(
        "关联已建立: {} 上下文 {} 传输语法 {}",
        address,
        context_id,
        transfer_syntax.uid()
    );

    let command = DimseCommand::store_request(
        message_id,
        &report.sop_class_uid,
        &report.sop_instance_uid,
    );
    let mut command_data = Vec::new();
    command
        .write_dataset_with_ts(&mut command_data, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .map_err(|e| HippoError::Report(format!("编码命令集失败: {}", e)))?;

    let mut object_data = Vec::new();
    report
        .object
        .write_dataset_with_ts(&mut object_data, &transfer_syntax)
        .map_err(|e| HippoError::Report(format!("编码报告数据集失败: {}", e)))?;

    association
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: context_id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: command_data,
            }],
        })
        .map_err(|e| network("发送命令失败", &e))?;

    {
        let mut pdata = association.send_pdata(context_id);
        pdata
            .write_all(&object_data)
            .map_err(|e| network("发送数据集失败", &e))?;
    }

    let response = association
        .receive()
        .map_err(|e| network("接收响应失败", &e))?;

    let status = match response {
        Pdu::PData { data } => {
            let value = data
                .first()
                .ok_or_else(|| HippoError::Network(format!("{} 返回空响应", address)))?;
            let response_command = InMemDicomObject::read_dataset_with_ts(
                value.data.as_slice(),
                &IMPLICIT_VR_LITTLE_ENDIAN.erased(),
            )
            .map_err(|e| network("解析响应失败", &e))?;
            DimseCommand::store_status(&response_command)?
        }
        other => {
            return Err(HippoError::Network(format!(
                "{} 返回意外的PDU: {:?}",
                address, other
            )))
        }
    };

    if let Err(e) = association.release() {
        // 状态已经取得，释放失败不影响结果
        warn!("释放关联失败 {}: {}", address, e);
    }

    Ok(status)
}
