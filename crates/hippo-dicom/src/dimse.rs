//! DIMSE消息处理
//!
//! 构造 C-STORE 请求命令集并解析响应状态。

use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use hippo_core::{HippoError, Result};

/// 命令集中不携带数据集
const NO_DATA_SET: u16 = 0x0101;
/// 命令集后跟随数据集
const DATA_SET_PRESENT: u16 = 0x0000;

/// 命令类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    CStoreRq,
    CStoreRsp,
    CEchoRq,
    CEchoRsp,
    Unknown(u16),
}

impl CommandType {
    pub fn code(&self) -> u16 {
        match self {
            CommandType::CStoreRq => 0x0001,
            CommandType::CStoreRsp => 0x8001,
            CommandType::CEchoRq => 0x0030,
            CommandType::CEchoRsp => 0x8030,
            CommandType::Unknown(code) => *code,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            0x0001 => CommandType::CStoreRq,
            0x8001 => CommandType::CStoreRsp,
            0x0030 => CommandType::CEchoRq,
            0x8030 => CommandType::CEchoRsp,
            other => CommandType::Unknown(other),
        }
    }
}

/// C-STORE 响应状态分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    Success,
    /// 已存储，但接收方做了强制转换或丢弃了部分元素
    Warning(u16),
    Failure(u16),
}

impl StoreStatus {
    pub fn from_code(code: u16) -> Self {
        match code {
            0x0000 => StoreStatus::Success,
            0x0001 | 0xB000 | 0xB006 | 0xB007 => StoreStatus::Warning(code),
            other => StoreStatus::Failure(other),
        }
    }

    /// 实例是否已被接收方保存
    pub fn is_stored(&self) -> bool {
        !matches!(self, StoreStatus::Failure(_))
    }
}

/// DIMSE命令构造与解析
pub struct DimseCommand;

impl DimseCommand {
    /// 构造 C-STORE-RQ 命令集
    pub fn store_request(
        message_id: u16,
        sop_class_uid: &str,
        sop_instance_uid: &str,
    ) -> InMemDicomObject {
        InMemDicomObject::command_from_element_iter([
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                PrimitiveValue::from(sop_class_uid),
            ),
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                PrimitiveValue::from(CommandType::CStoreRq.code()),
            ),
            DataElement::new(tags::MESSAGE_ID, VR::US, PrimitiveValue::from(message_id)),
            // 中等优先级
            DataElement::new(tags::PRIORITY, VR::US, PrimitiveValue::from(0x0000_u16)),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                PrimitiveValue::from(DATA_SET_PRESENT),
            ),
            DataElement::new(
                tags::AFFECTED_SOP_INSTANCE_UID,
                VR::UI,
                PrimitiveValue::from(sop_instance_uid),
            ),
        ])
    }

    /// 从 C-STORE-RSP 命令集中读取状态
    pub fn store_status(command: &InMemDicomObject) -> Result<StoreStatus> {
        let command_field = Self::read_u16(command, tags::COMMAND_FIELD)?;
        if CommandType::from_code(command_field) != CommandType::CStoreRsp {
            return Err(HippoError::Network(format!(
                "期望 C-STORE-RSP，收到命令 0x{:04X}",
                command_field
            )));
        }

        if let Ok(data_set_type) = Self::read_u16(command, tags::COMMAND_DATA_SET_TYPE) {
            if data_set_type != NO_DATA_SET {
                tracing::debug!("C-STORE-RSP 声明携带数据集: 0x{:04X}", data_set_type);
            }
        }

        let status = Self::read_u16(command, tags::STATUS)?;
        Ok(StoreStatus::from_code(status))
    }

    fn read_u16(command: &InMemDicomObject, tag: dicom::core::Tag) -> Result<u16> {
        command
            .element(tag)
            .map_err(|e| HippoError::Network(format!("响应缺少 {:?}: {}", tag, e)))?
            .to_int::<u16>()
            .map_err(|e| HippoError::Network(format!("响应字段 {:?} 无效: {}", tag, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_request_fields() {
        let command = DimseCommand::store_request(7, "1.2.840.10008.5.1.4.1.1.7", "1.2.3.4");
        assert_eq!(
            command.element(tags::COMMAND_FIELD).unwrap().to_int::<u16>().unwrap(),
            0x0001
        );
        assert_eq!(
            command.element(tags::MESSAGE_ID).unwrap().to_int::<u16>().unwrap(),
            7
        );
        assert_eq!(
            command
                .element(tags::AFFECTED_SOP_INSTANCE_UID)
                .unwrap()
                .to_str()
                .unwrap()
                .trim_end_matches('\0'),
            "1.2.3.4"
        );
        // 命令组长度由 command_from_element_iter 自动计算
        assert!(command.element(tags::COMMAND_GROUP_LENGTH).is_ok());
    }

    #[test]
    fn test_store_status_from_response() {
        let response = InMemDicomObject::command_from_element_iter([
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                PrimitiveValue::from(CommandType::CStoreRsp.code()),
            ),
            DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, PrimitiveValue::from(NO_DATA_SET)),
            DataElement::new(tags::STATUS, VR::US, PrimitiveValue::from(0xA700_u16)),
        ]);
        let status = DimseCommand::store_status(&response).unwrap();
        assert_eq!(status, StoreStatus::Failure(0xA700));
        assert!(!status.is_stored());
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(StoreStatus::from_code(0), StoreStatus::Success);
        assert!(StoreStatus::from_code(0xB007).is_stored());
        assert!(!StoreStatus::from_code(0xC000).is_stored());
    }
}
