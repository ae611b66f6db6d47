//! # DICOM 模块
//!
//! 实例存储扫描、元数据与像素解析、报告编码以及 C-STORE 归档提交。

pub mod dimse;
#[cfg(any(test, feature = "test-fixtures"))]
pub mod fixtures;
pub mod parser;
pub mod report_writer;
pub mod scanner;
pub mod store_scu;
pub mod validator;

pub use parser::{DicomParser, ParsedDicomObject, ParsedInstance};
pub use report_writer::{encode_report, EncodedReport};
pub use scanner::{Completeness, InstanceStoreScanner, StudyDirectory, StudyFingerprint};
pub use store_scu::{ArchiveClient, DicomStoreClient, StoreScuConfig};
pub use validator::{DicomValidator, ValidationResult};
