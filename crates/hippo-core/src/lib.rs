//! # HippoVolume Core
//!
//! 海马体积测量流水线的核心模块，提供数据模型、体数据结构、错误定义和通用工具。

pub mod error;
pub mod models;
pub mod utils;
pub mod volume;

pub use error::{HippoError, PipelineStage, Result};
pub use models::*;
pub use volume::{SegmentationMask, Volume, VoxelSpacing};
