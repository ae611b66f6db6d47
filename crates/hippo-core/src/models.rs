//! 核心数据模型定义

use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 检查级别的头信息（从首个有效实例中提取）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StudyHeader {
    pub study_uid: String, // DICOM Study Instance UID
    pub patient_id: Option<String>,
    pub patient_name: Option<String>,
    pub patient_birth_date: Option<String>,
    pub patient_sex: Option<String>,
    pub study_id: Option<String>,
    pub study_date: Option<String>,
    pub study_time: Option<String>,
    pub study_description: Option<String>,
    pub accession_number: Option<String>,
    pub referring_physician_name: Option<String>,
}

/// 序列信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeriesInfo {
    pub series_uid: String, // DICOM Series Instance UID
    pub modality: String,
    pub description: Option<String>,
    pub series_number: Option<i32>,
}

/// 单个切片的空间几何信息
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SliceGeometry {
    /// Image Position (Patient)，毫米
    pub image_position: [f64; 3],
    /// Image Orientation (Patient)，行方向余弦 + 列方向余弦
    pub image_orientation: [f64; 6],
    /// Pixel Spacing：行间距、列间距，毫米
    pub pixel_spacing: [f64; 2],
    pub slice_thickness: Option<f64>,
}

impl SliceGeometry {
    /// 行方向余弦
    pub fn row_cosines(&self) -> [f64; 3] {
        [
            self.image_orientation[0],
            self.image_orientation[1],
            self.image_orientation[2],
        ]
    }

    /// 列方向余弦
    pub fn column_cosines(&self) -> [f64; 3] {
        [
            self.image_orientation[3],
            self.image_orientation[4],
            self.image_orientation[5],
        ]
    }

    /// 切片法向量（行 × 列）
    pub fn slice_normal(&self) -> [f64; 3] {
        let r = self.row_cosines();
        let c = self.column_cosines();
        [
            r[1] * c[2] - r[2] * c[1],
            r[2] * c[0] - r[0] * c[2],
            r[0] * c[1] - r[1] * c[0],
        ]
    }
}

/// 影像实例（单张二维切片）
#[derive(Debug, Clone)]
pub struct Instance {
    pub sop_instance_uid: String, // DICOM SOP Instance UID
    pub sop_class_uid: String,
    pub instance_number: Option<i32>,
    pub geometry: SliceGeometry,
    /// 像素数据，形状为 (rows, columns)
    pub pixels: Array2<f32>,
    pub source_path: Option<PathBuf>,
}

impl Instance {
    pub fn rows(&self) -> usize {
        self.pixels.nrows()
    }

    pub fn columns(&self) -> usize {
        self.pixels.ncols()
    }
}

/// 序列及其实例
#[derive(Debug, Clone)]
pub struct Series {
    pub info: SeriesInfo,
    pub instances: Vec<Instance>,
}

impl Series {
    pub fn new(info: SeriesInfo) -> Self {
        Self {
            info,
            instances: Vec::new(),
        }
    }

    /// 用于日志和诊断的简要描述
    pub fn describe(&self) -> String {
        format!(
            "{} [{}] \"{}\" ({} 个实例)",
            self.info.series_uid,
            self.info.modality,
            self.info.description.as_deref().unwrap_or(""),
            self.instances.len()
        )
    }
}

/// 检查：一个检查目录中解析出的全部序列
#[derive(Debug, Clone)]
pub struct Study {
    pub header: StudyHeader,
    pub series: Vec<Series>,
    pub source_dir: PathBuf,
    /// 所在目录中被跳过的文件数量（解析失败或重复实例）
    ///
    /// 按目录统计：无法解析的文件不能归属到某个检查，因此同一目录
    /// 加载出的各个检查带有相同的数值。
    pub skipped_files: usize,
}

impl Study {
    pub fn study_uid(&self) -> &str {
        &self.header.study_uid
    }

    pub fn instance_count(&self) -> usize {
        self.series.iter().map(|s| s.instances.len()).sum()
    }
}

/// 单个标签的体积测量值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelVolume {
    pub label: u8,
    pub name: String,
    pub voxel_count: u64,
    pub volume_mm3: f64,
}

/// 体积测量结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeMeasurement {
    pub labels: Vec<LabelVolume>,
    /// 所有非零标签的合计
    pub total: LabelVolume,
    pub voxel_volume_mm3: f64,
}

impl VolumeMeasurement {
    /// 按名称查找标签体积
    pub fn get(&self, name: &str) -> Option<&LabelVolume> {
        if self.total.name == name {
            return Some(&self.total);
        }
        self.labels.iter().find(|l| l.name == name)
    }

    /// 格式化为 "anterior=123.45 mm3, ..." 的文本
    pub fn summary(&self) -> String {
        self.labels
            .iter()
            .chain(std::iter::once(&self.total))
            .map(|l| format!("{}={:.2} mm3", l.name, l.volume_mm3))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// 算法身份信息，写入报告用于审计
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmInfo {
    pub name: String,
    pub version: String,
    pub model_name: String,
}

/// 报告所引用的源序列
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferencedSeries {
    pub series_uid: String,
    pub modality: String,
    pub description: Option<String>,
    pub sop_class_uid: String,
    pub instance_uids: Vec<String>,
}

/// 报告页面图像（RGB，交错排列）
#[derive(Debug, Clone, PartialEq)]
pub struct ReportImage {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
    /// 图像中是否烧录了文字
    pub burned_in_text: bool,
}

/// 体积测量报告
#[derive(Debug, Clone)]
pub struct Report {
    /// 新生成的 SOP Instance UID
    pub sop_instance_uid: String,
    /// 新生成的 Series Instance UID
    pub series_instance_uid: String,
    pub study: StudyHeader,
    pub referenced_series: ReferencedSeries,
    pub measurement: VolumeMeasurement,
    pub created_at: DateTime<Utc>,
    pub algorithm: AlgorithmInfo,
    pub summary_lines: Vec<String>,
    pub image: Option<ReportImage>,
}

impl Report {
    pub fn study_uid(&self) -> &str {
        &self.study.study_uid
    }
}
