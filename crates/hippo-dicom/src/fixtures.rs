//! 合成测试数据
//!
//! 生成最小但完整的 MR 切片文件，用于解析、扫描和端到端测试。

use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::{tags, uids};
use dicom::object::{FileDicomObject, FileMetaTableBuilder, InMemDicomObject};
use hippo_core::{HippoError, Result};
use std::path::Path;

/// 一张合成的单帧灰度切片
#[derive(Debug, Clone)]
pub struct SyntheticSlice {
    pub study_uid: String,
    pub series_uid: String,
    pub sop_instance_uid: String,
    pub modality: String,
    pub series_description: Option<String>,
    pub series_number: i32,
    pub instance_number: i32,
    pub patient_id: String,
    pub position: [f64; 3],
    pub orientation: [f64; 6],
    pub pixel_spacing: [f64; 2],
    pub slice_thickness: f64,
    pub rows: u16,
    pub columns: u16,
    /// 行优先排列
    pub pixels: Vec<u16>,
    /// 为 false 时省略位置、方向和像素间距
    pub include_geometry: bool,
}

impl SyntheticSlice {
    /// 轴位 2x2 切片，z 为切片位置
    pub fn new(study_uid: &str, series_uid: &str, index: u32, z: f64) -> Self {
        Self {
            study_uid: study_uid.to_string(),
            series_uid: series_uid.to_string(),
            sop_instance_uid: format!("{}.{}", series_uid, index + 1),
            modality: "MR".to_string(),
            series_description: Some("HCropVolume".to_string()),
            series_number: 1,
            instance_number: index as i32 + 1,
            patient_id: "HIPPO001".to_string(),
            position: [0.0, 0.0, z],
            orientation: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
            pixel_spacing: [1.0, 1.0],
            slice_thickness: 1.0,
            rows: 2,
            columns: 2,
            pixels: vec![10, 20, 30, 40],
            include_geometry: true,
        }
    }

    pub fn with_size(mut self, rows: u16, columns: u16, value: u16) -> Self {
        self.rows = rows;
        self.columns = columns;
        self.pixels = vec![value; rows as usize * columns as usize];
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.series_description = Some(description.to_string());
        self
    }

    pub fn with_spacing(mut self, row: f64, column: f64) -> Self {
        self.pixel_spacing = [row, column];
        self
    }

    /// 构造带文件元信息的 DICOM 对象
    pub fn to_object(&self) -> Result<FileDicomObject<InMemDicomObject>> {
        let mut obj = InMemDicomObject::new_empty();

        let text = |tag, vr, value: &str| DataElement::new(tag, vr, PrimitiveValue::from(value));
        let decimals = |values: &[f64]| {
            PrimitiveValue::Strs(values.iter().map(|v| v.to_string()).collect())
        };

        obj.put(text(tags::SOP_CLASS_UID, VR::UI, uids::MR_IMAGE_STORAGE));
        obj.put(text(tags::SOP_INSTANCE_UID, VR::UI, &self.sop_instance_uid));
        obj.put(text(tags::STUDY_INSTANCE_UID, VR::UI, &self.study_uid));
        obj.put(text(tags::SERIES_INSTANCE_UID, VR::UI, &self.series_uid));
        obj.put(text(tags::MODALITY, VR::CS, &self.modality));
        obj.put(text(tags::PATIENT_ID, VR::LO, &self.patient_id));
        obj.put(text(tags::PATIENT_NAME, VR::PN, "Synthetic^Subject"));
        obj.put(text(tags::STUDY_DATE, VR::DA, "20240105"));
        obj.put(text(tags::STUDY_DESCRIPTION, VR::LO, "Hippocampus MRI"));
        if let Some(description) = &self.series_description {
            obj.put(text(tags::SERIES_DESCRIPTION, VR::LO, description));
        }
        obj.put(text(tags::SERIES_NUMBER, VR::IS, &self.series_number.to_string()));
        obj.put(text(tags::INSTANCE_NUMBER, VR::IS, &self.instance_number.to_string()));

        if self.include_geometry {
            obj.put(DataElement::new(
                tags::IMAGE_POSITION_PATIENT,
                VR::DS,
                decimals(&self.position),
            ));
            obj.put(DataElement::new(
                tags::IMAGE_ORIENTATION_PATIENT,
                VR::DS,
                decimals(&self.orientation),
            ));
            obj.put(DataElement::new(
                tags::PIXEL_SPACING,
                VR::DS,
                decimals(&self.pixel_spacing),
            ));
        }
        obj.put(DataElement::new(
            tags::SLICE_THICKNESS,
            VR::DS,
            decimals(&[self.slice_thickness]),
        ));

        obj.put(DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(self.rows)));
        obj.put(DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(self.columns)));
        obj.put(DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, PrimitiveValue::from(1_u16)));
        obj.put(text(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, "MONOCHROME2"));
        obj.put(DataElement::new(tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(16_u16)));
        obj.put(DataElement::new(tags::BITS_STORED, VR::US, PrimitiveValue::from(16_u16)));
        obj.put(DataElement::new(tags::HIGH_BIT, VR::US, PrimitiveValue::from(15_u16)));
        obj.put(DataElement::new(
            tags::PIXEL_REPRESENTATION,
            VR::US,
            PrimitiveValue::from(0_u16),
        ));
        obj.put(DataElement::new(
            tags::PIXEL_DATA,
            VR::OW,
            PrimitiveValue::U16(self.pixels.iter().copied().collect()),
        ));

        obj.with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                .media_storage_sop_class_uid(uids::MR_IMAGE_STORAGE)
                .media_storage_sop_instance_uid(self.sop_instance_uid.as_str()),
        )
        .map_err(|e| HippoError::Internal(format!("构造文件元信息失败: {}", e)))
    }

    /// 写入磁盘
    pub fn write_to(&self, path: &Path) -> Result<()> {
        self.to_object()?
            .write_to_file(path)
            .map_err(|e| HippoError::Internal(format!("写入合成切片失败 {:?}: {}", path, e)))
    }
}

/// 在目录中写入一个完整序列：count 张切片，间距 spacing_mm
pub fn write_series(
    dir: &Path,
    study_uid: &str,
    series_uid: &str,
    count: u32,
    spacing_mm: f64,
) -> Result<Vec<SyntheticSlice>> {
    std::fs::create_dir_all(dir)?;
    (0..count)
        .map(|i| {
            let slice = SyntheticSlice::new(study_uid, series_uid, i, i as f64 * spacing_mm);
            slice.write_to(&dir.join(format!("{}_{:03}.dcm", series_uid, i)))?;
            Ok(slice)
        })
        .collect()
}
