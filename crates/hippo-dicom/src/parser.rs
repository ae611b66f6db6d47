//! DICOM数据解析器
//!
//! 从实例文件的内嵌元数据中提取检查、序列、几何和像素信息。
//! 所有字段都来自文件内容本身，不依赖文件名。

use crate::validator::DicomValidator;
use dicom::core::Tag;
use dicom::dictionary_std::tags;
use dicom::object::{open_file, DefaultDicomObject};
use dicom::pixeldata::PixelDecoder;
use hippo_core::{HippoError, Instance, Result, SeriesInfo, SliceGeometry, StudyHeader};
use ndarray::{s, Array2};
use std::path::Path;
use tracing::{debug, warn};

/// DICOM数据解析器
#[derive(Debug, Default)]
pub struct DicomParser {
    validator: DicomValidator,
}

/// 一个解析完成的实例，附带其所属检查和序列的信息
#[derive(Debug, Clone)]
pub struct ParsedInstance {
    pub study: StudyHeader,
    pub series: SeriesInfo,
    pub instance: Instance,
}

impl DicomParser {
    /// 创建新的DICOM解析器
    pub fn new() -> Self {
        Self {
            validator: DicomValidator::new(),
        }
    }

    /// 解析DICOM文件
    pub fn parse_file(&self, file_path: &Path) -> Result<ParsedInstance> {
        debug!("开始解析DICOM文件: {:?}", file_path);

        let obj = open_file(file_path).map_err(|e| {
            HippoError::DicomParse(format!("无法读取DICOM文件 {:?}: {}", file_path, e))
        })?;

        self.parse_object(&obj, Some(file_path))
    }

    /// 解析已加载的DICOM对象
    pub fn parse_object(
        &self,
        obj: &DefaultDicomObject,
        source: Option<&Path>,
    ) -> Result<ParsedInstance> {
        let parsed = Self::extract_metadata(obj);

        let validation = self.validator.validate_dicom_object(&parsed);
        for warning in &validation.warnings {
            warn!("DICOM元数据警告 {:?}: {}", source, warning);
        }
        if !validation.is_valid {
            return Err(HippoError::DicomParse(format!(
                "{:?}: {}",
                source,
                validation.errors.join("; ")
            )));
        }

        let pixels = Self::decode_pixels(obj)?;
        parsed.into_instance(pixels, source)
    }

    /// 从DICOM对象中提取元数据
    fn extract_metadata(obj: &DefaultDicomObject) -> ParsedDicomObject {
        ParsedDicomObject {
            // 患者信息
            patient_id: Self::get_string_element(obj, tags::PATIENT_ID),
            patient_name: Self::get_string_element(obj, tags::PATIENT_NAME),
            patient_birth_date: Self::get_string_element(obj, tags::PATIENT_BIRTH_DATE),
            patient_sex: Self::get_string_element(obj, tags::PATIENT_SEX),

            // 检查信息
            study_instance_uid: Self::get_string_element(obj, tags::STUDY_INSTANCE_UID),
            study_id: Self::get_string_element(obj, tags::STUDY_ID),
            study_date: Self::get_string_element(obj, tags::STUDY_DATE),
            study_time: Self::get_string_element(obj, tags::STUDY_TIME),
            study_description: Self::get_string_element(obj, tags::STUDY_DESCRIPTION),
            accession_number: Self::get_string_element(obj, tags::ACCESSION_NUMBER),
            referring_physician_name: Self::get_string_element(
                obj,
                tags::REFERRING_PHYSICIAN_NAME,
            ),

            // 序列信息
            series_instance_uid: Self::get_string_element(obj, tags::SERIES_INSTANCE_UID),
            series_number: Self::get_integer_element(obj, tags::SERIES_NUMBER),
            series_description: Self::get_string_element(obj, tags::SERIES_DESCRIPTION),
            modality: Self::get_string_element(obj, tags::MODALITY),

            // 实例信息
            sop_instance_uid: Self::get_string_element(obj, tags::SOP_INSTANCE_UID),
            sop_class_uid: Self::get_string_element(obj, tags::SOP_CLASS_UID),
            instance_number: Self::get_integer_element(obj, tags::INSTANCE_NUMBER),

            // 几何信息
            image_position: Self::get_float_values(obj, tags::IMAGE_POSITION_PATIENT),
            image_orientation: Self::get_float_values(obj, tags::IMAGE_ORIENTATION_PATIENT),
            pixel_spacing: Self::get_float_values(obj, tags::PIXEL_SPACING),
            slice_thickness: Self::get_float_values(obj, tags::SLICE_THICKNESS)
                .and_then(|v| v.first().copied()),

            // 图像信息
            rows: Self::get_integer_element(obj, tags::ROWS),
            columns: Self::get_integer_element(obj, tags::COLUMNS),
            bits_allocated: Self::get_integer_element(obj, tags::BITS_ALLOCATED),
            bits_stored: Self::get_integer_element(obj, tags::BITS_STORED),
            high_bit: Self::get_integer_element(obj, tags::HIGH_BIT),
            number_of_frames: Self::get_integer_element(obj, tags::NUMBER_OF_FRAMES),

            transfer_syntax_uid: Some(
                obj.meta()
                    .transfer_syntax()
                    .trim_end_matches('\0')
                    .to_string(),
            ),
        }
    }

    /// 解码像素数据，取第一帧、第一个采样通道
    fn decode_pixels(obj: &DefaultDicomObject) -> Result<Array2<f32>> {
        let decoded = obj
            .decode_pixel_data()
            .map_err(|e| HippoError::DicomParse(format!("像素数据解码失败: {}", e)))?;
        let array = decoded
            .to_ndarray::<f32>()
            .map_err(|e| HippoError::DicomParse(format!("像素数据转换失败: {}", e)))?;
        Ok(array.slice_move(s![0, .., .., 0]))
    }

    /// 获取字符串类型元素的值（去除填充字符）
    fn get_string_element(obj: &DefaultDicomObject, tag: Tag) -> Option<String> {
        let element = obj.element(tag).ok()?;
        match element.to_str() {
            Ok(value) => {
                let value = value.trim_end_matches(['\0', ' ']).trim_start().to_string();
                if value.is_empty() {
                    None
                } else {
                    Some(value)
                }
            }
            Err(_) => {
                debug!("标签 {:?} 不是字符串类型", tag);
                None
            }
        }
    }

    /// 获取整数类型元素的值
    fn get_integer_element(obj: &DefaultDicomObject, tag: Tag) -> Option<i32> {
        let element = obj.element(tag).ok()?;
        match element.to_int::<i32>() {
            Ok(value) => Some(value),
            Err(_) => {
                debug!("标签 {:?} 不是整数类型", tag);
                None
            }
        }
    }

    /// 获取多值浮点元素（DS/FD）
    fn get_float_values(obj: &DefaultDicomObject, tag: Tag) -> Option<Vec<f64>> {
        let element = obj.element(tag).ok()?;
        match element.to_multi_float64() {
            Ok(values) if !values.is_empty() => Some(values),
            _ => {
                debug!("标签 {:?} 无法解析为浮点数", tag);
                None
            }
        }
    }
}

/// 解析后的DICOM元数据（像素数据除外）
#[derive(Debug, Clone, Default)]
pub struct ParsedDicomObject {
    // === 患者信息 ===
    pub patient_id: Option<String>,
    pub patient_name: Option<String>,
    pub patient_birth_date: Option<String>,
    pub patient_sex: Option<String>,

    // === 检查信息 ===
    pub study_instance_uid: Option<String>,
    pub study_id: Option<String>,
    pub study_date: Option<String>,
    pub study_time: Option<String>,
    pub study_description: Option<String>,
    pub accession_number: Option<String>,
    pub referring_physician_name: Option<String>,

    // === 序列信息 ===
    pub series_instance_uid: Option<String>,
    pub series_number: Option<i32>,
    pub series_description: Option<String>,
    pub modality: Option<String>,

    // === 实例信息 ===
    pub sop_instance_uid: Option<String>,
    pub sop_class_uid: Option<String>,
    pub instance_number: Option<i32>,

    // === 几何信息 ===
    pub image_position: Option<Vec<f64>>,
    pub image_orientation: Option<Vec<f64>>,
    pub pixel_spacing: Option<Vec<f64>>,
    pub slice_thickness: Option<f64>,

    // === 图像信息 ===
    pub rows: Option<i32>,
    pub columns: Option<i32>,
    pub bits_allocated: Option<i32>,
    pub bits_stored: Option<i32>,
    pub high_bit: Option<i32>,
    pub number_of_frames: Option<i32>,

    // === 传输语法 ===
    pub transfer_syntax_uid: Option<String>,
}

impl ParsedDicomObject {
    /// 获取DICOM对象的摘要信息
    pub fn get_summary(&self) -> String {
        format!(
            "DICOM对象: 检查UID={}, 序列UID={}, 实例UID={}, 模态={}",
            self.study_instance_uid.as_deref().unwrap_or("未知"),
            self.series_instance_uid.as_deref().unwrap_or("未知"),
            self.sop_instance_uid.as_deref().unwrap_or("未知"),
            self.modality.as_deref().unwrap_or("未知")
        )
    }

    /// 结合解码后的像素数据构造核心模型；调用前须已通过验证
    fn into_instance(self, pixels: Array2<f32>, source: Option<&Path>) -> Result<ParsedInstance> {
        let missing = |name: &str| HippoError::DicomParse(format!("{:?}: 缺少 {}", source, name));

        let position = self
            .image_position
            .ok_or_else(|| missing("Image Position (Patient)"))?;
        let orientation = self
            .image_orientation
            .ok_or_else(|| missing("Image Orientation (Patient)"))?;
        let spacing = self.pixel_spacing.ok_or_else(|| missing("Pixel Spacing"))?;

        let geometry = SliceGeometry {
            image_position: [position[0], position[1], position[2]],
            image_orientation: [
                orientation[0],
                orientation[1],
                orientation[2],
                orientation[3],
                orientation[4],
                orientation[5],
            ],
            pixel_spacing: [spacing[0], spacing[1]],
            slice_thickness: self.slice_thickness,
        };

        if let (Some(rows), Some(columns)) = (self.rows, self.columns) {
            if pixels.dim() != (rows as usize, columns as usize) {
                return Err(HippoError::DicomParse(format!(
                    "{:?}: 像素矩阵 {:?} 与 Rows/Columns ({}, {}) 不一致",
                    source,
                    pixels.dim(),
                    rows,
                    columns
                )));
            }
        }

        let study = StudyHeader {
            study_uid: self
                .study_instance_uid
                .ok_or_else(|| missing("Study Instance UID"))?,
            patient_id: self.patient_id,
            patient_name: self.patient_name,
            patient_birth_date: self.patient_birth_date,
            patient_sex: self.patient_sex,
            study_id: self.study_id,
            study_date: self.study_date,
            study_time: self.study_time,
            study_description: self.study_description,
            accession_number: self.accession_number,
            referring_physician_name: self.referring_physician_name,
        };

        let series = SeriesInfo {
            series_uid: self
                .series_instance_uid
                .ok_or_else(|| missing("Series Instance UID"))?,
            modality: self.modality.ok_or_else(|| missing("Modality"))?,
            description: self.series_description,
            series_number: self.series_number,
        };

        let instance = Instance {
            sop_instance_uid: self
                .sop_instance_uid
                .ok_or_else(|| missing("SOP Instance UID"))?,
            sop_class_uid: self.sop_class_uid.ok_or_else(|| missing("SOP Class UID"))?,
            instance_number: self.instance_number,
            geometry,
            pixels,
            source_path: source.map(Path::to_path_buf),
        };

        Ok(ParsedInstance {
            study,
            series,
            instance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::SyntheticSlice;

    #[test]
    fn test_parse_synthetic_slice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slice.dcm");
        let slice = SyntheticSlice::new("1.2.826.1", "1.2.826.1.1", 2, 10.0);
        slice.write_to(&path).unwrap();

        let parsed = DicomParser::new().parse_file(&path).unwrap();
        assert_eq!(parsed.study.study_uid, "1.2.826.1");
        assert_eq!(parsed.series.series_uid, "1.2.826.1.1");
        assert_eq!(parsed.series.modality, "MR");
        assert_eq!(parsed.instance.sop_instance_uid, slice.sop_instance_uid);
        assert_eq!(parsed.instance.geometry.image_position, [0.0, 0.0, 10.0]);
        assert_eq!(parsed.instance.geometry.pixel_spacing, [1.0, 1.0]);
        assert_eq!(parsed.instance.pixels.dim(), (2, 2));
        assert_eq!(parsed.instance.pixels[[1, 1]], slice.pixels[3] as f32);
    }

    #[test]
    fn test_missing_geometry_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slice.dcm");
        let mut slice = SyntheticSlice::new("1.2.826.1", "1.2.826.1.1", 0, 0.0);
        slice.include_geometry = false;
        slice.write_to(&path).unwrap();

        let err = DicomParser::new().parse_file(&path).unwrap_err();
        assert!(matches!(err, HippoError::DicomParse(_)));
    }

    #[test]
    fn test_not_a_dicom_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"not dicom").unwrap();
        assert!(DicomParser::new().parse_file(&path).is_err());
    }
}
