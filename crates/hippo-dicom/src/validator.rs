//! DICOM数据验证模块
//!
//! 在解码像素之前检查实例元数据是否足以参与体数据重建：
//! 必需的UID、模态、图像尺寸以及空间几何信息。

use crate::parser::ParsedDicomObject;
use dicom::dictionary_std::uids;
use hippo_core::utils::is_valid_dicom_uid;
use tracing::debug;

/// 方向余弦的单位长度和正交性容差
const ORIENTATION_TOLERANCE: f64 = 1e-3;

/// 无需额外编解码器即可读取的传输语法
const NATIVE_TRANSFER_SYNTAXES: [&str; 4] = [
    uids::IMPLICIT_VR_LITTLE_ENDIAN,
    uids::EXPLICIT_VR_LITTLE_ENDIAN,
    uids::EXPLICIT_VR_BIG_ENDIAN,
    uids::DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN,
];

/// DICOM数据验证器
#[derive(Debug, Default)]
pub struct DicomValidator;

impl DicomValidator {
    /// 创建新的DICOM验证器
    pub fn new() -> Self {
        Self
    }

    /// 验证DICOM对象的完整性和合规性
    pub fn validate_dicom_object(&self, obj: &ParsedDicomObject) -> ValidationResult {
        let mut result = ValidationResult::new();

        debug!("开始验证DICOM对象: {}", obj.get_summary());

        // 1. 验证必需的UID
        self.validate_required_uids(obj, &mut result);

        // 2. 验证患者信息
        self.validate_patient_info(obj, &mut result);

        // 3. 验证序列信息
        self.validate_series_info(obj, &mut result);

        // 4. 验证传输语法
        self.validate_transfer_syntax(obj, &mut result);

        // 5. 验证图像信息
        self.validate_image_info(obj, &mut result);

        // 6. 验证空间几何
        self.validate_geometry(obj, &mut result);

        // 7. 验证日期时间格式
        self.validate_datetime_format(obj, &mut result);

        debug!(
            "DICOM对象验证完成: {} 个错误, {} 个警告",
            result.errors.len(),
            result.warnings.len()
        );

        result
    }

    /// 验证必需的UID
    fn validate_required_uids(&self, obj: &ParsedDicomObject, result: &mut ValidationResult) {
        let required_uids = [
            ("SOP Class UID", obj.sop_class_uid.as_ref()),
            ("SOP Instance UID", obj.sop_instance_uid.as_ref()),
            ("Study Instance UID", obj.study_instance_uid.as_ref()),
            ("Series Instance UID", obj.series_instance_uid.as_ref()),
        ];

        for (name, uid) in required_uids {
            match uid {
                Some(uid_value) if !uid_value.trim().is_empty() => {
                    if !is_valid_dicom_uid(uid_value) {
                        // 厂商UID常有前导零等小问题，不影响分组
                        result.add_warning(format!("{} 格式不规范: {}", name, uid_value));
                    }
                }
                Some(_) => result.add_error(format!("{} 不能为空", name)),
                None => result.add_error(format!("{} 缺失", name)),
            }
        }
    }

    /// 验证患者信息
    fn validate_patient_info(&self, obj: &ParsedDicomObject, result: &mut ValidationResult) {
        if obj.patient_id.is_none() {
            result.add_warning("患者ID缺失".to_string());
        }

        if let Some(sex) = &obj.patient_sex {
            if !["M", "F", "O"].contains(&sex.as_str()) {
                result.add_warning(format!("患者性别值无效: {}，应为M/F/O", sex));
            }
        }
    }

    /// 验证序列信息
    fn validate_series_info(&self, obj: &ParsedDicomObject, result: &mut ValidationResult) {
        match &obj.modality {
            Some(modality) if !self.is_valid_modality(modality) => {
                result.add_warning(format!("模态代码可能无效: {}", modality));
            }
            Some(_) => {}
            None => result.add_error("模态信息缺失".to_string()),
        }
    }

    /// 验证传输语法
    fn validate_transfer_syntax(&self, obj: &ParsedDicomObject, result: &mut ValidationResult) {
        match &obj.transfer_syntax_uid {
            Some(ts) if !NATIVE_TRANSFER_SYNTAXES.contains(&ts.as_str()) => {
                result.add_warning(format!("压缩传输语法，像素解码可能失败: {}", ts));
            }
            Some(_) => {}
            None => result.add_warning("传输语法信息缺失".to_string()),
        }
    }

    /// 验证图像信息
    fn validate_image_info(&self, obj: &ParsedDicomObject, result: &mut ValidationResult) {
        match (obj.rows, obj.columns) {
            (Some(rows), Some(columns)) => {
                if rows <= 0 || columns <= 0 {
                    result.add_error("图像尺寸必须为正数".to_string());
                } else if rows > 32768 || columns > 32768 {
                    result.add_warning("图像尺寸异常大，可能存在错误".to_string());
                }
            }
            _ => result.add_error("图像尺寸信息不完整，缺少行数或列数".to_string()),
        }

        if let (Some(bits_allocated), Some(bits_stored)) = (obj.bits_allocated, obj.bits_stored) {
            if bits_stored > bits_allocated {
                result.add_error("存储位数不能大于分配位数".to_string());
            }
            if let Some(high_bit) = obj.high_bit {
                if high_bit + 1 != bits_stored {
                    result.add_warning("最高位与存储位数不匹配".to_string());
                }
            }
        }

        if let Some(frames) = obj.number_of_frames {
            if frames > 1 {
                result.add_warning(format!("多帧实例仅使用第一帧: {} 帧", frames));
            }
        }
    }

    /// 验证空间几何：位置3个值、方向6个值且为正交单位向量、像素间距为正
    fn validate_geometry(&self, obj: &ParsedDicomObject, result: &mut ValidationResult) {
        match &obj.image_position {
            Some(position) if position.len() == 3 => {
                if position.iter().any(|v| !v.is_finite()) {
                    result.add_error(format!(
                        "Image Position (Patient) 含非有限值: {:?}",
                        position
                    ));
                }
            }
            Some(position) => result.add_error(format!(
                "Image Position (Patient) 应有3个值，实际 {}",
                position.len()
            )),
            None => result.add_error("Image Position (Patient) 缺失".to_string()),
        }

        match &obj.image_orientation {
            Some(orientation) if orientation.iter().any(|v| !v.is_finite()) => {
                result.add_error(format!(
                    "Image Orientation (Patient) 含非有限值: {:?}",
                    orientation
                ))
            }
            Some(orientation) if orientation.len() == 6 => {
                let row = &orientation[0..3];
                let column = &orientation[3..6];
                let norm = |v: &[f64]| v.iter().map(|x| x * x).sum::<f64>().sqrt();
                let dot: f64 = row.iter().zip(column).map(|(a, b)| a * b).sum();
                if !((norm(row) - 1.0).abs() <= ORIENTATION_TOLERANCE)
                    || !((norm(column) - 1.0).abs() <= ORIENTATION_TOLERANCE)
                {
                    result.add_error("Image Orientation (Patient) 不是单位向量".to_string());
                }
                if !(dot.abs() <= ORIENTATION_TOLERANCE) {
                    result.add_error("Image Orientation (Patient) 行列方向不正交".to_string());
                }
            }
            Some(orientation) => result.add_error(format!(
                "Image Orientation (Patient) 应有6个值，实际 {}",
                orientation.len()
            )),
            None => result.add_error("Image Orientation (Patient) 缺失".to_string()),
        }

        match &obj.pixel_spacing {
            Some(spacing) if spacing.len() == 2 => {
                if spacing.iter().any(|s| !s.is_finite() || *s <= 0.0) {
                    result.add_error(format!("Pixel Spacing 必须为正数: {:?}", spacing));
                }
            }
            Some(spacing) => result.add_error(format!(
                "Pixel Spacing 应有2个值，实际 {}",
                spacing.len()
            )),
            None => result.add_error("Pixel Spacing 缺失".to_string()),
        }

        if let Some(thickness) = obj.slice_thickness {
            if !(thickness > 0.0) {
                result.add_warning(format!("Slice Thickness 非正数: {}", thickness));
            }
        }
    }

    /// 验证日期时间格式（仅作为警告，不影响测量）
    fn validate_datetime_format(&self, obj: &ParsedDicomObject, result: &mut ValidationResult) {
        let date_fields = [
            ("患者出生日期", &obj.patient_birth_date),
            ("检查日期", &obj.study_date),
        ];

        for (name, date) in date_fields {
            if let Some(date) = date {
                if !self.is_valid_dicom_date(date) {
                    result.add_warning(format!("{}格式无效: {}", name, date));
                }
            }
        }

        if let Some(time) = &obj.study_time {
            if !self.is_valid_dicom_time(time) {
                result.add_warning(format!("检查时间格式无效: {}", time));
            }
        }
    }

    /// 检查是否为有效的DICOM日期 (YYYYMMDD)
    fn is_valid_dicom_date(&self, date: &str) -> bool {
        if date.len() != 8 || !date.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }

        if let (Ok(year), Ok(month), Ok(day)) = (
            date[0..4].parse::<u32>(),
            date[4..6].parse::<u32>(),
            date[6..8].parse::<u32>(),
        ) {
            if day == 0 {
                return false;
            }
            match month {
                1 | 3 | 5 | 7 | 8 | 10 | 12 => day <= 31,
                4 | 6 | 9 | 11 => day <= 30,
                2 => {
                    if (year % 400 == 0) || (year % 100 != 0 && year % 4 == 0) {
                        day <= 29
                    } else {
                        day <= 28
                    }
                }
                _ => false,
            }
        } else {
            false
        }
    }

    /// 检查是否为有效的DICOM时间 (HHMMSS.FFFFFF)
    fn is_valid_dicom_time(&self, time: &str) -> bool {
        let time_without_fraction = match time.find('.') {
            Some(dot_pos) => &time[..dot_pos],
            None => time,
        };

        if time_without_fraction.len() < 2
            || time_without_fraction.len() > 6
            || !time_without_fraction.chars().all(|c| c.is_ascii_digit())
        {
            return false;
        }

        let field = |range: std::ops::Range<usize>| -> Option<u32> {
            time_without_fraction.get(range).and_then(|s| s.parse().ok())
        };

        // 允许60秒（闰秒）
        let limits = [(0..2, 23), (2..4, 59), (4..6, 60)];
        limits.into_iter().all(|(range, max)| {
            if range.start >= time_without_fraction.len() {
                return true;
            }
            field(range).map(|v| v <= max).unwrap_or(false)
        })
    }

    /// 检查是否为有效的DICOM模态代码
    fn is_valid_modality(&self, modality: &str) -> bool {
        let valid_modalities = [
            "CR", "CT", "DX", "MG", "MR", "NM", "OT", "PT", "RF", "SC", "US", "XA", "SEG",
            "REG", "PR", "SR", "DOC",
        ];

        valid_modalities.contains(&modality)
    }
}

/// 验证结果
#[derive(Debug, Clone)]
pub struct ValidationResult {
    /// 验证错误列表
    pub errors: Vec<String>,
    /// 验证警告列表
    pub warnings: Vec<String>,
    /// 是否通过验证
    pub is_valid: bool,
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidationResult {
    /// 创建新的验证结果
    pub fn new() -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
            is_valid: true,
        }
    }

    /// 添加错误
    pub fn add_error(&mut self, error: String) {
        self.is_valid = false;
        self.errors.push(error);
    }

    /// 添加警告
    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// 获取验证报告摘要
    pub fn get_summary(&self) -> String {
        if self.is_valid {
            if self.has_warnings() {
                format!("验证通过，但有 {} 个警告", self.warnings.len())
            } else {
                "验证完全通过".to_string()
            }
        } else {
            format!(
                "验证失败：{} 个错误，{} 个警告",
                self.errors.len(),
                self.warnings.len()
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_object() -> ParsedDicomObject {
        ParsedDicomObject {
            patient_id: Some("P001".into()),
            study_instance_uid: Some("1.2.3".into()),
            series_instance_uid: Some("1.2.3.4".into()),
            sop_instance_uid: Some("1.2.3.4.5".into()),
            sop_class_uid: Some(uids::MR_IMAGE_STORAGE.into()),
            modality: Some("MR".into()),
            rows: Some(64),
            columns: Some(64),
            image_position: Some(vec![0.0, 0.0, 0.0]),
            image_orientation: Some(vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0]),
            pixel_spacing: Some(vec![1.0, 1.0]),
            transfer_syntax_uid: Some(uids::EXPLICIT_VR_LITTLE_ENDIAN.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_object_passes() {
        let result = DicomValidator::new().validate_dicom_object(&valid_object());
        assert!(result.is_valid, "{:?}", result.errors);
        assert!(!result.has_warnings());
    }

    #[test]
    fn test_missing_geometry_is_error() {
        let mut obj = valid_object();
        obj.image_position = None;
        obj.pixel_spacing = Some(vec![0.0, 1.0]);
        let result = DicomValidator::new().validate_dicom_object(&obj);
        assert!(!result.is_valid);
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn test_non_orthogonal_orientation() {
        let mut obj = valid_object();
        obj.image_orientation = Some(vec![1.0, 0.0, 0.0, 0.7071, 0.7071, 0.0]);
        let result = DicomValidator::new().validate_dicom_object(&obj);
        assert!(!result.is_valid);
        assert!(result.errors[0].contains("不正交"));
    }

    #[test]
    fn test_non_finite_position_is_error() {
        let mut obj = valid_object();
        obj.image_position = Some(vec![0.0, 0.0, f64::NAN]);
        let result = DicomValidator::new().validate_dicom_object(&obj);
        assert!(!result.is_valid);
        assert!(result.errors[0].contains("Image Position"));

        obj.image_position = Some(vec![f64::INFINITY, 0.0, 0.0]);
        assert!(!DicomValidator::new().validate_dicom_object(&obj).is_valid);
    }

    #[test]
    fn test_non_finite_orientation_is_error() {
        let mut obj = valid_object();
        obj.image_orientation = Some(vec![f64::NAN, 0.0, 0.0, 0.0, 1.0, 0.0]);
        let result = DicomValidator::new().validate_dicom_object(&obj);
        assert!(!result.is_valid);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("Image Orientation"));
    }

    #[test]
    fn test_compressed_transfer_syntax_warns() {
        let mut obj = valid_object();
        obj.transfer_syntax_uid = Some(uids::JPEG_BASELINE8_BIT.into());
        let result = DicomValidator::new().validate_dicom_object(&obj);
        assert!(result.is_valid);
        assert!(result.has_warnings());
    }

    #[test]
    fn test_dicom_date_validation() {
        let validator = DicomValidator::new();

        assert!(validator.is_valid_dicom_date("20230101"));
        assert!(validator.is_valid_dicom_date("20240229")); // 闰年
        assert!(!validator.is_valid_dicom_date("20230229")); // 非闰年
        assert!(!validator.is_valid_dicom_date("20231301")); // 无效月份
        assert!(!validator.is_valid_dicom_date("20230132")); // 无效日期
        assert!(!validator.is_valid_dicom_date("2023011")); // 长度错误
    }

    #[test]
    fn test_dicom_time_validation() {
        let validator = DicomValidator::new();

        assert!(validator.is_valid_dicom_time("123045"));
        assert!(validator.is_valid_dicom_time("123045.123456"));
        assert!(validator.is_valid_dicom_time("12"));
        assert!(validator.is_valid_dicom_time("1230"));
        assert!(!validator.is_valid_dicom_time("253045")); // 无效小时
        assert!(!validator.is_valid_dicom_time("126045")); // 无效分钟
        assert!(!validator.is_valid_dicom_time("123061")); // 无效秒数
    }

    #[test]
    fn test_validation_result() {
        let mut result = ValidationResult::new();

        result.add_warning("测试警告".to_string());
        assert!(result.has_warnings());
        assert!(result.is_valid);

        result.add_error("测试错误".to_string());
        assert!(result.has_errors());
        assert!(!result.is_valid);
        assert_eq!(result.get_summary(), "验证失败：1 个错误，1 个警告");
    }
}
