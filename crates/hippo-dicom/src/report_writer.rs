//! 报告编码
//!
//! 将体积测量报告编码为 Secondary Capture 实例：新的序列和实例 UID，
//! 沿用源检查的 Study Instance UID 和患者信息，通过 Referenced Series Sequence
//! 与 Source Image Sequence 引用源序列，测量值同时写入 Image Comments。

use chrono::{DateTime, Utc};
use dicom::core::value::DataSetSequence;
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::{tags, uids};
use dicom::object::{FileDicomObject, FileMetaTableBuilder, InMemDicomObject};
use hippo_core::{HippoError, Report, ReportImage, Result};
use std::path::Path;
use tracing::debug;

/// 报告序列的序列号
const REPORT_SERIES_NUMBER: i32 = 9001;

/// 未渲染页面时使用的占位图像边长
const PLACEHOLDER_SIZE: u32 = 8;

/// 编码完成、可写盘或发送的报告
#[derive(Debug, Clone)]
pub struct EncodedReport {
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    pub study_uid: String,
    pub object: FileDicomObject<InMemDicomObject>,
}

impl EncodedReport {
    /// 保存为 DICOM 文件（Part 10 格式）
    pub fn save(&self, path: &Path) -> Result<()> {
        self.object
            .write_to_file(path)
            .map_err(|e| HippoError::Report(format!("写入报告文件 {:?} 失败: {}", path, e)))
    }

    /// 序列化为 Part 10 字节流
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.object
            .write_all(&mut buffer)
            .map_err(|e| HippoError::Report(format!("序列化报告失败: {}", e)))?;
        Ok(buffer)
    }

    /// 建议的文件名
    pub fn file_name(&self) -> String {
        format!("{}.dcm", self.sop_instance_uid)
    }
}

/// 把报告编码为 Secondary Capture 对象
pub fn encode_report(report: &Report) -> Result<EncodedReport> {
    let sop_class_uid = uids::SECONDARY_CAPTURE_IMAGE_STORAGE;
    let mut obj = InMemDicomObject::new_empty();

    put_str(&mut obj, tags::SPECIFIC_CHARACTER_SET, VR::CS, "ISO_IR 192");
    obj.put(DataElement::new(
        tags::IMAGE_TYPE,
        VR::CS,
        PrimitiveValue::Strs(["DERIVED", "SECONDARY"].iter().map(|s| s.to_string()).collect()),
    ));
    put_str(&mut obj, tags::SOP_CLASS_UID, VR::UI, sop_class_uid);
    put_str(&mut obj, tags::SOP_INSTANCE_UID, VR::UI, &report.sop_instance_uid);

    put_study(&mut obj, report);
    put_series(&mut obj, report);
    put_provenance(&mut obj, report, &report.created_at);
    put_references(&mut obj, report);
    put_image(&mut obj, report.image.as_ref())?;

    let object = obj
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                .media_storage_sop_class_uid(sop_class_uid)
                .media_storage_sop_instance_uid(report.sop_instance_uid.as_str()),
        )
        .map_err(|e| HippoError::Report(format!("构造报告文件元信息失败: {}", e)))?;

    debug!(
        "报告已编码: SOP={} 序列={}",
        report.sop_instance_uid, report.series_instance_uid
    );

    Ok(EncodedReport {
        sop_class_uid: sop_class_uid.to_string(),
        sop_instance_uid: report.sop_instance_uid.clone(),
        study_uid: report.study_uid().to_string(),
        object,
    })
}

fn put_str(obj: &mut InMemDicomObject, tag: Tag, vr: VR, value: &str) {
    obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
}

fn put_opt(obj: &mut InMemDicomObject, tag: Tag, vr: VR, value: Option<&String>) {
    match value {
        Some(v) => put_str(obj, tag, vr, v),
        // 二类属性：存在但可以为空
        None => {
            obj.put(DataElement::new(tag, vr, PrimitiveValue::Empty));
        }
    }
}

/// 患者与检查模块，全部取自源检查
fn put_study(obj: &mut InMemDicomObject, report: &Report) {
    let study = &report.study;
    put_str(obj, tags::STUDY_INSTANCE_UID, VR::UI, &study.study_uid);
    put_opt(obj, tags::PATIENT_ID, VR::LO, study.patient_id.as_ref());
    put_opt(obj, tags::PATIENT_NAME, VR::PN, study.patient_name.as_ref());
    put_opt(obj, tags::PATIENT_BIRTH_DATE, VR::DA, study.patient_birth_date.as_ref());
    put_opt(obj, tags::PATIENT_SEX, VR::CS, study.patient_sex.as_ref());
    put_opt(obj, tags::STUDY_ID, VR::SH, study.study_id.as_ref());
    put_opt(obj, tags::STUDY_DATE, VR::DA, study.study_date.as_ref());
    put_opt(obj, tags::STUDY_TIME, VR::TM, study.study_time.as_ref());
    put_opt(obj, tags::ACCESSION_NUMBER, VR::SH, study.accession_number.as_ref());
    put_opt(
        obj,
        tags::REFERRING_PHYSICIAN_NAME,
        VR::PN,
        study.referring_physician_name.as_ref(),
    );
    if let Some(description) = &study.study_description {
        put_str(obj, tags::STUDY_DESCRIPTION, VR::LO, description);
    }
}

/// 报告自己的序列模块
fn put_series(obj: &mut InMemDicomObject, report: &Report) {
    put_str(obj, tags::SERIES_INSTANCE_UID, VR::UI, &report.series_instance_uid);
    put_str(obj, tags::MODALITY, VR::CS, "OT");
    put_str(obj, tags::SERIES_DESCRIPTION, VR::LO, &report.algorithm.name);
    put_str(obj, tags::SERIES_NUMBER, VR::IS, &REPORT_SERIES_NUMBER.to_string());
    put_str(obj, tags::INSTANCE_NUMBER, VR::IS, "1");
    // 工作站生成
    put_str(obj, tags::CONVERSION_TYPE, VR::CS, "WSD");
}

/// 生成时间、算法身份和测量文本
fn put_provenance(obj: &mut InMemDicomObject, report: &Report, created_at: &DateTime<Utc>) {
    let date = created_at.format("%Y%m%d").to_string();
    let time = created_at.format("%H%M%S").to_string();
    for (tag, vr, value) in [
        (tags::SERIES_DATE, VR::DA, &date),
        (tags::SERIES_TIME, VR::TM, &time),
        (tags::CONTENT_DATE, VR::DA, &date),
        (tags::CONTENT_TIME, VR::TM, &time),
        (tags::INSTANCE_CREATION_DATE, VR::DA, &date),
        (tags::INSTANCE_CREATION_TIME, VR::TM, &time),
    ] {
        put_str(obj, tag, vr, value);
    }

    let algorithm = &report.algorithm;
    put_str(obj, tags::MANUFACTURER, VR::LO, &algorithm.name);
    put_str(obj, tags::MANUFACTURER_MODEL_NAME, VR::LO, &algorithm.model_name);
    put_str(obj, tags::SOFTWARE_VERSIONS, VR::LO, &algorithm.version);
    put_str(
        obj,
        tags::DERIVATION_DESCRIPTION,
        VR::ST,
        &format!(
            "Hippocampal segmentation by {} ({}); volumes from voxel counts",
            algorithm.model_name, algorithm.version
        ),
    );
    put_str(obj, tags::IMAGE_COMMENTS, VR::LT, &report.summary_lines.join("\n"));
}

/// 引用被测量的源序列和实例
fn put_references(obj: &mut InMemDicomObject, report: &Report) {
    let source = &report.referenced_series;

    let instance_item = |uid: &str| {
        let mut item = InMemDicomObject::new_empty();
        put_str(&mut item, tags::REFERENCED_SOP_CLASS_UID, VR::UI, &source.sop_class_uid);
        put_str(&mut item, tags::REFERENCED_SOP_INSTANCE_UID, VR::UI, uid);
        item
    };

    let mut series_item = InMemDicomObject::new_empty();
    put_str(&mut series_item, tags::SERIES_INSTANCE_UID, VR::UI, &source.series_uid);
    series_item.put(DataElement::new(
        tags::REFERENCED_INSTANCE_SEQUENCE,
        VR::SQ,
        DataSetSequence::from(
            source
                .instance_uids
                .iter()
                .map(|uid| instance_item(uid))
                .collect::<Vec<_>>(),
        ),
    ));

    obj.put(DataElement::new(
        tags::REFERENCED_SERIES_SEQUENCE,
        VR::SQ,
        DataSetSequence::from(vec![series_item]),
    ));
    obj.put(DataElement::new(
        tags::SOURCE_IMAGE_SEQUENCE,
        VR::SQ,
        DataSetSequence::from(
            source
                .instance_uids
                .iter()
                .map(|uid| instance_item(uid))
                .collect::<Vec<_>>(),
        ),
    ));
}

/// 图像像素模块：8位交错RGB
fn put_image(obj: &mut InMemDicomObject, image: Option<&ReportImage>) -> Result<()> {
    let (width, height, rgb, burned_in) = match image {
        Some(image) => (image.width, image.height, image.rgb.clone(), image.burned_in_text),
        None => (
            PLACEHOLDER_SIZE,
            PLACEHOLDER_SIZE,
            vec![0u8; (PLACEHOLDER_SIZE * PLACEHOLDER_SIZE * 3) as usize],
            false,
        ),
    };

    let dimension = |value: u32| match u16::try_from(value) {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(HippoError::Report(format!(
            "报告图像尺寸 {}x{} 超出 1..=65535",
            width, height
        ))),
    };
    let (rows, columns) = (dimension(height)?, dimension(width)?);
    if rgb.len() != rows as usize * columns as usize * 3 {
        return Err(HippoError::Report(format!(
            "报告图像数据长度 {} 与尺寸 {}x{} 不符",
            rgb.len(),
            width,
            height
        )));
    }

    let us = |value: u16| PrimitiveValue::from(value);
    obj.put(DataElement::new(tags::ROWS, VR::US, us(rows)));
    obj.put(DataElement::new(tags::COLUMNS, VR::US, us(columns)));
    obj.put(DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, us(3)));
    put_str(obj, tags::PHOTOMETRIC_INTERPRETATION, VR::CS, "RGB");
    obj.put(DataElement::new(tags::PLANAR_CONFIGURATION, VR::US, us(0)));
    obj.put(DataElement::new(tags::BITS_ALLOCATED, VR::US, us(8)));
    obj.put(DataElement::new(tags::BITS_STORED, VR::US, us(8)));
    obj.put(DataElement::new(tags::HIGH_BIT, VR::US, us(7)));
    obj.put(DataElement::new(tags::PIXEL_REPRESENTATION, VR::US, us(0)));
    put_str(
        obj,
        tags::BURNED_IN_ANNOTATION,
        VR::CS,
        if burned_in { "YES" } else { "NO" },
    );
    obj.put(DataElement::new(
        tags::PIXEL_DATA,
        VR::OB,
        PrimitiveValue::from(rgb),
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hippo_core::{
        AlgorithmInfo, LabelVolume, ReferencedSeries, StudyHeader, VolumeMeasurement,
    };

    fn sample_report(image: Option<ReportImage>) -> Report {
        let label = |label, name: &str, count| LabelVolume {
            label,
            name: name.to_string(),
            voxel_count: count,
            volume_mm3: count as f64 * 5.0,
        };
        Report {
            sop_instance_uid: "2.25.100".into(),
            series_instance_uid: "2.25.200".into(),
            study: StudyHeader {
                study_uid: "1.2.3".into(),
                patient_id: Some("HIPPO001".into()),
                ..Default::default()
            },
            referenced_series: ReferencedSeries {
                series_uid: "1.2.3.1".into(),
                modality: "MR".into(),
                description: Some("HCropVolume".into()),
                sop_class_uid: uids::MR_IMAGE_STORAGE.into(),
                instance_uids: vec!["1.2.3.1.1".into(), "1.2.3.1.2".into()],
            },
            measurement: VolumeMeasurement {
                labels: vec![label(1, "anterior", 10), label(2, "posterior", 2)],
                total: label(0, "total", 12),
                voxel_volume_mm3: 5.0,
            },
            created_at: Utc::now(),
            algorithm: AlgorithmInfo {
                name: "HippoVolume.AI".into(),
                version: "0.1.0".into(),
                model_name: "threshold".into(),
            },
            summary_lines: vec!["anterior=50.00 mm3".into(), "total=60.00 mm3".into()],
            image,
        }
    }

    fn text(obj: &InMemDicomObject, tag: Tag) -> String {
        obj.element(tag)
            .unwrap()
            .to_str()
            .unwrap()
            .trim_end_matches(['\0', ' '])
            .to_string()
    }

    #[test]
    fn test_encode_report_identity() {
        let encoded = encode_report(&sample_report(None)).unwrap();
        let obj = &encoded.object;

        assert_eq!(text(obj, tags::SOP_CLASS_UID), uids::SECONDARY_CAPTURE_IMAGE_STORAGE);
        assert_eq!(text(obj, tags::SOP_INSTANCE_UID), "2.25.100");
        assert_eq!(text(obj, tags::SERIES_INSTANCE_UID), "2.25.200");
        assert_eq!(text(obj, tags::STUDY_INSTANCE_UID), "1.2.3");
        assert_eq!(text(obj, tags::PATIENT_ID), "HIPPO001");
        assert_eq!(text(obj, tags::MODALITY), "OT");
        assert_eq!(text(obj, tags::BURNED_IN_ANNOTATION), "NO");
        assert!(text(obj, tags::IMAGE_COMMENTS).contains("total=60.00 mm3"));
        assert_eq!(encoded.file_name(), "2.25.100.dcm");
    }

    #[test]
    fn test_encode_report_references_source() {
        let encoded = encode_report(&sample_report(None)).unwrap();
        let series_items = encoded
            .object
            .element(tags::REFERENCED_SERIES_SEQUENCE)
            .unwrap()
            .items()
            .unwrap();
        assert_eq!(series_items.len(), 1);
        assert_eq!(text(&series_items[0], tags::SERIES_INSTANCE_UID), "1.2.3.1");
        let instance_items = series_items[0]
            .element(tags::REFERENCED_INSTANCE_SEQUENCE)
            .unwrap()
            .items()
            .unwrap();
        assert_eq!(instance_items.len(), 2);

        let sources = encoded
            .object
            .element(tags::SOURCE_IMAGE_SEQUENCE)
            .unwrap()
            .items()
            .unwrap();
        assert_eq!(text(&sources[1], tags::REFERENCED_SOP_INSTANCE_UID), "1.2.3.1.2");
    }

    #[test]
    fn test_encode_report_rejects_oversized_image() {
        let image = ReportImage {
            width: 70_000,
            height: 1,
            rgb: vec![0; 70_000 * 3],
            burned_in_text: false,
        };
        assert!(matches!(
            encode_report(&sample_report(Some(image))),
            Err(HippoError::Report(_))
        ));

        let empty = ReportImage {
            width: 0,
            height: 0,
            rgb: Vec::new(),
            burned_in_text: false,
        };
        assert!(encode_report(&sample_report(Some(empty))).is_err());
    }

    #[test]
    fn test_encode_report_round_trip_file() {
        let image = ReportImage {
            width: 4,
            height: 2,
            rgb: vec![255; 4 * 2 * 3],
            burned_in_text: true,
        };
        let encoded = encode_report(&sample_report(Some(image))).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(encoded.file_name());
        encoded.save(&path).unwrap();

        let reopened = dicom::object::open_file(&path).unwrap();
        assert_eq!(reopened.element(tags::ROWS).unwrap().to_int::<u16>().unwrap(), 2);
        assert_eq!(reopened.element(tags::COLUMNS).unwrap().to_int::<u16>().unwrap(), 4);
        assert_eq!(text(&reopened, tags::BURNED_IN_ANNOTATION), "YES");
        assert_eq!(
            reopened.meta().media_storage_sop_instance_uid().trim_end_matches('\0'),
            "2.25.100"
        );
        assert!(!encoded.to_bytes().unwrap().is_empty());
    }
}
