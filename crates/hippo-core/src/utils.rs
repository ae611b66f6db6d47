//! 通用工具函数

use uuid::Uuid;

/// UUID 派生 UID 的根（ISO/IEC 9834-8）
const UUID_UID_ROOT: &str = "2.25";

/// 生成唯一的DICOM标识符
pub fn generate_dicom_uid() -> String {
    format!("{}.{}", UUID_UID_ROOT, Uuid::new_v4().as_u128())
}

/// 生成与给定集合中任何标识符都不相同的DICOM标识符
pub fn generate_distinct_dicom_uid<'a, I>(existing: I) -> String
where
    I: IntoIterator<Item = &'a str> + Clone,
{
    loop {
        let uid = generate_dicom_uid();
        if !existing.clone().into_iter().any(|known| known == uid) {
            return uid;
        }
    }
}

/// 验证DICOM UID格式
pub fn is_valid_dicom_uid(uid: &str) -> bool {
    !uid.is_empty()
        && uid.len() <= 64
        && uid.chars().all(|c| c.is_ascii_digit() || c == '.')
        && !uid.starts_with('.')
        && !uid.ends_with('.')
        && !uid.contains("..")
        && uid
            .split('.')
            .all(|component| component == "0" || !component.starts_with('0'))
}

/// 浮点数中位数，空切片返回 None
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_dicom_uid() {
        let uid = generate_dicom_uid();
        assert!(is_valid_dicom_uid(&uid));
        assert!(uid.starts_with("2.25."));
        assert_ne!(uid, generate_dicom_uid());
    }

    #[test]
    fn test_generate_distinct_dicom_uid() {
        let known = ["1.2.3", "1.2.4"];
        let uid = generate_distinct_dicom_uid(known.iter().copied());
        assert!(!known.contains(&uid.as_str()));
    }

    #[test]
    fn test_is_valid_dicom_uid() {
        assert!(is_valid_dicom_uid("1.2.840.10008.5.1.4.1.1.4"));
        assert!(is_valid_dicom_uid("1.2.0.3"));
        assert!(!is_valid_dicom_uid(""));
        assert!(!is_valid_dicom_uid("invalid.uid.with.letters"));
        assert!(!is_valid_dicom_uid("1..2"));
        assert!(!is_valid_dicom_uid("1.02"));
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[5.0, 1.0, 3.0]), Some(3.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
    }
}
