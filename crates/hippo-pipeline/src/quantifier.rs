//! 体积计算

use hippo_core::{HippoError, LabelVolume, Result, SegmentationMask, VolumeMeasurement, VoxelSpacing};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// 标签值与名称
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelDefinition {
    pub value: u8,
    pub name: String,
}

impl LabelDefinition {
    pub fn new(value: u8, name: &str) -> Self {
        Self {
            value,
            name: name.to_string(),
        }
    }
}

/// 默认标签：1 为海马前部，2 为海马后部
pub fn default_labels() -> Vec<LabelDefinition> {
    vec![
        LabelDefinition::new(1, "anterior"),
        LabelDefinition::new(2, "posterior"),
    ]
}

/// 合计条目的名称
pub const TOTAL_LABEL_NAME: &str = "total";

/// 体积计算器
#[derive(Debug, Clone)]
pub struct VolumeQuantifier {
    labels: Vec<LabelDefinition>,
}

impl Default for VolumeQuantifier {
    fn default() -> Self {
        Self {
            labels: default_labels(),
        }
    }
}

impl VolumeQuantifier {
    pub fn new(labels: Vec<LabelDefinition>) -> Result<Self> {
        if labels.iter().any(|l| l.value == 0) {
            return Err(HippoError::Config("标签值 0 表示背景，不能用于测量".into()));
        }
        Ok(Self { labels })
    }

    /// 每个标签的体素数 × 体素体积，外加所有非零标签的合计
    pub fn measure(&self, mask: &SegmentationMask, spacing: &VoxelSpacing) -> VolumeMeasurement {
        let voxel_volume = spacing.voxel_volume();

        // 单次遍历统计所有标签
        let mut histogram = [0u64; 256];
        for &value in mask.labels.iter() {
            histogram[value as usize] += 1;
        }

        let labels = self
            .labels
            .iter()
            .map(|definition| {
                let count = histogram[definition.value as usize];
                LabelVolume {
                    label: definition.value,
                    name: definition.name.clone(),
                    voxel_count: count,
                    volume_mm3: count as f64 * voxel_volume,
                }
            })
            .collect();

        let foreground: u64 = histogram[1..].iter().sum();
        let measurement = VolumeMeasurement {
            labels,
            total: LabelVolume {
                label: 0,
                name: TOTAL_LABEL_NAME.to_string(),
                voxel_count: foreground,
                volume_mm3: foreground as f64 * voxel_volume,
            },
            voxel_volume_mm3: voxel_volume,
        };

        debug!("体积测量: {}", measurement.summary());
        measurement
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_all_zero_mask() {
        let mask = SegmentationMask::new(Array3::zeros((3, 4, 4)));
        let m = VolumeQuantifier::default().measure(&mask, &VoxelSpacing::new(2.0, 0.5, 0.5));
        assert!(m.labels.iter().all(|l| l.volume_mm3 == 0.0 && l.voxel_count == 0));
        assert_eq!(m.total.volume_mm3, 0.0);
    }

    #[test]
    fn test_volume_is_count_times_voxel() {
        let mut labels = Array3::<u8>::zeros((2, 3, 3));
        labels.slice_mut(ndarray::s![0, .., ..]).fill(1);
        labels[[1, 0, 0]] = 2;
        labels[[1, 0, 1]] = 2;
        let mask = SegmentationMask::new(labels);

        let m = VolumeQuantifier::default().measure(&mask, &VoxelSpacing::new(3.0, 0.5, 2.0));
        assert_eq!(m.voxel_volume_mm3, 3.0);
        assert_eq!(m.get("anterior").unwrap().voxel_count, 9);
        assert_eq!(m.get("anterior").unwrap().volume_mm3, 27.0);
        assert_eq!(m.get("posterior").unwrap().volume_mm3, 6.0);
        assert_eq!(m.get("total").unwrap().volume_mm3, 33.0);
    }

    #[test]
    fn test_three_slice_scenario() {
        let mask = SegmentationMask::new(Array3::from_elem((3, 2, 2), 1));
        let m = VolumeQuantifier::default().measure(&mask, &VoxelSpacing::new(5.0, 1.0, 1.0));
        assert_eq!(m.total.volume_mm3, 60.0);
    }

    #[test]
    fn test_background_label_rejected() {
        assert!(VolumeQuantifier::new(vec![LabelDefinition::new(0, "bg")]).is_err());
    }
}
