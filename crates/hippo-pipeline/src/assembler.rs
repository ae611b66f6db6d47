//! 体数据重建
//!
//! 把一个序列的二维切片按空间位置排序并堆叠成三维体数据。

use hippo_core::utils::median;
use hippo_core::{HippoError, Instance, Result, Series, Volume, VoxelSpacing};
use ndarray::{s, Array3};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// 重建参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblyConfig {
    /// 方向余弦逐分量比较的容差
    pub orientation_tolerance: f64,
    /// 像素间距比较的容差（毫米）
    pub spacing_tolerance_mm: f64,
    /// 相邻切片的最小间距（毫米），不大于此值视为位置重复
    pub min_slice_gap_mm: f64,
    /// 相邻间距偏离中位数的相对容差，超出时记录警告
    pub gap_tolerance: f64,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            orientation_tolerance: 1e-4,
            spacing_tolerance_mm: 1e-3,
            min_slice_gap_mm: 1e-3,
            gap_tolerance: 0.1,
        }
    }
}

/// 体数据重建器
#[derive(Debug, Clone, Default)]
pub struct VolumeAssembler {
    config: AssemblyConfig,
}

impl VolumeAssembler {
    pub fn new(config: AssemblyConfig) -> Self {
        Self { config }
    }

    /// 重建体数据
    pub fn assemble(&self, series: &Series) -> Result<Volume> {
        let series_uid = &series.info.series_uid;
        let first = series.instances.first().ok_or_else(|| {
            HippoError::geometry(format!("序列 {} 没有实例", series_uid), Vec::new())
        })?;

        self.check_consistency(first, &series.instances)?;

        // 沿切片法向投影并升序排序
        let normal = first.geometry.slice_normal();
        let mut ordered: Vec<(f64, &Instance)> = series
            .instances
            .iter()
            .map(|instance| {
                let p = instance.geometry.image_position;
                (p[0] * normal[0] + p[1] * normal[1] + p[2] * normal[2], instance)
            })
            .collect();
        ordered.sort_by(|a, b| a.0.total_cmp(&b.0));

        let positions: Vec<f64> = ordered.iter().map(|(position, _)| *position).collect();
        let gaps: Vec<f64> = positions.windows(2).map(|w| w[1] - w[0]).collect();

        for (i, gap) in gaps.iter().enumerate() {
            // NaN 间距同样视为无法排序
            if !(*gap > self.config.min_slice_gap_mm) {
                return Err(HippoError::geometry(
                    format!(
                        "序列 {} 中切片位置重复或不单调: 间距 {:.4} mm",
                        series_uid, gap
                    ),
                    vec![
                        ordered[i].1.sop_instance_uid.clone(),
                        ordered[i + 1].1.sop_instance_uid.clone(),
                    ],
                ));
            }
        }

        let slice_spacing = self.slice_spacing(first, &gaps, series_uid);
        for (i, gap) in gaps.iter().enumerate() {
            if (gap - slice_spacing).abs() > slice_spacing * self.config.gap_tolerance {
                warn!(
                    "序列 {} 切片间距不均匀: {} 与 {} 之间为 {:.4} mm（中位数 {:.4} mm）",
                    series_uid,
                    ordered[i].1.sop_instance_uid,
                    ordered[i + 1].1.sop_instance_uid,
                    gap,
                    slice_spacing
                );
            }
        }

        let (rows, columns) = first.pixels.dim();
        let mut data = Array3::<f32>::zeros((ordered.len(), rows, columns));
        for (i, (_, instance)) in ordered.iter().enumerate() {
            data.slice_mut(s![i, .., ..]).assign(&instance.pixels);
        }

        let spacing = VoxelSpacing::new(
            slice_spacing,
            first.geometry.pixel_spacing[0],
            first.geometry.pixel_spacing[1],
        );
        debug!(
            "序列 {} 重建完成: 形状 {:?}, 体素 {:?} mm",
            series_uid,
            data.dim(),
            spacing.as_array()
        );

        Ok(Volume {
            data,
            spacing,
            slice_positions: positions,
            slice_gaps: gaps,
            instance_uids: ordered
                .iter()
                .map(|(_, instance)| instance.sop_instance_uid.clone())
                .collect(),
            series_uid: series_uid.clone(),
        })
    }

    /// 方向、像素间距和矩阵尺寸必须在所有实例间一致
    fn check_consistency(&self, reference: &Instance, instances: &[Instance]) -> Result<()> {
        let reference_geometry = &reference.geometry;

        let mismatched = |predicate: &dyn Fn(&Instance) -> bool| -> Vec<String> {
            instances
                .iter()
                .filter(|instance| predicate(instance))
                .map(|instance| instance.sop_instance_uid.clone())
                .collect()
        };

        let non_finite = mismatched(&|instance| {
            let geometry = &instance.geometry;
            geometry
                .image_position
                .iter()
                .chain(geometry.image_orientation.iter())
                .chain(geometry.pixel_spacing.iter())
                .any(|v| !v.is_finite())
        });
        if !non_finite.is_empty() {
            return Err(HippoError::geometry(
                "位置、方向或像素间距含非有限值".to_string(),
                non_finite,
            ));
        }

        let orientation = mismatched(&|instance| {
            instance
                .geometry
                .image_orientation
                .iter()
                .zip(reference_geometry.image_orientation.iter())
                .any(|(a, b)| !((a - b).abs() <= self.config.orientation_tolerance))
        });
        if !orientation.is_empty() {
            return Err(self.mismatch("方向不一致", reference, orientation));
        }

        let spacing = mismatched(&|instance| {
            instance
                .geometry
                .pixel_spacing
                .iter()
                .zip(reference_geometry.pixel_spacing.iter())
                .any(|(a, b)| !((a - b).abs() <= self.config.spacing_tolerance_mm))
        });
        if !spacing.is_empty() {
            return Err(self.mismatch("像素间距不一致", reference, spacing));
        }

        let dims = mismatched(&|instance| instance.pixels.dim() != reference.pixels.dim());
        if !dims.is_empty() {
            return Err(self.mismatch("图像尺寸不一致", reference, dims));
        }

        Ok(())
    }

    fn mismatch(&self, what: &str, reference: &Instance, offending: Vec<String>) -> HippoError {
        HippoError::geometry(
            format!("{}（参考实例 {}）", what, reference.sop_instance_uid),
            offending,
        )
    }

    /// 层间距取相邻间距的中位数；单切片序列退回到层厚
    fn slice_spacing(&self, first: &Instance, gaps: &[f64], series_uid: &str) -> f64 {
        if let Some(spacing) = median(gaps) {
            return spacing;
        }

        match first.geometry.slice_thickness {
            Some(thickness) if thickness > 0.0 => thickness,
            _ => {
                warn!(
                    "序列 {} 只有一张切片且缺少层厚，层间距按 1.0 mm 计算",
                    series_uid
                );
                1.0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hippo_core::{SeriesInfo, SliceGeometry};
    use ndarray::Array2;

    fn instance(uid: &str, z: f64, value: f32) -> Instance {
        Instance {
            sop_instance_uid: uid.to_string(),
            sop_class_uid: "1.2.840.10008.5.1.4.1.1.4".into(),
            instance_number: None,
            geometry: SliceGeometry {
                image_position: [0.0, 0.0, z],
                image_orientation: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
                pixel_spacing: [1.0, 1.0],
                slice_thickness: Some(2.5),
            },
            pixels: Array2::from_elem((2, 2), value),
            source_path: None,
        }
    }

    fn series(instances: Vec<Instance>) -> Series {
        Series {
            info: SeriesInfo {
                series_uid: "1.2.3.1".into(),
                modality: "MR".into(),
                description: None,
                series_number: None,
            },
            instances,
        }
    }

    #[test]
    fn test_assemble_orders_by_position() {
        let series = series(vec![
            instance("c", 10.0, 3.0),
            instance("a", 0.0, 1.0),
            instance("b", 5.0, 2.0),
        ]);
        let volume = VolumeAssembler::default().assemble(&series).unwrap();

        assert_eq!(volume.dim(), (3, 2, 2));
        assert_eq!(volume.instance_uids, vec!["a", "b", "c"]);
        assert_eq!(volume.data[[0, 0, 0]], 1.0);
        assert_eq!(volume.data[[2, 1, 1]], 3.0);
        assert_eq!(volume.spacing.as_array(), [5.0, 1.0, 1.0]);
        assert_eq!(volume.slice_gaps, vec![5.0, 5.0]);
    }

    #[test]
    fn test_duplicate_position_fails() {
        let series = series(vec![instance("a", 0.0, 1.0), instance("b", 0.0, 1.0)]);
        match VolumeAssembler::default().assemble(&series).unwrap_err() {
            HippoError::Geometry { instance_uids, .. } => {
                assert_eq!(instance_uids.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_nan_position_fails() {
        let series = series(vec![
            instance("a", 0.0, 1.0),
            instance("b", 5.0, 1.0),
            instance("c", 10.0, 1.0),
            instance("nan", f64::NAN, 1.0),
        ]);
        match VolumeAssembler::default().assemble(&series).unwrap_err() {
            HippoError::Geometry { instance_uids, .. } => {
                assert_eq!(instance_uids, vec!["nan".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_nan_orientation_fails() {
        let nan_orientation = |mut instance: Instance| {
            instance.geometry.image_orientation = [f64::NAN, 0.0, 0.0, 0.0, 1.0, 0.0];
            instance
        };
        let series = series(vec![
            nan_orientation(instance("a", 0.0, 1.0)),
            nan_orientation(instance("b", 5.0, 1.0)),
            nan_orientation(instance("c", 10.0, 1.0)),
        ]);
        assert!(matches!(
            VolumeAssembler::default().assemble(&series),
            Err(HippoError::Geometry { .. })
        ));
    }

    #[test]
    fn test_orientation_mismatch_names_instance() {
        let mut odd = instance("odd", 5.0, 1.0);
        odd.geometry.image_orientation = [0.0, 1.0, 0.0, 0.0, 0.0, -1.0];
        let series = series(vec![instance("a", 0.0, 1.0), odd]);
        match VolumeAssembler::default().assemble(&series).unwrap_err() {
            HippoError::Geometry { instance_uids, .. } => assert_eq!(instance_uids, vec!["odd"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_matrix_size_mismatch() {
        let mut odd = instance("odd", 5.0, 1.0);
        odd.pixels = Array2::zeros((3, 2));
        let series = series(vec![instance("a", 0.0, 1.0), odd]);
        assert!(VolumeAssembler::default().assemble(&series).is_err());
    }

    #[test]
    fn test_median_spacing_with_gap() {
        let series = series(vec![
            instance("a", 0.0, 0.0),
            instance("b", 2.0, 0.0),
            instance("c", 4.0, 0.0),
            instance("d", 10.0, 0.0),
        ]);
        let volume = VolumeAssembler::default().assemble(&series).unwrap();
        assert_eq!(volume.spacing.slice, 2.0);
        assert_eq!(volume.slice_gaps, vec![2.0, 2.0, 6.0]);
        assert!(!volume.has_uniform_gaps(0.1));
    }

    #[test]
    fn test_single_slice_uses_thickness() {
        let series = series(vec![instance("a", 0.0, 0.0)]);
        let volume = VolumeAssembler::default().assemble(&series).unwrap();
        assert_eq!(volume.spacing.slice, 2.5);
        assert!(volume.slice_gaps.is_empty());
    }

    #[test]
    fn test_empty_series_fails() {
        assert!(VolumeAssembler::default().assemble(&series(vec![])).is_err());
    }
}
