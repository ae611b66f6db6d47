//! 三维体数据与分割掩码

use ndarray::{Array3, ArrayView3};

/// 体素物理尺寸（毫米），顺序与数组轴一致
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoxelSpacing {
    pub slice: f64,
    pub row: f64,
    pub column: f64,
}

impl VoxelSpacing {
    pub fn new(slice: f64, row: f64, column: f64) -> Self {
        Self { slice, row, column }
    }

    /// 单个体素的体积（立方毫米）
    pub fn voxel_volume(&self) -> f64 {
        self.slice * self.row * self.column
    }

    pub fn as_array(&self) -> [f64; 3] {
        [self.slice, self.row, self.column]
    }
}

/// 由单个序列重建的三维体数据，形状为 (slices, rows, columns)
#[derive(Debug, Clone)]
pub struct Volume {
    pub data: Array3<f32>,
    pub spacing: VoxelSpacing,
    /// 排序后各切片在法向上的投影位置
    pub slice_positions: Vec<f64>,
    /// 相邻切片之间的实际间距，长度为 slices - 1
    pub slice_gaps: Vec<f64>,
    /// 排序后的实例 UID
    pub instance_uids: Vec<String>,
    pub series_uid: String,
}

impl Volume {
    /// 体数据维度 (slices, rows, columns)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    /// 切片间距是否均匀（在给定相对容差内）
    pub fn has_uniform_gaps(&self, relative_tolerance: f64) -> bool {
        self.slice_gaps
            .iter()
            .all(|gap| (gap - self.spacing.slice).abs() <= self.spacing.slice * relative_tolerance)
    }
}

/// 分割掩码，整数标签，形状与体数据一致
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationMask {
    pub labels: Array3<u8>,
}

impl SegmentationMask {
    pub fn new(labels: Array3<u8>) -> Self {
        Self { labels }
    }

    pub fn dim(&self) -> (usize, usize, usize) {
        self.labels.dim()
    }

    /// 掩码中出现的最大标签值
    pub fn max_label(&self) -> u8 {
        self.labels.iter().copied().max().unwrap_or(0)
    }

    /// 指定标签的体素数量
    pub fn count(&self, label: u8) -> u64 {
        self.labels.iter().filter(|&&v| v == label).count() as u64
    }

    /// 非零标签的体素数量
    pub fn foreground_count(&self) -> u64 {
        self.labels.iter().filter(|&&v| v != 0).count() as u64
    }
}
