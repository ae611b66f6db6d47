//! 报告构建
//!
//! 生成新的序列和实例 UID，记录源检查与源序列的引用、测量值和算法身份，
//! 并可选地渲染一页 RGB 报告图像。

use ab_glyph::FontVec;
use chrono::Utc;
use hippo_core::utils::generate_distinct_dicom_uid;
use hippo_core::{
    AlgorithmInfo, HippoError, ReferencedSeries, Report, ReportImage, Result, SegmentationMask,
    Series, Study, Volume, VolumeMeasurement,
};
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::drawing::draw_text_mut;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const TITLE_COLOR: Rgb<u8> = Rgb([255, 200, 0]);
/// 各标签的叠加颜色，按标签值循环使用
const LABEL_COLORS: [[u8; 3]; 3] = [[230, 60, 60], [60, 200, 90], [70, 130, 230]];
const TILE_SIZE: u32 = 400;

/// 常见的系统字体位置
const SYSTEM_FONT_PATHS: [&str; 4] = [
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

/// 报告参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// 算法名称，写入 Series Description 和 Manufacturer
    pub algorithm_name: String,
    /// 是否渲染报告页面
    pub render_image: bool,
    /// 报告页面边长（像素）
    pub page_size: u32,
    /// 字体文件；未配置或加载失败时尝试系统字体
    pub font_path: Option<PathBuf>,
    /// 每份报告在提交前另存一份到此目录
    pub output_dir: Option<PathBuf>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            algorithm_name: "HippoVolume.AI".to_string(),
            render_image: true,
            page_size: 1000,
            font_path: None,
            output_dir: None,
        }
    }
}

/// 报告构建器
pub struct ReportBuilder {
    config: ReportConfig,
    algorithm: AlgorithmInfo,
    font: Option<FontVec>,
}

impl std::fmt::Debug for ReportBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportBuilder")
            .field("config", &self.config)
            .field("algorithm", &self.algorithm)
            .field("font", &self.font.is_some())
            .finish()
    }
}

impl ReportBuilder {
    pub fn new(config: ReportConfig, model_name: &str, model_version: &str) -> Self {
        let font = if config.render_image {
            load_font(config.font_path.as_deref())
        } else {
            None
        };
        let algorithm = AlgorithmInfo {
            name: config.algorithm_name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            model_name: format!("{} {}", model_name, model_version),
        };
        Self {
            config,
            algorithm,
            font,
        }
    }

    pub fn config(&self) -> &ReportConfig {
        &self.config
    }

    pub fn algorithm(&self) -> &AlgorithmInfo {
        &self.algorithm
    }

    /// 构建报告
    pub fn build(
        &self,
        study: &Study,
        series: &Series,
        volume: &Volume,
        mask: &SegmentationMask,
        measurement: VolumeMeasurement,
    ) -> Result<Report> {
        if volume.series_uid != series.info.series_uid {
            return Err(HippoError::Report(format!(
                "体数据来自序列 {}，与引用序列 {} 不一致",
                volume.series_uid, series.info.series_uid
            )));
        }

        // 新 UID 不能与任何源标识符重复
        let mut existing: Vec<&str> = vec![study.study_uid()];
        for s in &study.series {
            existing.push(&s.info.series_uid);
            existing.extend(s.instances.iter().map(|i| i.sop_instance_uid.as_str()));
        }
        let series_instance_uid = generate_distinct_dicom_uid(existing.iter().copied());
        existing.push(&series_instance_uid);
        let sop_instance_uid = generate_distinct_dicom_uid(existing.iter().copied());

        let sop_class_uid = series
            .instances
            .first()
            .map(|i| i.sop_class_uid.clone())
            .unwrap_or_default();

        let referenced_series = ReferencedSeries {
            series_uid: series.info.series_uid.clone(),
            modality: series.info.modality.clone(),
            description: series.info.description.clone(),
            sop_class_uid,
            instance_uids: volume.instance_uids.clone(),
        };

        let summary_lines = self.summary_lines(study, series, &measurement);

        let image = if self.config.render_image {
            Some(self.render(&summary_lines, volume, mask)?)
        } else {
            None
        };

        let report = Report {
            sop_instance_uid,
            series_instance_uid,
            study: study.header.clone(),
            referenced_series,
            measurement,
            created_at: Utc::now(),
            algorithm: self.algorithm.clone(),
            summary_lines,
            image,
        };

        info!(
            "报告已构建: 检查 {} 报告实例 {}",
            report.study_uid(),
            report.sop_instance_uid
        );
        Ok(report)
    }

    fn summary_lines(
        &self,
        study: &Study,
        series: &Series,
        measurement: &VolumeMeasurement,
    ) -> Vec<String> {
        let header = &study.header;
        let or_unknown = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());

        let mut lines = vec![
            format!("{} hippocampal volume report", self.config.algorithm_name),
            format!("Patient ID: {}", or_unknown(&header.patient_id)),
            format!("Study: {}", or_unknown(&header.study_description)),
            format!("Series: {}", or_unknown(&series.info.description)),
            format!("Modality: {}", series.info.modality),
        ];
        for label in measurement.labels.iter().chain(std::iter::once(&measurement.total)) {
            lines.push(format!(
                "{} volume: {:.2} mm3 ({} voxels)",
                label.name, label.volume_mm3, label.voxel_count
            ));
        }
        lines.push(format!("Model: {}", self.algorithm.model_name));
        lines
    }

    /// 渲染报告页面：标题、测量文本、中间切片及其分割叠加
    fn render(
        &self,
        lines: &[String],
        volume: &Volume,
        mask: &SegmentationMask,
    ) -> Result<ReportImage> {
        let size = self.config.page_size;
        let mut page = RgbImage::new(size, size);

        if let Some(font) = &self.font {
            if let Some((title, rest)) = lines.split_first() {
                draw_text_mut(&mut page, TITLE_COLOR, 20, 20, 40.0, font, title);
                for (i, line) in rest.iter().enumerate() {
                    let y = 80 + i as i32 * 30;
                    draw_text_mut(&mut page, TEXT_COLOR, 20, y, 24.0, font, line);
                }
            }
        } else {
            debug!("没有可用字体，报告页面不包含文字");
        }

        let (slices, _, _) = volume.dim();
        if slices > 0 {
            let middle = slices / 2;
            let (base, overlay) = slice_tiles(volume, mask, middle);
            let top = i64::from(size.saturating_sub(TILE_SIZE + 50));
            imageops::overlay(&mut page, &base, 50, top);
            imageops::overlay(&mut page, &overlay, i64::from(TILE_SIZE) + 100, top);
        }

        Ok(ReportImage {
            width: size,
            height: size,
            rgb: page.into_raw(),
            burned_in_text: self.font.is_some(),
        })
    }
}

/// 生成指定切片的灰度图和带标签颜色的叠加图，均缩放到 TILE_SIZE
fn slice_tiles(volume: &Volume, mask: &SegmentationMask, index: usize) -> (RgbImage, RgbImage) {
    let slice = volume.data.index_axis(ndarray::Axis(0), index);
    let labels = mask.labels.index_axis(ndarray::Axis(0), index);
    let (rows, columns) = slice.dim();
    let max = slice.iter().copied().fold(0.0f32, f32::max);
    let scale = if max > 0.0 { 255.0 / max } else { 0.0 };

    let gray = GrayImage::from_fn(columns as u32, rows as u32, |x, y| {
        let v = slice[[y as usize, x as usize]] * scale;
        Luma([v.clamp(0.0, 255.0) as u8])
    });
    let overlay = RgbImage::from_fn(columns as u32, rows as u32, |x, y| {
        let Luma([v]) = *gray.get_pixel(x, y);
        match labels[[y as usize, x as usize]] {
            0 => Rgb([v, v, v]),
            label => {
                let color = LABEL_COLORS[(label as usize - 1) % LABEL_COLORS.len()];
                let blend = |c: u8| ((u16::from(c) + u16::from(v)) / 2) as u8;
                Rgb([blend(color[0]), blend(color[1]), blend(color[2])])
            }
        }
    });
    let base = image::DynamicImage::ImageLuma8(gray).to_rgb8();

    (
        imageops::resize(&base, TILE_SIZE, TILE_SIZE, FilterType::Nearest),
        imageops::resize(&overlay, TILE_SIZE, TILE_SIZE, FilterType::Nearest),
    )
}

/// 加载字体：优先使用配置的文件，其次尝试常见系统位置
fn load_font(configured: Option<&Path>) -> Option<FontVec> {
    if let Some(path) = configured {
        match std::fs::read(path).map(FontVec::try_from_vec) {
            Ok(Ok(font)) => {
                info!("已加载字体: {:?}", path);
                return Some(font);
            }
            _ => warn!("无法加载配置的字体 {:?}，尝试系统字体", path),
        }
    }

    for path in SYSTEM_FONT_PATHS {
        if let Ok(Ok(font)) = std::fs::read(path).map(FontVec::try_from_vec) {
            info!("已加载系统字体: {}", path);
            return Some(font);
        }
    }

    debug!("未找到系统字体，报告页面将不包含文字");
    None
}
