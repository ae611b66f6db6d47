//! ONNX 二维 U-Net 分割模型
//!
//! 体数据按最大值归一化到 [0, 1]，逐切片补零到至少 `patch_size` 边长后
//! 前向推理 `[1, 1, H, W] -> [1, C, H, W]`，按类别取最大值，再裁回原尺寸。

use crate::inference::SegmentationModel;
use hippo_core::{HippoError, Result};
use ndarray::{s, Array2, Array3, Array4, ArrayView2, ArrayView3, ArrayView4};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

pub struct OnnxUNetModel {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    patch_size: usize,
    model_path: PathBuf,
    name: String,
    version: String,
}

impl std::fmt::Debug for OnnxUNetModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxUNetModel")
            .field("model_path", &self.model_path)
            .field("input_name", &self.input_name)
            .field("output_name", &self.output_name)
            .field("patch_size", &self.patch_size)
            .finish()
    }
}

fn load_error(path: &Path, e: impl std::fmt::Display) -> HippoError {
    HippoError::Config(format!("加载ONNX模型 {:?} 失败: {}", path, e))
}

impl OnnxUNetModel {
    /// 从文件加载模型
    pub fn load(model_path: impl AsRef<Path>, patch_size: usize) -> Result<Self> {
        let path = model_path.as_ref();
        let session = Session::builder()
            .and_then(|builder| builder.commit_from_file(path))
            .map_err(|e| load_error(path, e))?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| load_error(path, "模型没有输入"))?;
        let output_name = session
            .outputs
            .first()
            .map(|output| output.name.clone())
            .ok_or_else(|| load_error(path, "模型没有输出"))?;

        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unet".to_string());

        info!(
            "已加载ONNX模型 {:?}: 输入 {} 输出 {} patch {}",
            path, input_name, output_name, patch_size
        );

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
            patch_size,
            model_path: path.to_path_buf(),
            name,
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    /// 单张切片推理，返回与输入同尺寸的标签
    fn segment_slice(&self, slice: ArrayView2<'_, f32>, scale: f32) -> Result<Array2<u8>> {
        let (rows, columns) = slice.dim();
        let height = rows.max(self.patch_size);
        let width = columns.max(self.patch_size);

        let mut input = Array4::<f32>::zeros((1, 1, height, width));
        input
            .slice_mut(s![0, 0, ..rows, ..columns])
            .assign(&slice.mapv(|v| v * scale));

        let inference_error = |what: &str, e: &dyn std::fmt::Display| {
            HippoError::InferenceContract(format!("{}: {}", what, e))
        };

        let tensor = TensorRef::from_array_view(input.view())
            .map_err(|e| inference_error("输入张量转换失败", &e))?;
        let inputs = ort::inputs![self.input_name.as_str() => tensor];

        let mut session = self
            .session
            .lock()
            .map_err(|_| HippoError::Internal("ONNX会话锁已中毒".to_string()))?;
        let outputs = session
            .run(inputs)
            .map_err(|e| inference_error("前向推理失败", &e))?;

        let (shape, data) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| inference_error("输出张量提取失败", &e))?;

        if shape.len() != 4 || shape[0] != 1 {
            return Err(HippoError::InferenceContract(format!(
                "输出形状应为 [1, C, H, W]，实际 {:?}",
                shape
            )));
        }
        let dims = (1, shape[1] as usize, shape[2] as usize, shape[3] as usize);
        if dims.2 < rows || dims.3 < columns {
            return Err(HippoError::InferenceContract(format!(
                "输出尺寸 {:?} 小于切片尺寸 ({}, {})",
                shape, rows, columns
            )));
        }
        let logits = ArrayView4::from_shape(dims, data)
            .map_err(|e| inference_error("输出形状不匹配", &e))?;

        // 逐像素取得分最高的类别
        let labels = Array2::from_shape_fn((rows, columns), |(r, c)| {
            let mut best = 0usize;
            let mut best_score = f32::NEG_INFINITY;
            for class in 0..dims.1 {
                let score = logits[[0, class, r, c]];
                if score > best_score {
                    best_score = score;
                    best = class;
                }
            }
            u8::try_from(best).unwrap_or(u8::MAX)
        });

        Ok(labels)
    }
}

impl SegmentationModel for OnnxUNetModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn segment(&self, volume: ArrayView3<'_, f32>) -> Result<Array3<u8>> {
        let max = volume.iter().copied().fold(0.0f32, f32::max);
        let scale = if max > 0.0 { 1.0 / max } else { 0.0 };
        debug!("ONNX推理: 形状 {:?}, 最大强度 {}", volume.dim(), max);

        let mut mask = Array3::<u8>::zeros(volume.dim());
        for (index, slice) in volume.outer_iter().enumerate() {
            let labels = self.segment_slice(slice, scale)?;
            mask.slice_mut(s![index, .., ..]).assign(&labels);
        }
        Ok(mask)
    }
}
