//! Reference vision-transformer forward pass (DINOv2 layout) on ndarray.
//!
//! Pipeline: patch embedding + class token → positional encoding (interpolated
//! when the patch grid differs from the stored reference grid) → N transformer
//! blocks with layer-scale → final LayerNorm → class-token row.
//!
//! All arithmetic is float32. The model is immutable after construction and
//! `forward` takes `&self`, so one instance can serve any number of callers.

use std::borrow::Cow;

use ndarray::{s, Array1, Array2, Array4, ArrayView2, Axis};
use tracing::info;

use glance_core::config::{expand_home, ModelConfig};

use crate::error::VisionError;
use crate::weights::TensorMap;

// ---------------------------------------------------------------------------
// Layers
// ---------------------------------------------------------------------------

/// Dense layer `y = x W^T + b` with `W` stored pre-transposed as (in, out).
#[derive(Debug, Clone)]
struct Linear {
    weight_t: Array2<f32>,
    bias: Array1<f32>,
}

impl Linear {
    fn load(
        tensors: &TensorMap,
        prefix: &str,
        out_dim: usize,
        in_dim: usize,
    ) -> Result<Self, VisionError> {
        let weight = into_2d(
            tensors.require(&format!("{prefix}.weight"), &[out_dim, in_dim])?,
            &format!("{prefix}.weight"),
        )?;
        let bias = into_1d(
            tensors.require(&format!("{prefix}.bias"), &[out_dim])?,
            &format!("{prefix}.bias"),
        )?;
        Ok(Self {
            weight_t: weight.t().as_standard_layout().into_owned(),
            bias,
        })
    }

    fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        x.dot(&self.weight_t) + &self.bias
    }
}

#[derive(Debug, Clone)]
struct LayerNorm {
    weight: Array1<f32>,
    bias: Array1<f32>,
    eps: f32,
}

impl LayerNorm {
    fn load(tensors: &TensorMap, prefix: &str, dim: usize, eps: f32) -> Result<Self, VisionError> {
        Ok(Self {
            weight: load_vector(tensors, &format!("{prefix}.weight"), dim)?,
            bias: load_vector(tensors, &format!("{prefix}.bias"), dim)?,
            eps,
        })
    }

    /// Normalize each row with population variance.
    fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut out = x.clone();
        for mut row in out.rows_mut() {
            let n = row.len() as f32;
            let mean = row.sum() / n;
            let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
            let denom = (var + self.eps).sqrt();
            for ((v, w), b) in row.iter_mut().zip(self.weight.iter()).zip(self.bias.iter()) {
                *v = (*v - mean) / denom * w + b;
            }
        }
        out
    }
}

/// Multi-head self-attention without masking.
#[derive(Debug, Clone)]
struct Attention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(tensors: &TensorMap, prefix: &str, config: &ModelConfig) -> Result<Self, VisionError> {
        let d = config.hidden_size;
        Ok(Self {
            query: Linear::load(tensors, &format!("{prefix}.attention.query"), d, d)?,
            key: Linear::load(tensors, &format!("{prefix}.attention.key"), d, d)?,
            value: Linear::load(tensors, &format!("{prefix}.attention.value"), d, d)?,
            output: Linear::load(tensors, &format!("{prefix}.output.dense"), d, d)?,
            num_heads: config.num_heads,
            head_dim: d / config.num_heads,
        })
    }

    fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let q = self.query.forward(x);
        let k = self.key.forward(x);
        let v = self.value.forward(x);

        let scale = 1.0f32 / (self.head_dim as f32).sqrt();
        let mut merged = Array2::<f32>::zeros(q.raw_dim());

        for h in 0..self.num_heads {
            let (start, end) = (h * self.head_dim, (h + 1) * self.head_dim);
            let qh = q.slice(s![.., start..end]);
            let kh = k.slice(s![.., start..end]);
            let vh = v.slice(s![.., start..end]);

            let mut scores = qh.dot(&kh.t());
            scores.mapv_inplace(|s| s * scale);
            softmax_rows(&mut scores);

            merged.slice_mut(s![.., start..end]).assign(&scores.dot(&vh));
        }

        self.output.forward(&merged)
    }
}

#[derive(Debug, Clone)]
struct Mlp {
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut hidden = self.fc1.forward(x);
        hidden.mapv_inplace(gelu);
        self.fc2.forward(&hidden)
    }
}

#[derive(Debug, Clone)]
struct TransformerBlock {
    norm1: LayerNorm,
    attention: Attention,
    scale1: Array1<f32>,
    norm2: LayerNorm,
    mlp: Mlp,
    scale2: Array1<f32>,
}

impl TransformerBlock {
    fn load(tensors: &TensorMap, idx: usize, config: &ModelConfig) -> Result<Self, VisionError> {
        let prefix = format!("encoder.layer.{idx}");
        let d = config.hidden_size;
        let eps = config.layer_norm_eps;

        // The MLP width is read from the checkpoint rather than configured.
        let fc1_name = format!("{prefix}.mlp.fc1.weight");
        let mlp_dim = tensors
            .get(&fc1_name)
            .and_then(|w| w.shape().first().copied())
            .ok_or_else(|| VisionError::MissingWeight(fc1_name.clone()))?;

        Ok(Self {
            norm1: LayerNorm::load(tensors, &format!("{prefix}.norm1"), d, eps)?,
            attention: Attention::load(tensors, &format!("{prefix}.attention"), config)?,
            scale1: load_vector(tensors, &format!("{prefix}.layer_scale1.lambda1"), d)?,
            norm2: LayerNorm::load(tensors, &format!("{prefix}.norm2"), d, eps)?,
            mlp: Mlp {
                fc1: Linear::load(tensors, &format!("{prefix}.mlp.fc1"), mlp_dim, d)?,
                fc2: Linear::load(tensors, &format!("{prefix}.mlp.fc2"), d, mlp_dim)?,
            },
            scale2: load_vector(tensors, &format!("{prefix}.layer_scale2.lambda1"), d)?,
        })
    }

    fn forward(&self, x: Array2<f32>) -> Array2<f32> {
        let attended = self.attention.forward(&self.norm1.forward(&x)) * &self.scale1;
        let x = x + attended;
        let fed = self.mlp.forward(&self.norm2.forward(&x)) * &self.scale2;
        x + fed
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// DINOv2-style vision transformer evaluated with plain ndarray math.
#[derive(Debug, Clone)]
pub struct VitModel {
    config: ModelConfig,
    cls_token: Array1<f32>,
    /// Stored positional encoding, (reference_grid^2 + 1, D), class row first.
    position_embeddings: Array2<f32>,
    reference_grid: usize,
    /// Patch projection pre-transposed to (C * p * p, D).
    patch_weight_t: Array2<f32>,
    patch_bias: Array1<f32>,
    blocks: Vec<TransformerBlock>,
    norm: LayerNorm,
}

impl VitModel {
    /// Load weights from the safetensors file named in the config.
    pub fn load(config: &ModelConfig) -> Result<Self, VisionError> {
        let path = expand_home(&config.weights_path);
        let tensors = TensorMap::from_safetensors(&path)?;
        let model = Self::from_tensors(config, &tensors)?;
        info!(
            weights = %path.display(),
            hidden = config.hidden_size,
            layers = config.num_layers,
            reference_grid = model.reference_grid,
            "Reference ViT engine loaded"
        );
        Ok(model)
    }

    /// Build the model from an in-memory tensor map.
    ///
    /// Every required tensor is validated before the model exists, so a
    /// missing or mis-shaped tensor yields an error and no model.
    pub fn from_tensors(config: &ModelConfig, tensors: &TensorMap) -> Result<Self, VisionError> {
        config.validate()?;
        let d = config.hidden_size;
        let p = config.patch_size;
        let c = config.channels;

        let cls_token = load_vector(tensors, "embeddings.cls_token", d)?;

        let pos_name = "embeddings.position_embeddings";
        let pos = tensors
            .get(pos_name)
            .ok_or_else(|| VisionError::MissingWeight(pos_name.to_string()))?;
        let pos_shape = pos.shape().to_vec();
        let rows = match pos_shape.as_slice() {
            [1, n, dim] | [n, dim] if *dim == d && *n >= 2 => *n,
            _ => {
                return Err(VisionError::ShapeMismatch {
                    name: pos_name.to_string(),
                    expected: vec![1, 0, d],
                    actual: pos_shape,
                })
            }
        };
        let reference_grid = (((rows - 1) as f64).sqrt()).round() as usize;
        if reference_grid * reference_grid != rows - 1 {
            return Err(VisionError::ModelLoad(format!(
                "position embeddings cover {} patches, which is not a square grid",
                rows - 1
            )));
        }
        let position_embeddings = into_2d(tensors.require(pos_name, &[rows, d])?, pos_name)?;

        let proj_name = "embeddings.patch_embeddings.projection.weight";
        let projection = tensors.require(proj_name, &[d, c, p, p])?;
        let flat: Vec<f32> = projection.iter().copied().collect();
        let patch_weight = Array2::from_shape_vec((d, c * p * p), flat)
            .map_err(|e| VisionError::ModelLoad(format!("{proj_name}: {e}")))?;
        let patch_bias = load_vector(tensors, "embeddings.patch_embeddings.projection.bias", d)?;

        let blocks = (0..config.num_layers)
            .map(|i| TransformerBlock::load(tensors, i, config))
            .collect::<Result<Vec<_>, _>>()?;

        let norm = LayerNorm::load(tensors, "layernorm", d, config.layer_norm_eps)?;

        Ok(Self {
            config: config.clone(),
            cls_token,
            position_embeddings,
            reference_grid,
            patch_weight_t: patch_weight.t().as_standard_layout().into_owned(),
            patch_bias,
            blocks,
            norm,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    /// Side length of the patch grid the stored positional encoding covers.
    pub fn reference_grid(&self) -> usize {
        self.reference_grid
    }

    /// Run the forward pass on a (1, C, H, W) tensor; returns (1, D).
    pub fn forward(&self, input: &Array4<f32>) -> Result<Array2<f32>, VisionError> {
        let (batch, channels, height, width) = input.dim();
        let p = self.config.patch_size;
        if batch != 1 || channels != self.config.channels {
            return Err(VisionError::InvalidInput(format!(
                "expected shape (1, {}, H, W), got {:?}",
                self.config.channels,
                input.shape()
            )));
        }
        if height == 0 || width == 0 || height % p != 0 || width % p != 0 {
            return Err(VisionError::InvalidInput(format!(
                "spatial size {}x{} is not a positive multiple of patch size {}",
                height, width, p
            )));
        }

        let (grid_h, grid_w) = (height / p, width / p);
        let mut sequence = self.embed_patches(input, grid_h, grid_w)?;
        sequence += &*self.position_encoding(grid_h, grid_w);

        for block in &self.blocks {
            sequence = block.forward(sequence);
        }

        let normed = self.norm.forward(&sequence);
        Ok(normed.slice(s![0..1, ..]).to_owned())
    }

    /// Project non-overlapping patches and prepend the class token.
    fn embed_patches(
        &self,
        input: &Array4<f32>,
        grid_h: usize,
        grid_w: usize,
    ) -> Result<Array2<f32>, VisionError> {
        let p = self.config.patch_size;
        let c = self.config.channels;
        let patch_dim = c * p * p;

        let mut patches = Array2::<f32>::zeros((grid_h * grid_w, patch_dim));
        for i in 0..grid_h {
            for j in 0..grid_w {
                let mut row = patches.row_mut(i * grid_w + j);
                for ch in 0..c {
                    for dy in 0..p {
                        for dx in 0..p {
                            row[ch * p * p + dy * p + dx] = input[[0, ch, i * p + dy, j * p + dx]];
                        }
                    }
                }
            }
        }

        let projected = patches.dot(&self.patch_weight_t) + &self.patch_bias;
        let cls = self.cls_token.view().insert_axis(Axis(0));
        ndarray::concatenate(Axis(0), &[cls, projected.view()])
            .map_err(|e| VisionError::Inference(format!("token sequence: {e}")))
    }

    /// Positional encoding for a `grid_h x grid_w` patch grid.
    ///
    /// Returns the stored encoding untouched when the grid matches the
    /// reference grid; otherwise interpolates the patch rows and keeps the
    /// class-token row as stored.
    pub fn position_encoding(&self, grid_h: usize, grid_w: usize) -> Cow<'_, Array2<f32>> {
        if grid_h == self.reference_grid && grid_w == self.reference_grid {
            return Cow::Borrowed(&self.position_embeddings);
        }

        let cls = self.position_embeddings.slice(s![0..1, ..]);
        let patch_pos = self.position_embeddings.slice(s![1.., ..]);
        let resized = interpolate_grid(patch_pos, self.reference_grid, grid_h, grid_w);

        let mut out = Array2::<f32>::zeros((grid_h * grid_w + 1, self.config.hidden_size));
        out.slice_mut(s![0..1, ..]).assign(&cls);
        out.slice_mut(s![1.., ..]).assign(&resized);
        Cow::Owned(out)
    }
}

// ---------------------------------------------------------------------------
// Math helpers
// ---------------------------------------------------------------------------

/// GELU, tanh approximation, in float32.
pub fn gelu(x: f32) -> f32 {
    const K: f32 = 0.797_884_6; // sqrt(2 / pi)
    0.5 * x * (1.0 + (K * (x + 0.044_715 * x * x * x)).tanh())
}

/// Numerically stable softmax over each row.
fn softmax_rows(x: &mut Array2<f32>) {
    for mut row in x.rows_mut() {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
}

/// Bilinear (order-1) resampling of a square grid of D-vectors.
///
/// `src` holds `old * old` rows in row-major grid order. Sampling aligns the
/// corner cells of both grids, so the four corners are copied exactly.
pub fn interpolate_grid(
    src: ArrayView2<'_, f32>,
    old: usize,
    new_h: usize,
    new_w: usize,
) -> Array2<f32> {
    let dim = src.ncols();
    let mut out = Array2::<f32>::zeros((new_h * new_w, dim));

    let coord = |o: usize, new: usize| -> f64 {
        if new <= 1 || old <= 1 {
            0.0
        } else {
            o as f64 * (old - 1) as f64 / (new - 1) as f64
        }
    };

    for y in 0..new_h {
        let sy = coord(y, new_h);
        let y0 = (sy.floor() as usize).min(old - 1);
        let y1 = (y0 + 1).min(old - 1);
        let fy = sy - y0 as f64;

        for x in 0..new_w {
            let sx = coord(x, new_w);
            let x0 = (sx.floor() as usize).min(old - 1);
            let x1 = (x0 + 1).min(old - 1);
            let fx = sx - x0 as f64;

            let (r00, r01) = (src.row(y0 * old + x0), src.row(y0 * old + x1));
            let (r10, r11) = (src.row(y1 * old + x0), src.row(y1 * old + x1));
            let mut dst = out.row_mut(y * new_w + x);
            for d in 0..dim {
                let top = (1.0 - fx) * r00[d] as f64 + fx * r01[d] as f64;
                let bottom = (1.0 - fx) * r10[d] as f64 + fx * r11[d] as f64;
                dst[d] = ((1.0 - fy) * top + fy * bottom) as f32;
            }
        }
    }
    out
}

fn load_vector(tensors: &TensorMap, name: &str, len: usize) -> Result<Array1<f32>, VisionError> {
    into_1d(tensors.require(name, &[len])?, name)
}

fn into_1d(array: ndarray::ArrayD<f32>, name: &str) -> Result<Array1<f32>, VisionError> {
    array
        .into_dimensionality()
        .map_err(|e| VisionError::ModelLoad(format!("{name}: {e}")))
}

fn into_2d(array: ndarray::ArrayD<f32>, name: &str) -> Result<Array2<f32>, VisionError> {
    array
        .into_dimensionality()
        .map_err(|e| VisionError::ModelLoad(format!("{name}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            image_size: 28,
            patch_size: 14,
            hidden_size: 8,
            num_heads: 2,
            num_layers: 2,
            ..ModelConfig::default()
        }
    }

    fn tiny_model(reference_grid: usize) -> VitModel {
        let config = tiny_config();
        let tensors = TensorMap::random_init(&config, reference_grid, 4, 7);
        VitModel::from_tensors(&config, &tensors).unwrap()
    }

    fn test_input(config: &ModelConfig, seed: f32) -> Array4<f32> {
        let s = config.image_size;
        Array4::from_shape_fn((1, 3, s, s), |(_, c, y, x)| {
            ((c * 31 + y * 7 + x) as f32 * 0.01 + seed).sin()
        })
    }

    #[test]
    fn test_forward_shape_and_finite() {
        let model = tiny_model(2);
        let out = model.forward(&test_input(model.config(), 0.0)).unwrap();
        assert_eq!(out.shape(), &[1, 8]);
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_forward_is_deterministic() {
        let model = tiny_model(2);
        let input = test_input(model.config(), 0.3);
        let a = model.forward(&input).unwrap();
        let b = model.forward(&input).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_forward_depends_on_input() {
        let model = tiny_model(2);
        let a = model.forward(&test_input(model.config(), 0.0)).unwrap();
        let b = model.forward(&test_input(model.config(), 1.0)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_forward_with_interpolated_positions() {
        // Reference grid 3x3, input grid 2x2.
        let model = tiny_model(3);
        let out = model.forward(&test_input(model.config(), 0.0)).unwrap();
        assert_eq!(out.shape(), &[1, 8]);
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_position_encoding_reused_when_grid_matches() {
        let config = ModelConfig {
            hidden_size: 8,
            num_heads: 2,
            num_layers: 1,
            ..ModelConfig::default()
        };
        let tensors = TensorMap::random_init(&config, 16, 2, 1);
        let model = VitModel::from_tensors(&config, &tensors).unwrap();

        let pos = model.position_encoding(16, 16);
        assert!(matches!(pos, Cow::Borrowed(_)));
        let stored = tensors
            .require("embeddings.position_embeddings", &[257, 8])
            .unwrap();
        assert_eq!(pos.as_slice().unwrap(), stored.as_slice().unwrap());
    }

    #[test]
    fn test_position_encoding_interpolated_keeps_cls_and_corners() {
        let model = tiny_model(3);
        let pos = model.position_encoding(5, 4);
        assert!(matches!(pos, Cow::Owned(_)));
        assert_eq!(pos.shape(), &[5 * 4 + 1, 8]);

        let stored = &model.position_embeddings;
        assert_eq!(pos.row(0), stored.row(0));
        // Corner-aligned sampling: grid corners map onto stored corners.
        assert_eq!(pos.row(1), stored.row(1));
        assert_eq!(pos.row(1 + 3), stored.row(1 + 2));
        assert_eq!(pos.row(1 + 4 * 4), stored.row(1 + 6));
        assert_eq!(pos.row(1 + 4 * 4 + 3), stored.row(1 + 8));
    }

    #[test]
    fn test_interpolate_grid_preserves_linear_field() {
        // Value at (y, x) = y + 10x on a 3x3 grid.
        let src = Array2::from_shape_fn((9, 1), |(i, _)| ((i / 3) + 10 * (i % 3)) as f32);
        let out = interpolate_grid(src.view(), 3, 5, 5);
        for y in 0..5 {
            for x in 0..5 {
                let expected = y as f32 * 0.5 + 10.0 * x as f32 * 0.5;
                assert!((out[[y * 5 + x, 0]] - expected).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_interpolate_grid_constant_field() {
        let src = Array2::from_elem((16, 3), 2.5f32);
        let out = interpolate_grid(src.view(), 4, 7, 2);
        assert_eq!(out.shape(), &[14, 3]);
        assert!(out.iter().all(|v| (*v - 2.5).abs() < 1e-6));
    }

    #[test]
    fn test_missing_weight_fails_construction() {
        let config = tiny_config();
        let full = TensorMap::random_init(&config, 2, 4, 7);
        let mut partial = TensorMap::new();
        for name in [
            "embeddings.cls_token",
            "embeddings.position_embeddings",
            "embeddings.patch_embeddings.projection.weight",
            "embeddings.patch_embeddings.projection.bias",
        ] {
            partial.insert(name, full.get(name).unwrap().clone());
        }
        let result = VitModel::from_tensors(&config, &partial);
        assert!(matches!(result, Err(VisionError::MissingWeight(_))));
    }

    #[test]
    fn test_shape_mismatch_fails_construction() {
        let config = tiny_config();
        let mut tensors = TensorMap::random_init(&config, 2, 4, 7);
        tensors.insert("layernorm.weight", ndarray::ArrayD::zeros(ndarray::IxDyn(&[5])));
        let result = VitModel::from_tensors(&config, &tensors);
        assert!(matches!(result, Err(VisionError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_non_square_reference_grid_rejected() {
        let config = tiny_config();
        let mut tensors = TensorMap::random_init(&config, 2, 4, 7);
        tensors.insert(
            "embeddings.position_embeddings",
            ndarray::ArrayD::zeros(ndarray::IxDyn(&[1, 6, 8])),
        );
        let result = VitModel::from_tensors(&config, &tensors);
        assert!(matches!(result, Err(VisionError::ModelLoad(_))));
    }

    #[test]
    fn test_invalid_input_shape() {
        let model = tiny_model(2);
        let wrong_channels = Array4::<f32>::zeros((1, 1, 28, 28));
        assert!(matches!(
            model.forward(&wrong_channels),
            Err(VisionError::InvalidInput(_))
        ));
        let not_divisible = Array4::<f32>::zeros((1, 3, 30, 28));
        assert!(matches!(
            model.forward(&not_divisible),
            Err(VisionError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_gelu_values() {
        assert_eq!(gelu(0.0), 0.0);
        assert!((gelu(1.0) - 0.841_192).abs() < 1e-5);
        assert!((gelu(-1.0) + 0.158_808).abs() < 1e-5);
        assert!(gelu(10.0) > 9.99);
    }

    #[test]
    fn test_layer_norm_unit_stats() {
        let ln = LayerNorm {
            weight: Array1::ones(4),
            bias: Array1::zeros(4),
            eps: 1e-6,
        };
        let x = Array2::from_shape_vec((1, 4), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let out = ln.forward(&x);
        let mean = out.sum() / 4.0;
        let var = out.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-6);
        assert!((var - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let mut x = Array2::from_shape_vec((2, 3), vec![1.0, 2.0, 3.0, 1000.0, 1000.0, 1000.0])
            .unwrap();
        softmax_rows(&mut x);
        for row in x.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
        assert!((x[[1, 0]] - 1.0 / 3.0).abs() < 1e-6);
    }
}
