//! Named float32 tensors loaded from a safetensors file.
//!
//! The file is memory-mapped and each F32 tensor is copied out once into an
//! `ndarray::ArrayD`. Consumers pull tensors by name with an expected shape so
//! a model either gets every tensor it needs or fails before construction.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use ndarray::{ArrayD, IxDyn};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use tracing::{debug, info};

use glance_core::config::ModelConfig;

use crate::error::VisionError;

/// A bag of named float32 tensors.
#[derive(Debug, Clone, Default)]
pub struct TensorMap {
    tensors: HashMap<String, ArrayD<f32>>,
}

impl TensorMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every F32 tensor from a safetensors file.
    ///
    /// Tensors of other dtypes are skipped with a debug log; a model that
    /// needs one of them will report it as missing.
    pub fn from_safetensors(path: &Path) -> Result<Self, VisionError> {
        if !path.exists() {
            return Err(VisionError::WeightFile(format!(
                "weights not found at {}",
                path.display()
            )));
        }

        let file = File::open(path)
            .map_err(|e| VisionError::WeightFile(format!("{}: {}", path.display(), e)))?;
        // SAFETY: the mapping is read-only and dropped before this function
        // returns; every tensor is copied into owned memory.
        let mmap = unsafe { Mmap::map(&file) }
            .map_err(|e| VisionError::WeightFile(format!("mmap {}: {}", path.display(), e)))?;

        let parsed = SafeTensors::deserialize(&mmap[..])
            .map_err(|e| VisionError::WeightFile(format!("safetensors parse: {}", e)))?;

        let mut map = Self::new();
        for (name, view) in parsed.tensors() {
            if view.dtype() != Dtype::F32 {
                debug!(tensor = %name, dtype = ?view.dtype(), "Skipping non-f32 tensor");
                continue;
            }
            let values: Vec<f32> = view
                .data()
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            let array = ArrayD::from_shape_vec(IxDyn(view.shape()), values)
                .map_err(|e| VisionError::WeightFile(format!("{}: {}", name, e)))?;
            map.insert(name, array);
        }

        info!(
            path = %path.display(),
            tensors = map.len(),
            "Loaded safetensors weights"
        );
        Ok(map)
    }

    /// Write all tensors to a safetensors file.
    pub fn save_safetensors(&self, path: &Path) -> Result<(), VisionError> {
        let encoded: Vec<(String, Vec<usize>, Vec<u8>)> = self
            .tensors
            .iter()
            .map(|(name, array)| {
                let bytes = array.iter().flat_map(|v| v.to_le_bytes()).collect();
                (name.clone(), array.shape().to_vec(), bytes)
            })
            .collect();

        let mut views = Vec::with_capacity(encoded.len());
        for (name, shape, bytes) in &encoded {
            let view = TensorView::new(Dtype::F32, shape.clone(), bytes)
                .map_err(|e| VisionError::WeightFile(format!("{}: {}", name, e)))?;
            views.push((name.clone(), view));
        }

        let serialized = safetensors::serialize(views, &None)
            .map_err(|e| VisionError::WeightFile(format!("serialize: {}", e)))?;
        std::fs::write(path, serialized)
            .map_err(|e| VisionError::WeightFile(format!("{}: {}", path.display(), e)))?;
        Ok(())
    }

    /// Deterministic pseudo-random weights in the DINOv2 tensor layout.
    ///
    /// Lets the full forward pass run without a real checkpoint. The stored
    /// positional encoding covers a `reference_grid x reference_grid` patch
    /// grid and the MLP is `mlp_ratio` times the hidden size.
    pub fn random_init(
        config: &ModelConfig,
        reference_grid: usize,
        mlp_ratio: usize,
        seed: u64,
    ) -> Self {
        let d = config.hidden_size;
        let (c, p) = (config.channels, config.patch_size);
        let mlp = d * mlp_ratio.max(1);
        let mut rng = SplitMix64(seed);
        let mut map = Self::new();

        let mut put = |map: &mut Self, name: String, shape: &[usize], scale: f32, offset: f32| {
            let len: usize = shape.iter().product();
            let values = (0..len).map(|_| offset + scale * rng.next_signed()).collect();
            // Shape and length agree by construction.
            if let Ok(array) = ArrayD::from_shape_vec(IxDyn(shape), values) {
                map.insert(name, array);
            }
        };

        put(&mut map, "embeddings.cls_token".into(), &[1, 1, d], 0.5, 0.0);
        put(
            &mut map,
            "embeddings.position_embeddings".into(),
            &[1, reference_grid * reference_grid + 1, d],
            0.5,
            0.0,
        );
        put(
            &mut map,
            "embeddings.patch_embeddings.projection.weight".into(),
            &[d, c, p, p],
            0.05,
            0.0,
        );
        put(&mut map, "embeddings.patch_embeddings.projection.bias".into(), &[d], 0.1, 0.0);

        for i in 0..config.num_layers {
            let pre = format!("encoder.layer.{i}");
            for norm in ["norm1", "norm2"] {
                put(&mut map, format!("{pre}.{norm}.weight"), &[d], 0.1, 1.0);
                put(&mut map, format!("{pre}.{norm}.bias"), &[d], 0.1, 0.0);
            }
            for proj in ["query", "key", "value"] {
                put(&mut map, format!("{pre}.attention.attention.{proj}.weight"), &[d, d], 0.3, 0.0);
                put(&mut map, format!("{pre}.attention.attention.{proj}.bias"), &[d], 0.1, 0.0);
            }
            put(&mut map, format!("{pre}.attention.output.dense.weight"), &[d, d], 0.3, 0.0);
            put(&mut map, format!("{pre}.attention.output.dense.bias"), &[d], 0.1, 0.0);
            put(&mut map, format!("{pre}.layer_scale1.lambda1"), &[d], 0.05, 0.1);
            put(&mut map, format!("{pre}.mlp.fc1.weight"), &[mlp, d], 0.3, 0.0);
            put(&mut map, format!("{pre}.mlp.fc1.bias"), &[mlp], 0.1, 0.0);
            put(&mut map, format!("{pre}.mlp.fc2.weight"), &[d, mlp], 0.3, 0.0);
            put(&mut map, format!("{pre}.mlp.fc2.bias"), &[d], 0.1, 0.0);
            put(&mut map, format!("{pre}.layer_scale2.lambda1"), &[d], 0.05, 0.1);
        }

        put(&mut map, "layernorm.weight".into(), &[d], 0.1, 1.0);
        put(&mut map, "layernorm.bias".into(), &[d], 0.1, 0.0);
        map
    }

    pub fn insert(&mut self, name: impl Into<String>, array: ArrayD<f32>) {
        self.tensors.insert(name.into(), array);
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.tensors.get(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Fetch a tensor and check its shape.
    ///
    /// A tensor with the same element count but a different rank (for example
    /// a `(1, 1, D)` class token requested as `(1, D)`) is reshaped.
    pub fn require(&self, name: &str, expected: &[usize]) -> Result<ArrayD<f32>, VisionError> {
        let array = self
            .tensors
            .get(name)
            .ok_or_else(|| VisionError::MissingWeight(name.to_string()))?;

        if array.shape() == expected {
            return Ok(array.clone());
        }

        let squeezed_actual: Vec<usize> =
            array.shape().iter().copied().filter(|&d| d != 1).collect();
        let squeezed_expected: Vec<usize> = expected.iter().copied().filter(|&d| d != 1).collect();
        if squeezed_actual == squeezed_expected {
            let values: Vec<f32> = array.iter().copied().collect();
            return ArrayD::from_shape_vec(IxDyn(expected), values).map_err(|_| {
                VisionError::ShapeMismatch {
                    name: name.to_string(),
                    expected: expected.to_vec(),
                    actual: array.shape().to_vec(),
                }
            });
        }

        Err(VisionError::ShapeMismatch {
            name: name.to_string(),
            expected: expected.to_vec(),
            actual: array.shape().to_vec(),
        })
    }
}

/// SplitMix64 generator for reproducible synthetic weights.
struct SplitMix64(u64);

impl SplitMix64 {
    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Uniform in [-1, 1).
    fn next_signed(&mut self) -> f32 {
        let unit = (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32;
        unit * 2.0 - 1.0
    }
}
