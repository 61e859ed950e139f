//! Accelerated inference through ONNX Runtime.
//!
//! Only compiled with the `onnx` feature. Without it, [`OnnxVit::new`] always
//! fails, which makes the backend selector fall back to the reference engine.

#[cfg(feature = "onnx")]
use std::path::Path;
#[cfg(feature = "onnx")]
use std::sync::Mutex;

use ndarray::{Array2, Array4};

use crate::error::VisionError;

/// Fixed input contract of the exported model.
pub const INPUT_SHAPE: [usize; 4] = [1, 3, 224, 224];

/// Provider names tried when the configuration lists none.
pub const DEFAULT_PROVIDERS: [&str; 3] = ["directml", "cuda", "cpu"];

/// Vision transformer exported to ONNX.
pub struct OnnxVit {
    #[cfg(feature = "onnx")]
    session: Mutex<ort::session::Session>,
    #[cfg(feature = "onnx")]
    input_name: String,
    #[cfg(feature = "onnx")]
    output_name: String,
    output_dim: usize,
}

// SAFETY: the session sits behind a Mutex and ONNX Runtime sessions may be
// driven from any thread; nothing else in the struct is shared.
unsafe impl Send for OnnxVit {}
unsafe impl Sync for OnnxVit {}

impl std::fmt::Debug for OnnxVit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxVit")
            .field("output_dim", &self.output_dim)
            .finish()
    }
}

/// Canonical provider names for the aliases accepted in configuration.
pub fn normalize_provider(name: &str) -> Option<&'static str> {
    match name.trim().to_ascii_lowercase().as_str() {
        "directml" | "dml" | "dmlexecutionprovider" => Some("directml"),
        "cuda" | "cudaexecutionprovider" => Some("cuda"),
        "cpu" | "cpuexecutionprovider" => Some("cpu"),
        _ => None,
    }
}

/// Resolve the configured provider list to canonical names, in priority order.
///
/// Unknown names are dropped; an empty result means the default order.
pub fn resolve_providers(configured: &[String]) -> Vec<&'static str> {
    let mut out: Vec<&'static str> = Vec::new();
    for name in configured {
        match normalize_provider(name) {
            Some(p) if !out.contains(&p) => out.push(p),
            Some(_) => {}
            None => tracing::warn!(provider = %name, "Ignoring unknown execution provider"),
        }
    }
    if out.is_empty() {
        out.extend(DEFAULT_PROVIDERS);
    }
    out
}

#[cfg(feature = "onnx")]
impl OnnxVit {
    /// Open the model and resolve its first input and output names.
    ///
    /// # Errors
    /// Returns `VisionError::ModelLoad` if the file is missing or the runtime
    /// rejects the model or every requested provider.
    pub fn new(
        model_path: &Path,
        providers: &[String],
        output_dim: usize,
    ) -> Result<Self, VisionError> {
        use ort::execution_providers::{
            CPUExecutionProvider, CUDAExecutionProvider, DirectMLExecutionProvider,
            ExecutionProviderDispatch,
        };

        if !model_path.exists() {
            return Err(VisionError::ModelLoad(format!(
                "ONNX model not found at {}",
                model_path.display()
            )));
        }

        let resolved = resolve_providers(providers);
        let dispatch: Vec<ExecutionProviderDispatch> = resolved
            .iter()
            .map(|p| match *p {
                "directml" => DirectMLExecutionProvider::default().build(),
                "cuda" => CUDAExecutionProvider::default().build(),
                _ => CPUExecutionProvider::default().build(),
            })
            .collect();

        let session = ort::session::Session::builder()
            .map_err(|e| VisionError::ModelLoad(format!("ONNX session builder: {}", e)))?
            .with_execution_providers(dispatch)
            .map_err(|e| VisionError::ModelLoad(format!("ONNX execution providers: {}", e)))?
            .commit_from_file(model_path)
            .map_err(|e| VisionError::ModelLoad(format!("ONNX load model: {}", e)))?;

        let input_name = session
            .inputs()
            .first()
            .map(|i| i.name().to_string())
            .ok_or_else(|| VisionError::ModelLoad("ONNX model declares no inputs".into()))?;
        let output_name = session
            .outputs()
            .first()
            .map(|o| o.name().to_string())
            .ok_or_else(|| VisionError::ModelLoad("ONNX model declares no outputs".into()))?;

        tracing::info!(
            model = %model_path.display(),
            providers = ?resolved,
            input = %input_name,
            output = %output_name,
            "Loaded ONNX vision model"
        );

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
            output_dim,
        })
    }

    /// Run the model on a (1, 3, 224, 224) tensor; returns (1, D).
    pub fn infer(&self, input: &Array4<f32>) -> Result<Array2<f32>, VisionError> {
        use ort::value::TensorRef;

        check_input(input)?;
        let tensor = TensorRef::from_array_view(input)
            .map_err(|e| VisionError::Inference(format!("TensorRef input: {}", e)))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| VisionError::Inference(format!("Session lock poisoned: {}", e)))?;
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => tensor])
            .map_err(|e| VisionError::Inference(format!("ONNX inference failed: {}", e)))?;

        let (shape, data) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| VisionError::Inference(format!("Extract output: {}", e)))?;

        let dims: Vec<i64> = shape.iter().copied().collect();
        if dims != [1, self.output_dim as i64] {
            return Err(VisionError::Inference(format!(
                "expected output shape [1, {}], got {:?}",
                self.output_dim, dims
            )));
        }

        Array2::from_shape_vec((1, self.output_dim), data.to_vec())
            .map_err(|e| VisionError::Inference(format!("output array: {}", e)))
    }
}

#[cfg(not(feature = "onnx"))]
impl OnnxVit {
    /// Stub constructor when the `onnx` feature is disabled.
    pub fn new(
        _model_path: &std::path::Path,
        _providers: &[String],
        _output_dim: usize,
    ) -> Result<Self, VisionError> {
        Err(VisionError::ModelLoad(
            "built without the `onnx` feature".to_string(),
        ))
    }

    pub fn infer(&self, input: &Array4<f32>) -> Result<Array2<f32>, VisionError> {
        check_input(input)?;
        Err(VisionError::Inference(
            "built without the `onnx` feature".to_string(),
        ))
    }
}

impl OnnxVit {
    pub fn output_dim(&self) -> usize {
        self.output_dim
    }
}

fn check_input(input: &Array4<f32>) -> Result<(), VisionError> {
    if input.shape() != INPUT_SHAPE {
        return Err(VisionError::InvalidInput(format!(
            "expected shape {:?}, got {:?}",
            INPUT_SHAPE,
            input.shape()
        )));
    }
    Ok(())
}
