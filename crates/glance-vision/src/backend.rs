//! Backend selection between the reference engine and ONNX Runtime.
//!
//! The choice is a pure function of [`ModelConfig`]. Loading happens lazily on
//! first use and is cached for the lifetime of the selector. A failed
//! accelerated load degrades to the reference engine and leaves a diagnostic
//! message behind; a failed reference load is returned to the caller and not
//! cached.

use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use ndarray::{Array2, Array4};
use tracing::{info, warn};

use glance_core::config::{expand_home, ModelConfig};

use crate::error::VisionError;
use crate::onnx::OnnxVit;
use crate::vit::VitModel;

/// Which engine actually serves inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Reference,
    Accelerated,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Reference => "reference",
            BackendKind::Accelerated => "accelerated",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The backend requested by configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendChoice {
    Reference,
    Accelerated {
        model_path: Option<PathBuf>,
        providers: Vec<String>,
    },
}

impl BackendChoice {
    pub fn from_config(config: &ModelConfig) -> Self {
        match config.backend.trim().to_ascii_lowercase().as_str() {
            "onnx" | "ort" | "onnxruntime" | "accelerated" => BackendChoice::Accelerated {
                model_path: config.onnx_model_path.as_deref().map(expand_home),
                providers: config.providers.clone(),
            },
            _ => BackendChoice::Reference,
        }
    }
}

/// A loaded inference engine.
#[derive(Debug)]
pub enum InferenceBackend {
    Reference(VitModel),
    Accelerated(OnnxVit),
}

impl InferenceBackend {
    /// Run the forward pass on a (1, 3, H, W) tensor; returns (1, D).
    pub fn infer(&self, input: &Array4<f32>) -> Result<Array2<f32>, VisionError> {
        match self {
            InferenceBackend::Reference(model) => model.forward(input),
            InferenceBackend::Accelerated(session) => session.infer(input),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            InferenceBackend::Reference(_) => BackendKind::Reference,
            InferenceBackend::Accelerated(_) => BackendKind::Accelerated,
        }
    }
}

/// Outcome of a backend load: the engine plus the reason for any fallback.
#[derive(Debug)]
pub struct Selection {
    pub backend: InferenceBackend,
    pub fallback: Option<String>,
}

impl Selection {
    /// Load the engine for `choice`.
    ///
    /// # Errors
    /// Only a reference-engine load failure is returned; accelerated failures
    /// become a fallback.
    pub fn load(choice: &BackendChoice, config: &ModelConfig) -> Result<Self, VisionError> {
        let fallback = match choice {
            BackendChoice::Reference => None,
            BackendChoice::Accelerated {
                model_path,
                providers,
            } => {
                let attempt = match model_path {
                    Some(path) => OnnxVit::new(path, providers, config.hidden_size),
                    None => Err(VisionError::ModelLoad(
                        "no ONNX model path configured".to_string(),
                    )),
                };
                match attempt {
                    Ok(session) => {
                        return Ok(Self {
                            backend: InferenceBackend::Accelerated(session),
                            fallback: None,
                        })
                    }
                    Err(e) => {
                        warn!(error = %e, "Accelerated backend unavailable, using reference engine");
                        Some(e.to_string())
                    }
                }
            }
        };

        let model = VitModel::load(config)?;
        Ok(Self {
            backend: InferenceBackend::Reference(model),
            fallback,
        })
    }
}

/// Lazily loads and caches one inference backend.
#[derive(Debug)]
pub struct BackendSelector {
    config: ModelConfig,
    backend: OnceLock<InferenceBackend>,
    init_lock: Mutex<()>,
    diagnostic: Mutex<Option<String>>,
}

impl BackendSelector {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            backend: OnceLock::new(),
            init_lock: Mutex::new(()),
            diagnostic: Mutex::new(None),
        }
    }

    /// Selector with an already-loaded backend.
    pub fn with_backend(config: ModelConfig, backend: InferenceBackend) -> Self {
        let selector = Self::new(config);
        let _ = selector.backend.set(backend);
        selector
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// The loaded backend, loading it on first call.
    ///
    /// Concurrent first callers block on one load; later callers never lock.
    pub fn get(&self) -> Result<&InferenceBackend, VisionError> {
        if let Some(backend) = self.backend.get() {
            return Ok(backend);
        }

        let _guard = self
            .init_lock
            .lock()
            .map_err(|e| VisionError::ModelLoad(format!("backend init lock poisoned: {}", e)))?;
        if let Some(backend) = self.backend.get() {
            return Ok(backend);
        }

        let choice = BackendChoice::from_config(&self.config);
        let selection = Selection::load(&choice, &self.config)?;
        if let Some(reason) = selection.fallback {
            if let Ok(mut diag) = self.diagnostic.lock() {
                *diag = Some(reason);
            }
        }
        info!(backend = %selection.backend.kind(), "Inference backend selected");

        Ok(self.backend.get_or_init(|| selection.backend))
    }

    /// The backend kind, if a backend has been loaded.
    pub fn kind(&self) -> Option<BackendKind> {
        self.backend.get().map(InferenceBackend::kind)
    }

    /// Why the accelerated backend was not used, if it was requested and failed.
    pub fn diagnostic(&self) -> Option<String> {
        self.diagnostic.lock().ok().and_then(|d| d.clone())
    }
}
