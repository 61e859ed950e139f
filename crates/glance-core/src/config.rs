use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{GlanceError, Result};

/// Top-level configuration for Glance.
///
/// Loaded from `~/.glance/config.toml` by default. Each section corresponds
/// to one component: the inference model, the gallery artifacts, the query
/// orchestrator, result quality buckets, and the history store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlanceConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub gallery: GalleryConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl GlanceConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: GlanceConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| GlanceError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory for the history database, models and gallery artifacts.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.glance/data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Inference backend and vision-transformer architecture.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Backend: "reference" (pure ndarray) or "onnx" (ONNX Runtime).
    pub backend: String,
    /// Path to the safetensors weights used by the reference engine.
    pub weights_path: String,
    /// Path to the ONNX model used by the accelerated engine.
    pub onnx_model_path: Option<String>,
    /// Ordered execution-provider preference for the accelerated engine.
    /// Empty means DirectML, then CUDA, then CPU.
    pub providers: Vec<String>,
    /// Square input resolution fed to the network.
    pub image_size: usize,
    /// Side length of a square patch.
    pub patch_size: usize,
    /// Input channel count.
    pub channels: usize,
    /// Hidden (embedding) dimension.
    pub hidden_size: usize,
    /// Attention heads per block.
    pub num_heads: usize,
    /// Transformer block count.
    pub num_layers: usize,
    /// LayerNorm epsilon inside the square root.
    pub layer_norm_eps: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backend: "reference".to_string(),
            weights_path: "~/.glance/data/models/dinov2-base.safetensors".to_string(),
            onnx_model_path: None,
            providers: Vec::new(),
            image_size: 224,
            patch_size: 14,
            channels: 3,
            hidden_size: 768,
            num_heads: 12,
            num_layers: 12,
            layer_norm_eps: 1e-6,
        }
    }
}

impl ModelConfig {
    /// Patch grid side length for the configured input resolution.
    pub fn grid_size(&self) -> usize {
        self.image_size / self.patch_size
    }

    /// Validate that the architecture constants are mutually consistent.
    pub fn validate(&self) -> Result<()> {
        if self.patch_size == 0 || self.image_size == 0 || self.image_size % self.patch_size != 0 {
            return Err(GlanceError::Config(format!(
                "image_size {} must be a positive multiple of patch_size {}",
                self.image_size, self.patch_size
            )));
        }
        if self.num_heads == 0 || self.hidden_size % self.num_heads != 0 {
            return Err(GlanceError::Config(format!(
                "hidden_size {} must be divisible by num_heads {}",
                self.hidden_size, self.num_heads
            )));
        }
        if self.channels == 0 || self.num_layers == 0 {
            return Err(GlanceError::Config(
                "channels and num_layers must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Gallery artifact locations and URL formation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GalleryConfig {
    /// Path to the N x D `.npy` feature matrix.
    pub features_path: String,
    /// Path to the CSV manifest listing one image path per row.
    pub index_path: String,
    /// URL prefix used when no CDN base is configured.
    pub url_prefix: String,
    /// Optional CDN base that replaces the URL prefix.
    pub cdn_base: Option<String>,
    /// Gallery image root; absolute manifest paths are made relative to it.
    pub root: Option<String>,
}

impl Default for GalleryConfig {
    fn default() -> Self {
        Self {
            features_path: "~/.glance/data/features/gallery_features.npy".to_string(),
            index_path: "~/.glance/data/features/gallery_index.csv".to_string(),
            url_prefix: "/gallery/".to_string(),
            cdn_base: None,
            root: None,
        }
    }
}

/// Query orchestrator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Result count used when a request does not specify one.
    pub default_top_k: usize,
    /// Upper bound applied to requested result counts.
    pub max_top_k: usize,
    /// Bounded synchronous wait after submission, in milliseconds. 0 disables it.
    pub sync_wait_ms: u64,
    /// Lifetime of task status and error entries, in seconds.
    pub task_ttl_secs: u64,
    /// Lifetime of cached query embeddings, in seconds.
    pub embed_cache_ttl_secs: u64,
    /// Maximum stored length of a task error message, in characters.
    pub max_error_chars: usize,
    /// Maximum number of entries held by the in-process cache store.
    pub cache_capacity: u64,
    /// Key prefix shared by every cache namespace.
    pub cache_prefix: String,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_top_k: 50,
            max_top_k: 200,
            sync_wait_ms: 900,
            task_ttl_secs: 3600,
            embed_cache_ttl_secs: 86_400,
            max_error_chars: 4000,
            cache_capacity: 10_000,
            cache_prefix: "glance".to_string(),
        }
    }
}

/// Score cutoffs for the Strong / Medium / Weak / Poor buckets.
///
/// Heuristic display thresholds, not calibrated against ground truth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub strong: f32,
    pub medium: f32,
    pub weak: f32,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            strong: 0.55,
            medium: 0.45,
            weak: 0.35,
        }
    }
}

/// History store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path for history records.
    pub db_path: String,
    /// Default number of records listed by `history`.
    pub history_limit: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "~/.glance/data/history.db".to_string(),
            history_limit: 20,
        }
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> std::path::PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        #[cfg(target_os = "windows")]
        let home = std::env::var("USERPROFILE");
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var("HOME");
        if let Ok(home) = home {
            return std::path::PathBuf::from(home).join(rest);
        }
    }
    std::path::PathBuf::from(path)
}
