//! CLI argument definitions for the Glance binary.
//!
//! Uses `clap` with derive macros for ergonomic argument parsing.
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use glance_core::config::GlanceConfig;

/// Glance: reverse image search over a precomputed gallery.
#[derive(Parser, Debug)]
#[command(name = "glance", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Inference backend (reference, onnx).
    #[arg(short = 'b', long = "backend", global = true)]
    pub backend: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Find the gallery images most similar to a query image.
    Search {
        image: PathBuf,
        /// Number of results (clamped to the configured maximum).
        #[arg(short = 'k', long = "top-k")]
        top_k: Option<usize>,
        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Embed every image under a directory into the gallery artifacts.
    BuildGallery {
        dir: PathBuf,
        /// Stop after this many images.
        #[arg(long = "max-images")]
        max_images: Option<usize>,
        /// Ignore existing artifacts instead of extending them.
        #[arg(long = "no-resume")]
        no_resume: bool,
    },
    /// List recent queries.
    History {
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Show one stored query and its results.
    Show {
        id: i64,
        #[arg(long)]
        json: bool,
    },
    /// Print the resolved configuration and gallery state.
    Info {
        /// Load the backend and run one inference.
        #[arg(long)]
        warmup: bool,
    },
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > GLANCE_CONFIG env var > ~/.glance/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("GLANCE_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Apply flag overrides on top of the loaded configuration.
    pub fn apply_overrides(&self, config: &mut GlanceConfig) {
        if let Some(ref backend) = self.backend {
            config.model.backend = backend.clone();
        }
        if let Some(ref level) = self.log_level {
            config.general.log_level = level.clone();
        }
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".glance").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".glance").join("config.toml");
    }
    PathBuf::from("config.toml")
}
