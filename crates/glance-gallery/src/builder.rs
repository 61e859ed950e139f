//! Offline construction of the gallery artifacts from an image directory.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use ndarray::Array2;
use serde::Serialize;
use tracing::{debug, info, warn};

use glance_vision::ImageEmbedding;

use crate::error::GalleryError;
use crate::{manifest, npy};

/// File extensions picked up by the builder, compared case-insensitively.
pub const IMAGE_EXTENSIONS: [&str; 7] = ["jpg", "jpeg", "png", "webp", "gif", "bmp", "tiff"];

/// Builder knobs.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Stop after this many images; 0 means no limit.
    pub max_images: usize,
    /// Keep rows from existing artifacts and only embed new images.
    pub resume: bool,
    /// Log progress every this many images.
    pub log_every: usize,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            max_images: 0,
            resume: true,
            log_every: 200,
        }
    }
}

/// Outcome of a build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    /// Images found under the root (after `max_images`).
    pub found: usize,
    /// Images skipped because the existing manifest already lists them.
    pub skipped: usize,
    /// Images embedded in this run.
    pub embedded: usize,
    /// Images that failed to read or embed.
    pub failures: usize,
    /// Rows in the written artifacts.
    pub total_rows: usize,
}

/// Embeds every image under a directory and writes the features `.npy` and
/// the CSV manifest.
pub struct GalleryBuilder<'a> {
    embedder: &'a dyn ImageEmbedding,
    options: BuildOptions,
}

impl<'a> GalleryBuilder<'a> {
    pub fn new(embedder: &'a dyn ImageEmbedding, options: BuildOptions) -> Self {
        Self { embedder, options }
    }

    /// Build (or extend) the artifacts. Manifest paths are relative to
    /// `images_root` with forward slashes.
    pub fn build(
        &self,
        images_root: &Path,
        features_path: &Path,
        index_path: &Path,
    ) -> Result<BuildReport, GalleryError> {
        let mut images = collect_images(images_root)?;
        if self.options.max_images > 0 {
            images.truncate(self.options.max_images);
        }

        let dim = self.embedder.dimension();
        let (mut rows, mut paths) = if self.options.resume {
            load_existing(features_path, index_path, dim)
        } else {
            (Vec::new(), Vec::new())
        };
        let done: HashSet<String> = paths.iter().cloned().collect();

        let mut report = BuildReport {
            found: images.len(),
            ..BuildReport::default()
        };
        info!(
            root = %images_root.display(),
            found = report.found,
            existing = paths.len(),
            "Building gallery"
        );

        let log_every = self.options.log_every.max(1);
        let started = Instant::now();
        for (i, image) in images.iter().enumerate() {
            let rel = relative_path(images_root, image);
            if done.contains(&rel) {
                report.skipped += 1;
                continue;
            }

            match std::fs::read(image)
                .map_err(GalleryError::from)
                .and_then(|bytes| self.embedder.embed_image(&bytes).map_err(GalleryError::from))
            {
                Ok(embedding) if embedding.len() == dim => {
                    rows.extend_from_slice(&embedding);
                    paths.push(rel);
                    report.embedded += 1;
                }
                Ok(embedding) => {
                    report.failures += 1;
                    warn!(path = %image.display(), got = embedding.len(), expected = dim, "Embedding has wrong dimension");
                }
                Err(e) => {
                    report.failures += 1;
                    debug!(path = %image.display(), error = %e, "Skipping image");
                }
            }

            if (i + 1) % log_every == 0 {
                info!(
                    scanned = i + 1,
                    total = report.found,
                    ok = report.embedded,
                    failures = report.failures,
                    elapsed_s = started.elapsed().as_secs_f32(),
                    "Gallery build progress"
                );
            }
        }

        report.total_rows = paths.len();
        let matrix = Array2::from_shape_vec((paths.len(), dim), rows)
            .map_err(|e| GalleryError::Npy(format!("feature matrix: {e}")))?;
        npy::write_matrix(features_path, &matrix)?;
        manifest::write_manifest(index_path, &paths)?;

        info!(
            embedded = report.embedded,
            failures = report.failures,
            rows = report.total_rows,
            features = %features_path.display(),
            "Gallery written"
        );
        Ok(report)
    }
}

/// Rows and paths of previously written artifacts, or nothing if they are
/// missing, unreadable, or disagree with each other or with `dim`.
fn load_existing(features_path: &Path, index_path: &Path, dim: usize) -> (Vec<f32>, Vec<String>) {
    if !features_path.exists() || !index_path.exists() {
        return (Vec::new(), Vec::new());
    }
    let matrix = npy::read_matrix(features_path);
    let paths = manifest::read_manifest(index_path, None);
    match (matrix, paths) {
        (Ok(m), Ok(p)) if m.ncols() == dim && m.nrows() == p.len() => {
            info!(rows = p.len(), "Resuming from existing gallery");
            (m.iter().copied().collect(), p)
        }
        _ => {
            warn!("Existing gallery artifacts unusable, rebuilding from scratch");
            (Vec::new(), Vec::new())
        }
    }
}

/// All image files under `root`, recursively, in sorted order.
pub fn collect_images(root: &Path) -> Result<Vec<PathBuf>, GalleryError> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else if is_image(&path) {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&e.as_str())
        })
        .unwrap_or(false)
}

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}
