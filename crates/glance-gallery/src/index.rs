//! The loaded gallery: a row-normalized feature matrix and a parallel list of
//! image paths.

use std::path::{Path, PathBuf};

use ndarray::Array2;
use tracing::{info, warn};

use glance_core::config::{expand_home, GalleryConfig};

use crate::manifest;
use crate::npy;

/// Epsilon added to every row norm during normalization.
const ROW_NORM_EPS: f32 = 1e-12;

/// Gallery features and paths, aligned row for row.
///
/// Loading never fails. A broken features file leaves the index without
/// features or paths (every search returns nothing); a broken manifest falls back to
/// `"{row}.jpg"` names. The most recent problem is kept in `last_error`.
#[derive(Debug, Clone, Default)]
pub struct GalleryIndex {
    features: Option<Array2<f32>>,
    paths: Vec<String>,
    last_error: Option<String>,
}

impl GalleryIndex {
    /// Load both artifacts named by the gallery configuration.
    pub fn load(config: &GalleryConfig) -> Self {
        let root = config.root.as_deref().map(expand_home);
        Self::load_files(
            &expand_home(&config.features_path),
            &expand_home(&config.index_path),
            root.as_deref(),
        )
    }

    /// Load from explicit paths.
    pub fn load_files(features_path: &Path, index_path: &Path, root: Option<&Path>) -> Self {
        let mut index = Self::default();

        if features_path.exists() {
            match npy::read_matrix(features_path) {
                Ok(mut matrix) => {
                    normalize_rows(&mut matrix);
                    index.features = Some(matrix);
                }
                Err(e) => {
                    warn!(path = %features_path.display(), error = %e, "Failed to load gallery features");
                    index.last_error = Some(format!("Failed to load gallery features: {e}"));
                }
            }
        } else {
            warn!(path = %features_path.display(), "Gallery features file not found");
        }

        if index_path.exists() {
            match manifest::read_manifest(index_path, root) {
                Ok(paths) => index.paths = paths,
                Err(e) => {
                    warn!(path = %index_path.display(), error = %e, "Failed to load gallery manifest");
                    index.last_error = Some(format!("Failed to load gallery index: {e}"));
                }
            }
        }

        index.align();
        info!(
            rows = index.len(),
            dim = index.dimension().unwrap_or(0),
            "Gallery loaded"
        );
        index
    }

    /// Build an index from in-memory parts. Rows are normalized and aligned
    /// the same way as when loading from disk.
    pub fn from_parts(features: Option<Array2<f32>>, paths: Vec<String>) -> Self {
        let mut index = Self {
            features: features.filter(|m| m.nrows() > 0 && m.ncols() > 0),
            paths,
            last_error: None,
        };
        if let Some(m) = index.features.as_mut() {
            normalize_rows(m);
        }
        index.align();
        index
    }

    /// Fill in placeholder names and truncate both sides to a common length.
    /// Without features no row is searchable, so no path is kept either.
    fn align(&mut self) {
        let Some(features) = self.features.as_ref() else {
            if !self.paths.is_empty() {
                warn!(paths = self.paths.len(), "Gallery manifest has no features, ignoring it");
                self.paths.clear();
            }
            return;
        };
        let rows = features.nrows();
        if self.paths.is_empty() {
            self.paths = (0..rows).map(|i| format!("{i}.jpg")).collect();
            return;
        }
        if self.paths.len() != rows {
            let n = self.paths.len().min(rows);
            warn!(
                features = rows,
                paths = self.paths.len(),
                kept = n,
                "Gallery artifacts disagree on length, truncating"
            );
            let truncated = features.slice(ndarray::s![..n, ..]).to_owned();
            self.paths.truncate(n);
            self.features = Some(truncated);
        }
    }

    pub fn features(&self) -> Option<&Array2<f32>> {
        self.features.as_ref()
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    /// Feature dimension, if features are loaded.
    pub fn dimension(&self) -> Option<usize> {
        self.features.as_ref().map(|m| m.ncols())
    }

    /// Number of searchable rows.
    pub fn len(&self) -> usize {
        self.features.as_ref().map_or(0, |m| m.nrows())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

/// L2-normalize each row in place with `norm + 1e-12`.
pub fn normalize_rows(matrix: &mut Array2<f32>) {
    for mut row in matrix.rows_mut() {
        let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt() + ROW_NORM_EPS;
        row.mapv_inplace(|v| v / norm);
    }
}

/// Default artifact locations under a data directory.
pub fn default_paths(data_dir: &Path) -> (PathBuf, PathBuf) {
    let features = data_dir.join("features");
    (
        features.join("gallery_features.npy"),
        features.join("gallery_index.csv"),
    )
}
