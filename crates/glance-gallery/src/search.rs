//! Exact top-k cosine search over the gallery.
//!
//! Rows and queries are unit vectors, so cosine similarity is a single
//! matrix-vector product. For k < N the k best rows are isolated with a
//! linear-time selection and only those k are sorted.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;

use ndarray::ArrayView1;
use tracing::debug;

use glance_core::config::GalleryConfig;
use glance_core::types::SearchResult;

use crate::index::GalleryIndex;

/// Default URL prefix when none is configured.
pub const DEFAULT_URL_PREFIX: &str = "/gallery/";

/// Searches a shared, read-only gallery index.
#[derive(Debug, Clone)]
pub struct GallerySearcher {
    index: Arc<GalleryIndex>,
    /// URL base with exactly one trailing slash.
    url_base: String,
}

impl GallerySearcher {
    pub fn new(index: Arc<GalleryIndex>, config: &GalleryConfig) -> Self {
        Self {
            index,
            url_base: url_base(&config.url_prefix, config.cdn_base.as_deref()),
        }
    }

    pub fn index(&self) -> &GalleryIndex {
        &self.index
    }

    /// Feature dimension of the live gallery, if loaded.
    pub fn dimension(&self) -> Option<usize> {
        self.index.dimension()
    }

    pub fn url_base(&self) -> &str {
        &self.url_base
    }

    /// The `k` most similar gallery images, best first.
    ///
    /// Returns an empty list when no features are loaded, the query length
    /// differs from the gallery dimension, or `k` is zero. `k` larger than
    /// the gallery is clamped.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<SearchResult> {
        let Some(features) = self.index.features() else {
            return Vec::new();
        };
        let n = features.nrows();
        if n == 0 || k == 0 || query.len() != features.ncols() {
            return Vec::new();
        }
        let k = k.min(n);

        let started = Instant::now();
        let sims = features.dot(&ArrayView1::from(query));

        // Descending score, ties broken by row so selection and full sort agree.
        let by_score = |a: &usize, b: &usize| -> Ordering {
            sims[*b].total_cmp(&sims[*a]).then(a.cmp(b))
        };

        let mut order: Vec<usize> = (0..n).collect();
        if k < n {
            order.select_nth_unstable_by(k - 1, by_score);
            order.truncate(k);
        }
        order.sort_unstable_by(by_score);

        let paths = self.index.paths();
        let results: Vec<SearchResult> = order
            .into_iter()
            .map(|row| {
                let url = match paths.get(row) {
                    Some(path) => self.to_url(path),
                    None => self.to_url(&format!("{row}.jpg")),
                };
                SearchResult {
                    url,
                    score: sims[row],
                }
            })
            .collect();

        debug!(
            rows = n,
            k,
            elapsed_us = started.elapsed().as_micros() as u64,
            "Gallery search"
        );
        results
    }

    /// Public URL for a manifest path.
    pub fn to_url(&self, path: &str) -> String {
        let rel = path.replace('\\', "/");
        let rel = rel.trim_start_matches('/');
        format!("{}{}", self.url_base, percent_encode_path(rel))
    }
}

/// CDN base if set, else the URL prefix, normalized to one trailing slash.
pub fn url_base(url_prefix: &str, cdn_base: Option<&str>) -> String {
    match cdn_base.filter(|c| !c.is_empty()) {
        Some(cdn) => format!("{}/", cdn.trim_end_matches('/')),
        None => {
            let prefix = if url_prefix.is_empty() {
                DEFAULT_URL_PREFIX
            } else {
                url_prefix
            };
            format!("{}/", prefix.trim_end_matches('/'))
        }
    }
}

/// Percent-encode everything except unreserved characters and `/`.
pub fn percent_encode_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for byte in path.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
