//! Glance Gallery crate - precomputed gallery artifacts and top-k search.
//!
//! The gallery is an N x D `.npy` feature matrix plus a CSV manifest of image
//! paths. [`GalleryIndex`] loads and row-normalizes both without ever failing,
//! [`GallerySearcher`] answers exact cosine top-k queries, and
//! [`GalleryBuilder`] produces the artifacts from an image directory.

pub mod builder;
pub mod error;
pub mod index;
pub mod manifest;
pub mod npy;
pub mod search;

pub use builder::{BuildOptions, BuildReport, GalleryBuilder};
pub use error::GalleryError;
pub use index::GalleryIndex;
pub use search::GallerySearcher;
