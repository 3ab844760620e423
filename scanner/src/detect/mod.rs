//! Change detection between temporally adjacent frames.
//!
//! - **diff**: blur, absolute difference and Otsu binarization into a change mask
//! - **regions**: outer connected components of a change mask as bounding boxes

pub mod diff;
pub mod regions;

pub use diff::{ChangeMask, DiffDetector};
pub use regions::{extract_regions, Region};
