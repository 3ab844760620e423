//! Transient-anomaly scanning over a directory of extracted frames.
//!
//! Each adjacent frame pair is differenced, segmented into regions, filtered
//! by shape and confirmed by a classifier. See [`scan::Scanner`].

pub mod classifier;
pub mod detect;
pub mod filter;
pub mod scan;
pub mod sink;
pub mod source;
