use crate::detect::Region;

/// Geometric admission test applied to each region before classification.
///
/// Implementations look only at the region's bounding box and decide whether
/// it is worth the cost of running the classifier.
pub trait RegionFilter: Send + Sync {
    /// Returns `true` to keep the region as a candidate.
    /// Returns `false` to discard it.
    fn admit(&self, region: &Region) -> bool;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}
