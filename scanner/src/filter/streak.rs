use tracing::debug;

use super::traits::RegionFilter;
use crate::detect::Region;

/// Bounding-box size filter for streak candidates.
///
/// A region is discarded only when it is shorter than `min_streak_length`
/// along BOTH axes. Anything reaching the threshold in width or in height
/// is passed on, leaving the finer decision to the classifier.
#[derive(Debug, Clone, Copy)]
pub struct StreakFilter {
    min_streak_length: u32,
}

impl StreakFilter {
    pub fn new(min_streak_length: u32) -> Self {
        Self { min_streak_length }
    }
}

impl RegionFilter for StreakFilter {
    fn admit(&self, region: &Region) -> bool {
        let too_small =
            region.width < self.min_streak_length && region.height < self.min_streak_length;
        debug!(
            x = region.x,
            y = region.y,
            width = region.width,
            height = region.height,
            min = self.min_streak_length,
            admitted = !too_small,
            "streak size check"
        );
        !too_small
    }

    fn name(&self) -> &str {
        "streak"
    }
}
