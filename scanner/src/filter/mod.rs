pub mod streak;
pub mod traits;

pub use streak::StreakFilter;
pub use traits::RegionFilter;
