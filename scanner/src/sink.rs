use std::path::{Path, PathBuf};
use tracing::info;

use crate::detect::Region;

/// Columns of the persisted record set.
pub const CSV_HEADER: [&str; 3] = ["frame_number", "x", "y"];

/// A confirmed anomaly, located at the center of its region in the later
/// frame of the pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Anomaly {
    pub frame_index: u64,
    pub center_x: u32,
    pub center_y: u32,
    pub score: f32,
    pub region: Region,
}

impl Anomaly {
    pub fn new(frame_index: u64, region: Region, score: f32) -> Self {
        let (center_x, center_y) = region.center();
        Self {
            frame_index,
            center_x,
            center_y,
            score,
            region,
        }
    }
}

/// Accumulates anomalies in discovery order and writes them out in one batch.
#[derive(Debug, Default)]
pub struct ResultSink {
    anomalies: Vec<Anomaly>,
}

impl ResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, anomaly: Anomaly) {
        self.anomalies.push(anomaly);
    }

    pub fn extend(&mut self, anomalies: impl IntoIterator<Item = Anomaly>) {
        self.anomalies.extend(anomalies);
    }

    pub fn len(&self) -> usize {
        self.anomalies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anomalies.is_empty()
    }

    pub fn anomalies(&self) -> &[Anomaly] {
        &self.anomalies
    }

    /// Render the header and one row per anomaly.
    pub fn to_csv(&self) -> Result<Vec<u8>, SinkError> {
        let mut wtr = csv::Writer::from_writer(Vec::new());
        wtr.write_record(CSV_HEADER)?;
        for a in &self.anomalies {
            wtr.write_record(&[
                a.frame_index.to_string(),
                a.center_x.to_string(),
                a.center_y.to_string(),
            ])?;
        }
        wtr.into_inner()
            .map_err(|e| SinkError::Csv(csv::Error::from(e.into_error())))
    }

    /// Write the whole record set to `path` with a single write.
    pub fn persist(&self, path: &Path) -> Result<(), SinkError> {
        let bytes = self.to_csv()?;
        std::fs::write(path, bytes).map_err(|e| SinkError::Write(path.to_path_buf(), e))?;
        info!(path = %path.display(), rows = self.len(), "results written");
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to encode results: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to write results to {0}: {1}")]
    Write(PathBuf, std::io::Error),
}
