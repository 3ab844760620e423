//! Scan driver: walks adjacent frame pairs and feeds each through
//! difference detection, region extraction, the region filters and the
//! classifier.

use rayon::prelude::*;
use std::path::PathBuf;
use streakscan_common::config::Config;
use tracing::{debug, info, warn};

use crate::classifier::{is_anomalous, prepare_patch, Classifier, ClassifierError};
use crate::detect::{extract_regions, DiffDetector};
use crate::filter::{RegionFilter, StreakFilter};
use crate::sink::{Anomaly, ResultSink, SinkError};
use crate::source::{Frame, FrameSource, SourceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Init,
    Scanning { pair_index: usize },
    Done,
    Aborted,
}

/// Per-pair processing shared by the sequential and parallel drivers.
///
/// Holds nothing mutable, so one instance serves every worker.
struct PairPipeline<'a> {
    detector: DiffDetector,
    filters: Vec<Box<dyn RegionFilter>>,
    classifier: &'a dyn Classifier,
    crop_size: u32,
}

impl PairPipeline<'_> {
    fn process(
        &self,
        pair_index: usize,
        earlier: &Frame,
        later: &Frame,
    ) -> Result<Vec<Anomaly>, ClassifierError> {
        let Some(mask) = self.detector.detect(&earlier.gray, &later.gray) else {
            warn!(
                pair = pair_index,
                earlier = earlier.index,
                later = later.index,
                earlier_dims = ?earlier.dimensions(),
                later_dims = ?later.dimensions(),
                "frame dimensions differ, skipping pair"
            );
            return Ok(Vec::new());
        };

        let regions = extract_regions(&mask);
        let mut candidates = 0usize;
        let mut found = Vec::new();

        for region in &regions {
            if !self.filters.iter().all(|f| f.admit(region)) {
                continue;
            }
            candidates += 1;

            let patch = prepare_patch(&later.color, region, self.crop_size);
            let score = self.classifier.score(&patch)?;
            if !is_anomalous(score) {
                debug!(frame = later.index, ?region, score, "candidate looks benign");
                continue;
            }

            let anomaly = Anomaly::new(later.index, *region, score);
            info!(
                frame = anomaly.frame_index,
                x = anomaly.center_x,
                y = anomaly.center_y,
                score,
                "anomaly detected"
            );
            found.push(anomaly);
        }

        debug!(
            pair = pair_index,
            earlier = earlier.index,
            later = later.index,
            level = mask.level,
            regions = regions.len(),
            candidates,
            anomalies = found.len(),
            "pair processed"
        );
        Ok(found)
    }
}

pub struct Scanner<'a> {
    frames_dir: PathBuf,
    extensions: Vec<String>,
    parallel: bool,
    pipeline: PairPipeline<'a>,
    state: ScanState,
}

impl<'a> Scanner<'a> {
    pub fn new(config: &Config, classifier: &'a dyn Classifier) -> Self {
        let filters: Vec<Box<dyn RegionFilter>> =
            vec![Box::new(StreakFilter::new(config.scan.min_streak_length))];

        Self {
            frames_dir: config.scan.frames_dir.clone(),
            extensions: config.scan.extensions.clone(),
            parallel: config.scan.parallel,
            pipeline: PairPipeline {
                detector: DiffDetector::new(),
                filters,
                classifier,
                crop_size: config.classifier.crop_size,
            },
            state: ScanState::Init,
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Scan every adjacent pair of the frame directory.
    ///
    /// Undecodable frames and mismatched pairs are skipped. Listing
    /// failures and classifier errors abort the scan.
    pub fn run(&mut self) -> Result<ResultSink, ScanError> {
        let source = match FrameSource::open(&self.frames_dir, &self.extensions) {
            Ok(s) => s,
            Err(e) => {
                self.state = ScanState::Aborted;
                return Err(e.into());
            }
        };

        info!(
            dir = %source.dir().display(),
            frames = source.len(),
            pairs = source.pair_count(),
            parallel = self.parallel,
            classifier = self.pipeline.classifier.name(),
            filters = ?self.pipeline.filters.iter().map(|f| f.name()).collect::<Vec<_>>(),
            "scan started"
        );

        let result = if self.parallel {
            self.scan_parallel(&source)
        } else {
            self.scan_sequential(&source)
        };

        match result {
            Ok(sink) => {
                self.state = ScanState::Done;
                info!(total = sink.len(), "scan complete");
                Ok(sink)
            }
            Err(e) => {
                self.state = ScanState::Aborted;
                Err(e.into())
            }
        }
    }

    /// Decode each frame once, keeping only the previous one.
    fn scan_sequential(&mut self, source: &FrameSource) -> Result<ResultSink, ClassifierError> {
        let mut sink = ResultSink::new();
        let mut previous: Option<Frame> = None;

        for position in 0..source.len() {
            let current = match source.load(position) {
                Ok(frame) => Some(frame),
                Err(e) => {
                    warn!(error = %e, "frame could not be decoded, skipping its pairs");
                    None
                }
            };

            if position > 0 {
                let pair_index = position - 1;
                self.state = ScanState::Scanning { pair_index };
                match (&previous, &current) {
                    (Some(earlier), Some(later)) => {
                        sink.extend(self.pipeline.process(pair_index, earlier, later)?);
                    }
                    _ => debug!(pair = pair_index, "pair skipped"),
                }
            }

            previous = current;
        }

        Ok(sink)
    }

    /// Process pairs on the rayon pool, then merge in pair order.
    ///
    /// Interior frames are decoded by both of their pairs.
    fn scan_parallel(&mut self, source: &FrameSource) -> Result<ResultSink, ClassifierError> {
        let pipeline = &self.pipeline;
        let per_pair: Vec<Result<Vec<Anomaly>, ClassifierError>> = (0..source.pair_count())
            .into_par_iter()
            .map(|pair_index| {
                let earlier = source.load(pair_index);
                let later = source.load(pair_index + 1);
                match (earlier, later) {
                    (Ok(earlier), Ok(later)) => pipeline.process(pair_index, &earlier, &later),
                    (Err(e), _) | (_, Err(e)) => {
                        warn!(pair = pair_index, error = %e, "frame could not be decoded, skipping pair");
                        Ok(Vec::new())
                    }
                }
            })
            .collect();

        let mut sink = ResultSink::new();
        for (pair_index, anomalies) in per_pair.into_iter().enumerate() {
            self.state = ScanState::Scanning { pair_index };
            sink.extend(anomalies?);
        }
        Ok(sink)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
    #[error(transparent)]
    Sink(#[from] SinkError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::testing::FixedScore;
    use crate::detect::Region;
    use image::{Rgb, RgbImage};
    use std::path::Path;
    use streakscan_common::frame::frame_file_name;

    const SIDE: u32 = 100;

    fn blank() -> RgbImage {
        RgbImage::new(SIDE, SIDE)
    }

    fn with_square(x0: u32, y0: u32, size: u32) -> RgbImage {
        RgbImage::from_fn(SIDE, SIDE, |x, y| {
            let inside = (x0..x0 + size).contains(&x) && (y0..y0 + size).contains(&y);
            if inside {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        })
    }

    fn write_frames(dir: &Path, frames: &[(u64, RgbImage)]) {
        for (seq, img) in frames {
            img.save(dir.join(frame_file_name(*seq, "png"))).unwrap();
        }
    }

    fn config_for(dir: &Path) -> Config {
        let mut config = Config::default();
        config.scan.frames_dir = dir.to_path_buf();
        config
    }

    #[test]
    fn fewer_than_two_frames_aborts() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(dir.path(), &[(0, blank())]);

        let classifier = FixedScore::new(0.2);
        let mut scanner = Scanner::new(&config_for(dir.path()), &classifier);
        assert_eq!(scanner.state(), ScanState::Init);

        let err = scanner.run().unwrap_err();
        assert!(matches!(
            err,
            ScanError::Source(SourceError::NotEnoughFrames { found: 1, .. })
        ));
        assert_eq!(scanner.state(), ScanState::Aborted);
        assert_eq!(classifier.calls(), 0);
    }

    #[test]
    fn identical_frames_yield_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let img = with_square(20, 20, 40);
        write_frames(dir.path(), &[(0, img.clone()), (1, img.clone()), (2, img)]);

        let classifier = FixedScore::new(0.0);
        let mut scanner = Scanner::new(&config_for(dir.path()), &classifier);
        let sink = scanner.run().unwrap();

        assert!(sink.is_empty());
        assert_eq!(classifier.calls(), 0);
        assert_eq!(scanner.state(), ScanState::Done);
    }

    #[test]
    fn bright_square_becomes_one_anomaly() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(
            dir.path(),
            &[(0, blank()), (1, blank()), (2, with_square(10, 10, 40))],
        );

        let classifier = FixedScore::new(0.2);
        let mut scanner = Scanner::new(&config_for(dir.path()), &classifier);
        let sink = scanner.run().unwrap();

        assert_eq!(classifier.calls(), 1);
        assert_eq!(classifier.patch_sizes(), vec![(64, 64)]);
        assert_eq!(sink.len(), 1);

        let anomaly = &sink.anomalies()[0];
        assert_eq!(anomaly.frame_index, 2);
        assert_eq!((anomaly.center_x, anomaly.center_y), (30, 30));
        assert_eq!(anomaly.region, Region::new(10, 10, 40, 40));
        assert_eq!(anomaly.score, 0.2);
    }

    #[test]
    fn small_square_never_reaches_classifier() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(
            dir.path(),
            &[(0, blank()), (1, blank()), (2, with_square(10, 10, 10))],
        );

        let classifier = FixedScore::new(0.2);
        let sink = Scanner::new(&config_for(dir.path()), &classifier)
            .run()
            .unwrap();

        assert_eq!(classifier.calls(), 0);
        assert!(sink.is_empty());
    }

    #[test]
    fn benign_scores_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(dir.path(), &[(0, blank()), (1, with_square(10, 10, 40))]);

        let classifier = FixedScore::new(0.5);
        let sink = Scanner::new(&config_for(dir.path()), &classifier)
            .run()
            .unwrap();

        assert_eq!(classifier.calls(), 1);
        assert!(sink.is_empty());
    }

    #[test]
    fn raising_streak_length_never_adds_candidates() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(dir.path(), &[(0, blank()), (1, with_square(10, 10, 40))]);

        let mut calls = Vec::new();
        for min_streak_length in [1, 30, 40, 41, 100] {
            let mut config = config_for(dir.path());
            config.scan.min_streak_length = min_streak_length;
            let classifier = FixedScore::new(0.9);
            Scanner::new(&config, &classifier).run().unwrap();
            calls.push(classifier.calls());
        }

        assert_eq!(calls, vec![1, 1, 1, 0, 0]);
    }

    #[test]
    fn corrupt_frame_skips_its_pairs_only() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(
            dir.path(),
            &[(0, blank()), (2, blank()), (3, with_square(10, 10, 40))],
        );
        std::fs::write(dir.path().join(frame_file_name(1, "png")), b"not an image").unwrap();

        let classifier = FixedScore::new(0.2);
        let mut scanner = Scanner::new(&config_for(dir.path()), &classifier);
        let sink = scanner.run().unwrap();

        assert_eq!(scanner.state(), ScanState::Done);
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.anomalies()[0].frame_index, 3);
    }

    #[test]
    fn gap_in_numbering_still_pairs_neighbours() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(
            dir.path(),
            &[(0, blank()), (1, blank()), (4, with_square(10, 10, 40))],
        );

        let classifier = FixedScore::new(0.2);
        let sink = Scanner::new(&config_for(dir.path()), &classifier)
            .run()
            .unwrap();

        assert_eq!(sink.len(), 1);
        assert_eq!(sink.anomalies()[0].frame_index, 4);
    }

    #[test]
    fn mismatched_frame_sizes_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(
            dir.path(),
            &[
                (0, RgbImage::new(50, 50)),
                (1, blank()),
                (2, with_square(10, 10, 40)),
            ],
        );

        let classifier = FixedScore::new(0.2);
        let sink = Scanner::new(&config_for(dir.path()), &classifier)
            .run()
            .unwrap();

        assert_eq!(sink.len(), 1);
        assert_eq!(sink.anomalies()[0].frame_index, 2);
    }

    #[test]
    fn parallel_matches_sequential() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(
            dir.path(),
            &[
                (0, blank()),
                (1, with_square(10, 10, 40)),
                (2, with_square(55, 55, 40)),
                (3, with_square(55, 55, 40)),
                (4, blank()),
            ],
        );

        let sequential_classifier = FixedScore::new(0.1);
        let sequential = Scanner::new(&config_for(dir.path()), &sequential_classifier)
            .run()
            .unwrap();

        let mut config = config_for(dir.path());
        config.scan.parallel = true;
        let parallel_classifier = FixedScore::new(0.1);
        let mut scanner = Scanner::new(&config, &parallel_classifier);
        let parallel = scanner.run().unwrap();

        assert!(sequential.len() >= 3);
        assert_eq!(sequential.anomalies(), parallel.anomalies());
        assert_eq!(sequential_classifier.calls(), parallel_classifier.calls());
        assert_eq!(scanner.state(), ScanState::Done);

        let frames: Vec<u64> = parallel.anomalies().iter().map(|a| a.frame_index).collect();
        let mut sorted = frames.clone();
        sorted.sort();
        assert_eq!(frames, sorted);
    }

    #[test]
    fn persisted_rows_match_sink() {
        let dir = tempfile::tempdir().unwrap();
        let frames = dir.path().join("frames");
        std::fs::create_dir(&frames).unwrap();
        write_frames(
            &frames,
            &[(0, blank()), (1, blank()), (2, with_square(10, 10, 40))],
        );

        let classifier = FixedScore::new(0.2);
        let sink = Scanner::new(&config_for(&frames), &classifier)
            .run()
            .unwrap();

        let out = dir.path().join("anomalies.csv");
        sink.persist(&out).unwrap();
        let text = std::fs::read_to_string(&out).unwrap();
        let rows: Vec<&str> = text.lines().collect();
        assert_eq!(rows, vec!["frame_number,x,y", "2,30,30"]);
        assert_eq!(rows.len() - 1, sink.len());
    }
}
