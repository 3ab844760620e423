use image::{GrayImage, ImageReader, Luma, RgbImage};
use std::path::{Path, PathBuf};
use streakscan_common::frame::{has_frame_extension, parse_sequence_number};
use tracing::{debug, warn};

/// One decoded frame. Both buffers share the same dimensions.
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: u64,
    pub gray: GrayImage,
    pub color: RgbImage,
}

impl Frame {
    pub fn dimensions(&self) -> (u32, u32) {
        self.gray.dimensions()
    }
}

/// A listed, not yet decoded, frame file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameEntry {
    pub seq: u64,
    pub path: PathBuf,
}

/// Ordered frame sequence backed by a directory of pre-extracted images.
#[derive(Debug)]
pub struct FrameSource {
    dir: PathBuf,
    entries: Vec<FrameEntry>,
}

impl FrameSource {
    /// List `dir` and order its frames by the sequence number in each name.
    ///
    /// Fails when the directory cannot be read, when two files carry the same
    /// sequence number, or when fewer than two frames remain.
    pub fn open(dir: &Path, extensions: &[String]) -> Result<Self, SourceError> {
        let read_dir =
            std::fs::read_dir(dir).map_err(|e| SourceError::ReadDir(dir.to_path_buf(), e))?;

        let mut entries = Vec::new();
        for dir_entry in read_dir {
            let dir_entry = dir_entry.map_err(|e| SourceError::ReadDir(dir.to_path_buf(), e))?;
            let path = dir_entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !has_frame_extension(name, extensions) {
                continue;
            }
            match parse_sequence_number(name) {
                Some(seq) => entries.push(FrameEntry { seq, path }),
                None => warn!(file = name, "frame name has no sequence number, ignoring"),
            }
        }

        entries.sort_by_key(|e| e.seq);

        for pair in entries.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if a.seq == b.seq {
                return Err(SourceError::DuplicateSequence {
                    seq: a.seq,
                    first: a.path.clone(),
                    second: b.path.clone(),
                });
            }
            if b.seq > a.seq + 1 {
                warn!(after = a.seq, before = b.seq, missing = b.seq - a.seq - 1, "gap in frame sequence");
            }
        }

        if entries.len() < 2 {
            return Err(SourceError::NotEnoughFrames {
                dir: dir.to_path_buf(),
                found: entries.len(),
            });
        }

        debug!(dir = %dir.display(), frames = entries.len(), "frame directory listed");
        Ok(Self {
            dir: dir.to_path_buf(),
            entries,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entries(&self) -> &[FrameEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Number of adjacent pairs in the sequence.
    pub fn pair_count(&self) -> usize {
        self.entries.len().saturating_sub(1)
    }

    pub fn find(&self, seq: u64) -> Option<&FrameEntry> {
        self.entries
            .binary_search_by_key(&seq, |e| e.seq)
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Decode the frame at position `position` in scan order.
    pub fn load(&self, position: usize) -> Result<Frame, FrameLoadError> {
        let entry = self
            .entries
            .get(position)
            .ok_or(FrameLoadError::OutOfRange(position))?;
        load_frame(entry)
    }
}

/// Decode a frame file once and derive its grayscale and color buffers.
pub fn load_frame(entry: &FrameEntry) -> Result<Frame, FrameLoadError> {
    let img = ImageReader::open(&entry.path)
        .map_err(|e| FrameLoadError::Open(entry.path.clone(), e))?
        .with_guessed_format()
        .map_err(|e| FrameLoadError::Open(entry.path.clone(), e))?
        .decode()
        .map_err(|e| FrameLoadError::Decode(entry.path.clone(), e))?;

    let color = img.to_rgb8();
    Ok(Frame {
        index: entry.seq,
        gray: luma_bt601(&color),
        color,
    })
}

/// Grayscale with BT.601 weights (0.299 R + 0.587 G + 0.114 B), rounded.
///
/// Frames and classifier patches both go through here, matching the
/// conversion the classifier was trained on.
pub fn luma_bt601(color: &RgbImage) -> GrayImage {
    GrayImage::from_fn(color.width(), color.height(), |x, y| {
        let [r, g, b] = color.get_pixel(x, y).0;
        let weighted = 299 * r as u32 + 587 * g as u32 + 114 * b as u32;
        Luma([((weighted + 500) / 1000) as u8])
    })
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to read frame directory {0}: {1}")]
    ReadDir(PathBuf, std::io::Error),
    #[error("not enough frames in {dir} to compare: found {found}, need at least 2")]
    NotEnoughFrames { dir: PathBuf, found: usize },
    #[error("frames {first} and {second} share sequence number {seq}")]
    DuplicateSequence {
        seq: u64,
        first: PathBuf,
        second: PathBuf,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum FrameLoadError {
    #[error("failed to open frame {0}: {1}")]
    Open(PathBuf, std::io::Error),
    #[error("failed to decode frame {0}: {1}")]
    Decode(PathBuf, image::ImageError),
    #[error("no frame at position {0}")]
    OutOfRange(usize),
}
