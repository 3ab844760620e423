//! File-naming contract shared with the external frame extractor.
//!
//! Frames are written as `frame_00000.jpg`, `frame_00001.jpg`, ... The
//! sequence number is the trailing run of digits in the file stem, and the
//! scan order is the numeric order of those sequence numbers.

use std::path::Path;

/// Zero-padding width used by the frame extractor.
pub const SEQUENCE_WIDTH: usize = 5;

/// Prefix used by the frame extractor.
pub const FRAME_PREFIX: &str = "frame_";

/// Parse the sequence number embedded at the end of a frame file stem.
///
/// Returns `None` if the stem has no trailing digits or the number does not
/// fit in a `u64`.
pub fn parse_sequence_number(file_name: &str) -> Option<u64> {
    let stem = Path::new(file_name).file_stem()?.to_str()?;
    let digits_start = stem
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i)?;
    stem[digits_start..].parse().ok()
}

/// Canonical file name for a frame, e.g. `frame_00042.jpg`.
pub fn frame_file_name(seq: u64, ext: &str) -> String {
    format!("{FRAME_PREFIX}{seq:0width$}.{ext}", width = SEQUENCE_WIDTH)
}

/// Returns true if `file_name` ends in one of `extensions` (case-insensitive).
pub fn has_frame_extension(file_name: &str, extensions: &[String]) -> bool {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}
