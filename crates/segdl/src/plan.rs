//! Segment planning: splits a resource into contiguous byte ranges.

use std::path::{Path, PathBuf};

use serde::Serialize;

/// One contiguous byte range of the target resource and its private sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Segment {
    /// Position in the merge order.
    pub index: usize,
    /// First byte of the range.
    pub start: u64,
    /// Last byte of the range (inclusive). `None` means "until the server stops",
    /// which only happens for the single segment of a single-stream session.
    pub end: Option<u64>,
    /// Bytes already written to `sink`; the resume offset.
    pub downloaded: u64,
    pub sink: PathBuf,
}

impl Segment {
    fn new(index: usize, start: u64, end: Option<u64>, temp_dir: &Path) -> Self {
        Self {
            index,
            start,
            end,
            downloaded: 0,
            sink: temp_dir.join(format!("chunk_{index}")),
        }
    }

    /// Number of bytes in the range, when bounded.
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end - self.start + 1)
    }

    /// Whether the segment is fetched with a `Range` header.
    pub fn is_ranged(&self) -> bool {
        self.end.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.len().is_some_and(|len| self.downloaded >= len)
    }

    /// Bytes still missing, when bounded.
    pub fn remaining(&self) -> Option<u64> {
        self.len().map(|len| len.saturating_sub(self.downloaded))
    }

    /// `Range` header value continuing from the saved offset.
    pub fn range_header(&self) -> Option<String> {
        self.end
            .map(|end| format!("bytes={}-{}", self.start + self.downloaded, end))
    }
}

/// Computes the ordered segment list for a session.
///
/// With range support and a known size the resource is split into
/// `min(connections, size)` non-empty ranges of `ceil(size / connections)`
/// bytes, the last one possibly shorter. When that rule would leave trailing
/// ranges empty the bytes are spread evenly instead, so the count still holds.
/// Without range support, or with an unknown size, a single unbounded segment
/// covers the whole resource.
pub fn plan_segments(
    size: u64,
    supports_ranges: bool,
    connections: usize,
    temp_dir: &Path,
) -> Vec<Segment> {
    if !supports_ranges || size == 0 {
        return vec![Segment::new(0, 0, None, temp_dir)];
    }

    let count = (connections.max(1) as u64).min(size);
    let chunk = size.div_ceil(count);

    if chunk * (count - 1) < size {
        (0..count)
            .map(|i| {
                let start = i * chunk;
                let end = ((i + 1) * chunk - 1).min(size - 1);
                Segment::new(i as usize, start, Some(end), temp_dir)
            })
            .collect()
    } else {
        let base = size / count;
        let extra = size % count;
        let mut start = 0;
        (0..count)
            .map(|i| {
                let len = base + u64::from(i < extra);
                let segment = Segment::new(i as usize, start, Some(start + len - 1), temp_dir);
                start += len;
                segment
            })
            .collect()
    }
}
