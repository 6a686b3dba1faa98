// Merger: folds completed segment sinks into the final file, in index order.

use std::path::Path;

use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument, warn};

use crate::DownloadError;
use crate::plan::Segment;

/// Concatenates every segment sink into `output` by ascending index,
/// deleting each sink once it is folded in.
///
/// All sinks are checked before the output is created: a missing sink, or a
/// ranged sink whose length differs from its range, fails with
/// [`DownloadError::Merge`] and leaves every sink in place.
#[instrument(skip_all, fields(output = %output.display(), segments = segments.len()))]
pub async fn merge_segments(
    segments: &[Segment],
    output: &Path,
    buffer_size: usize,
) -> Result<u64, DownloadError> {
    let mut ordered: Vec<&Segment> = segments.iter().collect();
    ordered.sort_by_key(|s| s.index);

    for segment in &ordered {
        let meta = fs::metadata(&segment.sink).await.map_err(|e| {
            DownloadError::merge(
                output,
                format!("sink of segment {} unreadable: {e}", segment.index),
            )
        })?;
        if let Some(len) = segment.len()
            && meta.len() != len
        {
            return Err(DownloadError::merge(
                output,
                format!(
                    "sink of segment {} holds {} bytes, expected {len}",
                    segment.index,
                    meta.len()
                ),
            ));
        }
    }

    let file = File::create(output)
        .await
        .map_err(|e| DownloadError::merge(output, format!("cannot create output: {e}")))?;
    let mut writer = BufWriter::with_capacity(buffer_size, file);
    let mut written = 0u64;

    for segment in ordered {
        let mut sink = File::open(&segment.sink).await.map_err(|e| {
            DownloadError::merge(output, format!("segment {}: {e}", segment.index))
        })?;
        let copied = tokio::io::copy(&mut sink, &mut writer).await.map_err(|e| {
            DownloadError::merge(output, format!("copying segment {}: {e}", segment.index))
        })?;
        writer
            .flush()
            .await
            .map_err(|e| DownloadError::merge(output, e.to_string()))?;
        written += copied;
        debug!(segment = segment.index, bytes = copied, "Folded segment");

        drop(sink);
        if let Err(e) = fs::remove_file(&segment.sink).await {
            warn!(segment = segment.index, error = %e, "Failed to delete merged sink");
        }
    }

    let file = writer.into_inner();
    file.sync_all()
        .await
        .map_err(|e| DownloadError::merge(output, e.to_string()))?;
    Ok(written)
}

/// Best-effort removal of a session temp dir; failures are only logged.
pub async fn remove_temp_dir(dir: &Path) {
    match fs::remove_dir_all(dir).await {
        Ok(()) => debug!(dir = %dir.display(), "Removed temp dir"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to remove temp dir"),
    }
}
