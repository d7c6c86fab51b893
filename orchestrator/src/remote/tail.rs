//! Partial reads of remote log files

use std::io::SeekFrom;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

/// Offset to start reading from so that at most `max_bytes` remain
pub fn tail_window(size: u64, max_bytes: u64) -> u64 {
    size.saturating_sub(max_bytes)
}

/// Read the last `max_bytes` of a file whose size was stat'ed as `size`.
/// Returns the bytes and whether the window skipped the start of the file.
pub async fn read_tail_from<R>(
    reader: &mut R,
    size: u64,
    max_bytes: u64,
) -> std::io::Result<(Vec<u8>, bool)>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    if size == 0 {
        return Ok((Vec::new(), false));
    }

    let start = tail_window(size, max_bytes);
    reader.seek(SeekFrom::Start(start)).await?;
    let mut buf = Vec::with_capacity((size - start) as usize);
    reader.read_to_end(&mut buf).await?;
    // the file may have grown since the stat
    buf.truncate(max_bytes as usize);
    Ok((buf, start > 0))
}

/// `\r\n` and lone `\r` become `\n`
pub fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Last `max_lines` lines of `raw` and how many lines were kept.
///
/// A window that starts mid-line drops its first partial line unless the
/// whole file fit in the window.
pub fn last_lines(raw: &[u8], max_lines: usize, truncated: bool) -> (String, usize) {
    let text = normalize_newlines(&String::from_utf8_lossy(raw));
    let mut lines: Vec<&str> = text.trim_end_matches('\n').split('\n').collect();
    if truncated && lines.len() > 1 {
        lines.remove(0);
    }
    if lines.len() == 1 && lines[0].is_empty() {
        return (String::new(), 0);
    }
    let start = lines.len().saturating_sub(max_lines);
    let kept = &lines[start..];
    (kept.join("\n"), kept.len())
}
