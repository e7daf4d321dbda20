use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::Result;

const TAIL_LIMIT_BYTES: u64 = 256 * 1024;
pub const DEFAULT_MAX_LINES: usize = 200;
pub const MAX_MAX_LINES: usize = 2000;

pub fn clamp_lines(requested: Option<usize>) -> usize {
    match requested {
        None | Some(0) => DEFAULT_MAX_LINES,
        Some(v) => v.min(MAX_MAX_LINES),
    }
}

fn split_lines_from_tail(buf: &[u8], max_lines: usize, starts_mid_line: bool) -> Vec<String> {
    // Best-effort UTF-8: invalid sequences become replacement characters.
    let text = String::from_utf8_lossy(buf);
    let mut out: Vec<String> = text.lines().map(|l| l.to_string()).collect();
    if starts_mid_line && !out.is_empty() {
        out.remove(0);
    }
    if out.len() > max_lines {
        out.drain(0..(out.len() - max_lines));
    }
    out
}

/// Last `max_lines` lines of the file. A missing file reads as empty.
pub async fn tail_file(path: &Path, max_lines: usize) -> Result<Vec<String>> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let size = meta.len();
    let start = size.saturating_sub(TAIL_LIMIT_BYTES);

    let mut f = tokio::fs::File::open(path).await?;
    f.seek(std::io::SeekFrom::Start(start)).await?;
    let mut buf = Vec::with_capacity((size - start) as usize);
    f.take(TAIL_LIMIT_BYTES).read_to_end(&mut buf).await?;

    Ok(split_lines_from_tail(&buf, max_lines, start > 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_are_limited_from_the_end() {
        let lines = split_lines_from_tail(b"a\nb\nc\n", 2, false);
        assert_eq!(lines, vec!["b", "c"]);
        let lines = split_lines_from_tail(b"partial\nwhole\n", 10, true);
        assert_eq!(lines, vec!["whole"]);
    }

    #[test]
    fn line_counts_are_clamped() {
        assert_eq!(clamp_lines(None), DEFAULT_MAX_LINES);
        assert_eq!(clamp_lines(Some(0)), DEFAULT_MAX_LINES);
        assert_eq!(clamp_lines(Some(5)), 5);
        assert_eq!(clamp_lines(Some(1_000_000)), MAX_MAX_LINES);
    }

    #[tokio::test]
    async fn tail_of_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(tail_file(&dir.path().join("nope.log"), 10).await.unwrap().is_empty());

        let path = dir.path().join("out.log");
        std::fs::write(&path, "one\ntwo\nthree").unwrap();
        assert_eq!(tail_file(&path, 2).await.unwrap(), vec!["two", "three"]);
    }
}
