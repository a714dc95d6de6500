//! Resumable Download header bookkeeping (§4.C steps 1-2 and 5): the
//! `<sinkPath>.header` file records the expected `Content-Length` from the
//! prior attempt, letting a restart tell "already complete" from
//! "needs a range request" without re-querying the cloud. The retry/fallback
//! loop that drives the actual transfer lives in `pipeline.rs`, composed with
//! [`crate::retry::RetryOrchestrator`] (§4.E); these are its building blocks.

use std::path::{Path, PathBuf};

pub(crate) fn header_path(sink_path: &Path) -> PathBuf {
    let mut p = sink_path.as_os_str().to_owned();
    p.push(".header");
    PathBuf::from(p)
}

/// Reads `Content-Length` from a previously written `<sinkPath>.header`
/// file. Tolerates partial/garbled contents — any parse failure is a cache
/// miss, not an error (§5: "readers must tolerate partial contents").
pub(crate) fn read_prior_content_length(sink_path: &Path) -> Option<u64> {
    let contents = std::fs::read_to_string(header_path(sink_path)).ok()?;
    contents.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("Content-Length") {
            value.trim().parse::<u64>().ok()
        } else {
            None
        }
    })
}

pub(crate) fn write_header_file(sink_path: &Path, content_length: u64) {
    let _ = std::fs::write(header_path(sink_path), format!("Content-Length: {content_length}\n"));
}

pub(crate) fn delete_partial(sink_path: &Path) {
    let _ = std::fs::remove_file(sink_path);
    let _ = std::fs::remove_file(header_path(sink_path));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_content_length() {
        let dir = tempfile::tempdir().unwrap();
        let sink_path = dir.path().join("fw.bin");
        write_header_file(&sink_path, 500);
        assert_eq!(read_prior_content_length(&sink_path), Some(500));
    }

    #[test]
    fn missing_header_is_none_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let sink_path = dir.path().join("fw.bin");
        assert_eq!(read_prior_content_length(&sink_path), None);
    }

    #[test]
    fn garbled_header_is_tolerated_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let sink_path = dir.path().join("fw.bin");
        std::fs::write(header_path(&sink_path), "not a header file\n").unwrap();
        assert_eq!(read_prior_content_length(&sink_path), None);
    }

    #[test]
    fn delete_partial_removes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink_path = dir.path().join("fw.bin");
        std::fs::write(&sink_path, b"partial").unwrap();
        write_header_file(&sink_path, 500);

        delete_partial(&sink_path);
        assert!(!sink_path.exists());
        assert!(!header_path(&sink_path).exists());
    }
}
