//! Line-oriented crawl checkpoints.
//!
//! The file holds exactly six newline-terminated lines:
//!
//! 1. origin URL
//! 2. origin authority
//! 3. visited pages, space separated
//! 4. known images, space separated
//! 5. link frontier, space separated, FIFO order
//! 6. image queue as `image|page` pairs, space separated, FIFO order

use crate::frontier::{CrawlState, ImageTask};
use std::collections::{HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

const LINE_COUNT: usize = 6;

/// Failure to write or read a checkpoint.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// No checkpoint exists at the path.
    #[error("checkpoint {} does not exist", .0.display())]
    Missing(PathBuf),
    /// Reading or writing the file failed.
    #[error("checkpoint io error at {}: {source}", path.display())]
    Io {
        /// File being accessed.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
    /// The file exists but does not describe a valid crawl state.
    #[error("malformed checkpoint (line {line}): {reason}")]
    Format {
        /// One-based line number, or 0 for whole-file problems.
        line: usize,
        /// What was wrong.
        reason: String,
    },
}

impl CheckpointError {
    fn format(line: usize, reason: impl Into<String>) -> Self {
        Self::Format {
            line,
            reason: reason.into(),
        }
    }

    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Renders `state` in checkpoint form.
pub fn encode(state: &CrawlState) -> String {
    let visited = join(state.visited().iter().map(String::as_str));
    let images = join(state.known_images().iter().map(String::as_str));
    let links = join(state.links().iter().map(String::as_str));
    let queue = state
        .image_queue()
        .iter()
        .map(|task| format!("{}|{}", task.image_url, task.page_url))
        .collect::<Vec<_>>()
        .join(" ");

    format!(
        "{}\n{}\n{visited}\n{images}\n{links}\n{queue}\n",
        state.origin(),
        state.host()
    )
}

fn join<'a>(items: impl Iterator<Item = &'a str>) -> String {
    items.collect::<Vec<_>>().join(" ")
}

/// Parses checkpoint text back into a state.
pub fn decode(text: &str) -> Result<CrawlState, CheckpointError> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() != LINE_COUNT {
        return Err(CheckpointError::format(
            0,
            format!("expected {LINE_COUNT} lines, found {}", lines.len()),
        ));
    }

    let origin = Url::parse(lines[0].trim())
        .map_err(|err| CheckpointError::format(1, format!("invalid origin url: {err}")))?;
    let host = lines[1].trim();
    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(CheckpointError::format(2, "origin host must be a single token"));
    }

    let visited: HashSet<String> = lines[2].split_whitespace().map(str::to_string).collect();
    let images: HashSet<String> = lines[3].split_whitespace().map(str::to_string).collect();

    let links: VecDeque<String> = lines[4].split_whitespace().map(str::to_string).collect();
    if let Some(stray) = links.iter().find(|link| !visited.contains(*link)) {
        return Err(CheckpointError::format(
            5,
            format!("frontier entry {stray} is missing from the visited set"),
        ));
    }

    let mut image_queue = VecDeque::new();
    for pair in lines[5].split_whitespace() {
        let (image_url, page_url) = pair
            .split_once('|')
            .filter(|(image, page)| !image.is_empty() && !page.is_empty() && !page.contains('|'))
            .ok_or_else(|| CheckpointError::format(6, format!("unparsable image pair {pair}")))?;
        if !images.contains(image_url) {
            return Err(CheckpointError::format(
                6,
                format!("queued image {image_url} is missing from the known-image set"),
            ));
        }
        image_queue.push_back(ImageTask::new(image_url, page_url));
    }

    Ok(CrawlState::from_parts(
        origin,
        host.to_string(),
        visited,
        images,
        links,
        image_queue,
    ))
}

/// Writes `state` to `path` through a temporary sibling file.
pub async fn save(path: &Path, state: &CrawlState) -> Result<(), CheckpointError> {
    let tmp = tmp_path(path);
    tokio::fs::write(&tmp, encode(state))
        .await
        .map_err(|err| CheckpointError::io(&tmp, err))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|err| CheckpointError::io(path, err))
}

/// Reads and parses the checkpoint at `path`.
pub async fn load(path: &Path) -> Result<CrawlState, CheckpointError> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => decode(&text),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            Err(CheckpointError::Missing(path.to_path_buf()))
        }
        Err(err) => Err(CheckpointError::io(path, err)),
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontier::FrontierStore;
    use pretty_assertions::assert_eq;

    fn populated() -> CrawlState {
        let mut state = CrawlState::new("https://example.com/").expect("seed");
        state.next_page();
        for name in ["a", "b", "c", "d"] {
            assert!(state.register_page(&format!("/{name}")));
        }
        state.next_page();
        for name in ["x", "y", "z"] {
            assert!(state.register_image(&format!("/{name}.png"), "https://example.com/a"));
        }
        state.next_image_task();
        state
    }

    #[test]
    fn round_trip_preserves_membership_and_order() {
        let state = populated();
        let restored = decode(&encode(&state)).expect("decode");
        assert_eq!(restored, state);
        assert_eq!(
            restored.links().iter().cloned().collect::<Vec<_>>(),
            vec![
                "https://example.com/b",
                "https://example.com/c",
                "https://example.com/d"
            ]
        );
        assert_eq!(
            restored.image_queue().front(),
            Some(&ImageTask::new("https://example.com/y.png", "https://example.com/a"))
        );
    }

    #[test]
    fn round_trip_of_exhausted_state() {
        let mut state = CrawlState::new("https://example.com/").expect("seed");
        state.next_page();
        let text = encode(&state);
        assert_eq!(text, "https://example.com/\nexample.com\nhttps://example.com/\n\n\n\n");
        assert_eq!(decode(&text).expect("decode"), state);
    }

    #[test]
    fn rejects_wrong_line_count() {
        let err = decode("https://example.com/\nexample.com\n\n\n\n").unwrap_err();
        assert!(matches!(err, CheckpointError::Format { line: 0, .. }));
    }

    #[test]
    fn rejects_unpaired_queue_entries() {
        let text = "https://example.com/\nexample.com\n\nhttps://example.com/a.png\n\nhttps://example.com/a.png\n";
        let err = decode(text).unwrap_err();
        assert!(matches!(err, CheckpointError::Format { line: 6, .. }));
    }

    #[test]
    fn rejects_unknown_queue_image() {
        let text = "https://example.com/\nexample.com\n\n\n\nhttps://example.com/a.png|https://example.com/\n";
        let err = decode(text).unwrap_err();
        assert!(matches!(err, CheckpointError::Format { line: 6, .. }));
    }

    #[test]
    fn rejects_unregistered_frontier_link() {
        let text = "https://example.com/\nexample.com\n\n\nhttps://example.com/a\n\n";
        let err = decode(text).unwrap_err();
        assert!(matches!(err, CheckpointError::Format { line: 5, .. }));
    }

    #[test]
    fn rejects_bad_origin() {
        let text = "not a url\nexample.com\n\n\n\n\n";
        let err = decode(text).unwrap_err();
        assert!(matches!(err, CheckpointError::Format { line: 1, .. }));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn missing_file_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = load(&dir.path().join("state.txt")).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Missing(_)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn store_checkpoint_and_restore() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.txt");
        let store = FrontierStore::new(populated());

        store.checkpoint(&path).await.expect("save");
        assert!(!dir.path().join("state.txt.tmp").exists());

        let restored = FrontierStore::restore(&path).await.expect("restore");
        assert_eq!(restored.snapshot().await, store.snapshot().await);
        assert_eq!(restored.next_page().await.as_deref(), Some("https://example.com/b"));
    }
}
