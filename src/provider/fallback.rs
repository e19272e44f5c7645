//! Flat-file fallback store
//!
//! Append-only NDJSON persistence: one serialized entry per line.
//! Deliberately simple (linear scans, token-overlap match scores, a
//! single in-process writer) and it never needs a server to be up.
//!
//! Writes serialize through one write guard. Deletes rewrite the file
//! through a temp file in the same directory and atomically persist it
//! over the original, so readers never observe a half-rewritten store.

use crate::entry::{DeleteFilter, MemoryEntry, NewEntry};
use crate::provider::{Candidate, Provider};
use crate::rank;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug)]
struct FallbackState {
    next_id: i64,
}

/// NDJSON-backed provider, always available.
#[derive(Debug)]
pub struct FallbackProvider {
    path: PathBuf,
    state: RwLock<FallbackState>,
}

impl FallbackProvider {
    /// Open (or create) the store at `path`.
    ///
    /// The id counter resumes from the highest id already on disk, so
    /// ids stay monotonic across reopen.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let max_id = read_entries(path)?.iter().map(|e| e.id).max().unwrap_or(0);
        Ok(Self {
            path: path.to_path_buf(),
            state: RwLock::new(FallbackState {
                next_id: max_id + 1,
            }),
        })
    }

    fn read_guard(&self) -> Result<RwLockReadGuard<'_, FallbackState>> {
        self.state
            .read()
            .map_err(|_| Error::Provider("fallback store lock poisoned".to_string()))
    }

    fn write_guard(&self) -> Result<RwLockWriteGuard<'_, FallbackState>> {
        self.state
            .write()
            .map_err(|_| Error::Provider("fallback store lock poisoned".to_string()))
    }

    /// All readable entries, under the shared read guard
    fn read_all(&self) -> Result<Vec<MemoryEntry>> {
        let _guard = self.read_guard()?;
        read_entries(&self.path)
    }
}

fn materialize(new: &NewEntry, id: i64, created_at: DateTime<Utc>) -> MemoryEntry {
    MemoryEntry {
        id,
        agent_name: new.agent_name.clone(),
        task: new.task.clone(),
        response: new.response.clone(),
        success_rating: new.success_rating,
        model_used: new.model_or_default().to_string(),
        tokens_used: new.tokens_used,
        created_at,
        metadata: new.metadata_or_default(),
        parent_id: new.parent_id,
    }
}

/// Read every entry line, skipping unreadable ones with a warning
fn read_entries(path: &Path) -> Result<Vec<MemoryEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut entries = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<MemoryEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(err) => {
                tracing::warn!(line = index + 1, error = %err, "skipping unreadable entry line");
            }
        }
    }
    Ok(entries)
}

/// Append serialized entries as one write.
///
/// Lines are serialized into a buffer first, and a failed write rolls
/// the file back to its prior length, so a torn batch never persists.
fn append_entries(path: &Path, entries: &[MemoryEntry]) -> Result<()> {
    let mut buf = Vec::new();
    for entry in entries {
        serde_json::to_writer(&mut buf, entry)?;
        buf.push(b'\n');
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let start_len = file.metadata()?.len();
    if let Err(err) = file.write_all(&buf) {
        let _ = file.set_len(start_len);
        return Err(err.into());
    }
    Ok(())
}

/// Replace the file contents through an atomic temp-file swap
fn rewrite_entries(path: &Path, entries: &[MemoryEntry]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        for entry in entries {
            serde_json::to_writer(&mut writer, entry)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
    }
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[async_trait]
impl Provider for FallbackProvider {
    async fn insert(&self, new: &NewEntry) -> Result<MemoryEntry> {
        let mut state = self.write_guard()?;
        let entry = materialize(new, state.next_id, Utc::now());
        append_entries(&self.path, std::slice::from_ref(&entry))?;
        state.next_id += 1;
        Ok(entry)
    }

    async fn insert_batch(&self, batch: &[NewEntry]) -> Result<Vec<MemoryEntry>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let mut state = self.write_guard()?;
        let now = Utc::now();
        let entries: Vec<MemoryEntry> = batch
            .iter()
            .enumerate()
            .map(|(offset, new)| materialize(new, state.next_id + offset as i64, now))
            .collect();
        // the counter only advances once every line is on disk
        append_entries(&self.path, &entries)?;
        state.next_id += batch.len() as i64;
        Ok(entries)
    }

    async fn fetch(&self, id: i64) -> Result<Option<MemoryEntry>> {
        Ok(self.read_all()?.into_iter().find(|e| e.id == id))
    }

    async fn query(&self, text: &str, candidate_limit: usize) -> Result<Vec<Candidate>> {
        let entries = self.read_all()?;
        let mut candidates: Vec<Candidate> = entries
            .into_iter()
            .filter_map(|entry| {
                let haystack = format!("{} {}", entry.task, entry.response);
                let match_score = rank::token_overlap(text, &haystack);
                if match_score > 0.0 {
                    Some(Candidate { entry, match_score })
                } else {
                    None
                }
            })
            .collect();

        // strongest textual matches first, so truncation keeps the
        // candidates worth ranking
        candidates.sort_by(|a, b| {
            b.match_score
                .partial_cmp(&a.match_score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.entry.created_at.cmp(&a.entry.created_at))
        });
        candidates.truncate(candidate_limit);
        Ok(candidates)
    }

    async fn scan(&self) -> Result<Vec<MemoryEntry>> {
        self.read_all()
    }

    async fn delete_where(&self, filter: &DeleteFilter) -> Result<u64> {
        if filter.is_empty() {
            return Ok(0);
        }
        let _state = self.write_guard()?;
        let now = Utc::now();
        let entries = read_entries(&self.path)?;
        let (removed, kept): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|e| filter.matches(e, now));
        if removed.is_empty() {
            return Ok(0);
        }
        rewrite_entries(&self.path, &kept)?;
        tracing::debug!(removed = removed.len(), kept = kept.len(), "rewrote fallback store");
        Ok(removed.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn provider_in(dir: &tempfile::TempDir) -> FallbackProvider {
        FallbackProvider::open(&dir.path().join("entries.jsonl")).unwrap()
    }

    fn sample(task: &str, rating: u8) -> NewEntry {
        NewEntry::new("helper", task, "a response worth keeping", rating)
    }

    #[tokio::test]
    async fn test_insert_assigns_monotonic_ids() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider_in(&dir);

        let first = provider.insert(&sample("first task", 3)).await.unwrap();
        let second = provider.insert(&sample("second task", 4)).await.unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);

        let entry = provider.fetch(second.id).await.unwrap().unwrap();
        assert_eq!(entry.task, "second task");
        assert_eq!(entry.model_used, "unknown");
    }

    #[tokio::test]
    async fn test_insert_returns_the_persisted_entry() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider_in(&dir);

        let new = NewEntry::new("helper", "archive the report", "done", 4)
            .with_model("gpt-4-turbo")
            .with_tokens(450)
            .with_parent(17);
        let inserted = provider.insert(&new).await.unwrap();

        // what the caller gets back is exactly what a fresh read sees
        let fetched = provider.fetch(inserted.id).await.unwrap().unwrap();
        assert_eq!(inserted, fetched);
        assert_eq!(inserted.model_used, "gpt-4-turbo");
        assert_eq!(inserted.parent_id, Some(17));
    }

    #[tokio::test]
    async fn test_ids_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entries.jsonl");

        let provider = FallbackProvider::open(&path).unwrap();
        provider.insert(&sample("first", 3)).await.unwrap();
        provider.insert(&sample("second", 3)).await.unwrap();
        drop(provider);

        let reopened = FallbackProvider::open(&path).unwrap();
        let entry = reopened.insert(&sample("third", 3)).await.unwrap();
        assert_eq!(entry.id, 3);
    }

    #[tokio::test]
    async fn test_query_scores_token_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider_in(&dir);

        provider
            .insert(&NewEntry::new("helper", "Analyze Q3 sales data", "Revenue grew 12%", 5))
            .await
            .unwrap();
        provider
            .insert(&NewEntry::new("helper", "Summarize meeting notes", "Three action items", 3))
            .await
            .unwrap();

        let candidates = provider.query("Q3 sales", 10).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].entry.task, "Analyze Q3 sales data");
        assert_eq!(candidates[0].match_score, 1.0);

        // matches in the response count too
        let candidates = provider.query("revenue", 10).await.unwrap();
        assert_eq!(candidates.len(), 1);
    }

    #[tokio::test]
    async fn test_query_respects_candidate_limit() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider_in(&dir);
        for i in 0..5 {
            provider.insert(&sample(&format!("shared topic {}", i), 3)).await.unwrap();
        }
        let candidates = provider.query("topic", 2).await.unwrap();
        assert_eq!(candidates.len(), 2);
    }

    #[tokio::test]
    async fn test_insert_batch_is_contiguous() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider_in(&dir);

        let entries = provider
            .insert_batch(&[sample("a", 1), sample("b", 2), sample("c", 3)])
            .await
            .unwrap();
        let ids: Vec<i64> = entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(provider.scan().await.unwrap().len(), 3);

        assert!(provider.insert_batch(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_where_returns_exact_count() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider_in(&dir);

        provider.insert(&sample("keep me", 5)).await.unwrap();
        provider.insert(&sample("drop me", 1)).await.unwrap();
        provider.insert(&sample("drop me too", 1)).await.unwrap();

        let removed = provider
            .delete_where(&DeleteFilter::new().rating_below(2))
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let remaining = provider.scan().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].task, "keep me");

        // nothing left to remove
        let removed = provider
            .delete_where(&DeleteFilter::new().rating_below(2))
            .await
            .unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn test_delete_preserves_untouched_entries() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider_in(&dir);

        let kept = NewEntry::new("helper", "keep", "kept response", 5)
            .with_model("gpt-4-turbo")
            .with_tokens(42)
            .with_metadata(serde_json::json!({"tag": "important"}))
            .with_parent(99);
        let kept_id = provider.insert(&kept).await.unwrap().id;
        provider.insert(&sample("drop", 1)).await.unwrap();

        provider
            .delete_where(&DeleteFilter::new().rating_below(2))
            .await
            .unwrap();

        let entry = provider.fetch(kept_id).await.unwrap().unwrap();
        assert_eq!(entry.model_used, "gpt-4-turbo");
        assert_eq!(entry.tokens_used, 42);
        assert_eq!(entry.metadata["tag"], "important");
        assert_eq!(entry.parent_id, Some(99));
    }

    #[tokio::test]
    async fn test_unreadable_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entries.jsonl");

        let provider = FallbackProvider::open(&path).unwrap();
        provider.insert(&sample("valid", 3)).await.unwrap();
        drop(provider);

        // corrupt the file with a non-JSON line and a blank line
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"not json at all\n\n").unwrap();

        let reopened = FallbackProvider::open(&path).unwrap();
        let entries = reopened.scan().await.unwrap();
        assert_eq!(entries.len(), 1);

        // inserts still work and ids continue from the readable max
        let entry = reopened.insert(&sample("after corruption", 3)).await.unwrap();
        assert_eq!(entry.id, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_inserts_lose_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(provider_in(&dir));

        let mut handles = Vec::new();
        for i in 0..16 {
            let provider = Arc::clone(&provider);
            handles.push(tokio::spawn(async move {
                provider.insert(&sample(&format!("task {}", i), 3)).await.unwrap().id
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 16);
        assert_eq!(provider.scan().await.unwrap().len(), 16);
    }
}
