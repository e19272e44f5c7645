//! Conversation thread resolution
//!
//! Threads are derived, never persisted: starting from one entry, the
//! resolver walks `parent_id` links upward and returns the chain in
//! traversal order, requested entry first and oldest ancestor last.
//!
//! Parent links are weak references, so the walk tolerates whatever the
//! data holds: a dangling link ends the thread, a cycle ends it through
//! the visited set, and the length never exceeds `max_depth`. None of
//! these are errors; the partial thread is the answer.

use crate::entry::MemoryEntry;
use crate::provider::Provider;
use crate::Result;
use std::collections::HashSet;

/// Walk parent links from `start_id`, collecting at most `max_depth` entries
pub async fn resolve<P>(provider: &P, start_id: i64, max_depth: usize) -> Result<Vec<MemoryEntry>>
where
    P: Provider + ?Sized,
{
    let mut thread = Vec::new();
    let mut visited: HashSet<i64> = HashSet::new();
    let mut current = Some(start_id);

    while let Some(id) = current {
        if thread.len() >= max_depth || !visited.insert(id) {
            break;
        }
        match provider.fetch(id).await? {
            Some(entry) => {
                current = entry.parent_id;
                thread.push(entry);
            }
            None => break,
        }
    }
    Ok(thread)
}
