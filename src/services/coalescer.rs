//! Save coalescer: debounced, per-document content persistence.
//!
//! DESIGN
//! ======
//! Every edit overwrites the document's pending content and (re)arms a single
//! flush timer. When a document has been quiet for the configured period the
//! timer stores whatever content is pending at that moment, so a burst of
//! edits becomes one write carrying the last edit.
//!
//! Each document owns one `SaveSlot`. Its `timer` field holds at most one
//! `ScheduledFlush`; storing a new one drops the old, and dropping aborts the
//! old task. Generations guard against a timer that had already woken when it
//! was replaced.
//!
//! Writes for one document are serialized by the slot's flush lock. An edit
//! that lands while a write is in flight arms the next timer, which waits for
//! the lock before taking content. Nothing is dropped and nothing overlaps.
//!
//! ERROR HANDLING
//! ==============
//! A failed write is logged and the cycle ends. There is no retry; the next
//! edit starts a fresh cycle. Disconnects never cancel a pending save.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, error, info};

use crate::event::DocumentId;
use crate::services::document::DocumentStore;

// =============================================================================
// SLOT
// =============================================================================

/// Handle to an armed flush timer. Dropping it cancels the timer.
struct ScheduledFlush {
    generation: u64,
    handle: Option<AbortHandle>,
}

impl ScheduledFlush {
    /// Release the handle without cancelling. Used by the timer task itself
    /// once it has started flushing.
    fn disarm(mut self) {
        self.handle = None;
    }
}

impl Drop for ScheduledFlush {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

struct SaveSlot {
    /// Latest unflushed content.
    pending: Option<String>,
    /// Content handed to the store but not yet acknowledged.
    in_flight: Option<String>,
    timer: Option<ScheduledFlush>,
    flush_lock: Arc<Mutex<()>>,
}

impl SaveSlot {
    fn new() -> Self {
        Self { pending: None, in_flight: None, timer: None, flush_lock: Arc::new(Mutex::new(())) }
    }

    fn has_work(&self) -> bool {
        self.pending.is_some() || self.in_flight.is_some()
    }

    fn is_idle(&self) -> bool {
        !self.has_work() && self.timer.is_none() && Arc::strong_count(&self.flush_lock) == 1
    }
}

/// Drops a document's slot once nothing references it. Held by every
/// `flush` call, so the slot is also swept when a waiting timer is aborted.
struct IdleSweep<'a> {
    slots: &'a DashMap<DocumentId, SaveSlot>,
    document_id: &'a str,
}

impl Drop for IdleSweep<'_> {
    fn drop(&mut self) {
        self.slots.remove_if(self.document_id, |_, slot| slot.is_idle());
    }
}

// =============================================================================
// COALESCER
// =============================================================================

#[derive(Clone)]
pub struct SaveCoalescer {
    inner: Arc<CoalescerInner>,
}

struct CoalescerInner {
    store: Arc<dyn DocumentStore>,
    quiet_period: Duration,
    slots: DashMap<DocumentId, SaveSlot>,
    next_generation: AtomicU64,
}

impl SaveCoalescer {
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, quiet_period: Duration) -> Self {
        Self {
            inner: Arc::new(CoalescerInner {
                store,
                quiet_period,
                slots: DashMap::new(),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Record the latest content for a document and restart its quiet window.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn record_edit(&self, document_id: &str, content: String) {
        let replaced = {
            let mut slot = self
                .inner
                .slots
                .entry(document_id.to_owned())
                .or_insert_with(SaveSlot::new);
            slot.pending = Some(content);

            let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
            let inner = Arc::clone(&self.inner);
            let doc = document_id.to_owned();
            let task = tokio::spawn(async move {
                tokio::time::sleep(inner.quiet_period).await;
                inner.flush(&doc, Some(generation)).await;
            });
            slot.timer
                .replace(ScheduledFlush { generation, handle: Some(task.abort_handle()) })
        };

        // Aborts the previous timer, outside the slot lock.
        drop(replaced);
    }

    /// Unsaved content for a document, including a write still in flight.
    #[must_use]
    pub fn latest_content(&self, document_id: &str) -> Option<String> {
        let slot = self.inner.slots.get(document_id)?;
        slot.pending.clone().or_else(|| slot.in_flight.clone())
    }

    #[cfg(test)]
    pub fn has_pending(&self, document_id: &str) -> bool {
        self.inner
            .slots
            .get(document_id)
            .is_some_and(|slot| slot.has_work())
    }

    /// Number of documents with a pending or in-flight save.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner
            .slots
            .iter()
            .filter(|slot| slot.has_work())
            .count()
    }

    /// Store every pending document now, skipping the quiet window, and wait
    /// for writes already in flight.
    pub async fn flush_all(&self) {
        let documents: Vec<DocumentId> = self
            .inner
            .slots
            .iter()
            .filter(|slot| slot.has_work())
            .map(|slot| slot.key().clone())
            .collect();

        if documents.is_empty() {
            return;
        }
        info!(count = documents.len(), "flushing pending document saves");
        for document_id in documents {
            self.inner.flush(&document_id, None).await;
        }
    }
}

impl CoalescerInner {
    /// Take the slot's pending content and store it.
    ///
    /// `expected` is the generation of the timer doing the flush; `None`
    /// flushes unconditionally and cancels any armed timer.
    async fn flush(&self, document_id: &str, expected: Option<u64>) {
        // Declared first so it runs after the lock and its handle are released.
        let _sweep = IdleSweep { slots: &self.slots, document_id };

        let Some(flush_lock) = self
            .slots
            .get(document_id)
            .map(|slot| Arc::clone(&slot.flush_lock))
        else {
            return;
        };
        let _guard = flush_lock.lock().await;

        let (content, timer) = {
            let Some(mut slot) = self.slots.get_mut(document_id) else {
                return;
            };
            if let Some(generation) = expected {
                // Superseded after waking: the newer timer owns the content.
                if slot.timer.as_ref().map(|t| t.generation) != Some(generation) {
                    return;
                }
            }
            let content = slot.pending.take();
            slot.in_flight.clone_from(&content);
            (content, slot.timer.take())
        };
        match (timer, expected) {
            (Some(timer), Some(_)) => timer.disarm(),
            (timer, _) => drop(timer),
        }

        if let Some(content) = content {
            match self.store.store(document_id, &content).await {
                Ok(()) => debug!(%document_id, bytes = content.len(), "document content persisted"),
                Err(e) => error!(error = %e, %document_id, "document save failed; pending edits discarded"),
            }
        }

        if let Some(mut slot) = self.slots.get_mut(document_id) {
            slot.in_flight = None;
        }
    }
}

#[cfg(test)]
#[path = "coalescer_test.rs"]
mod tests;
