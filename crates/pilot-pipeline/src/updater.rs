//! Updater (spec §4.7): drains the update queue, coalesces updates into
//! ordered bulk operations per collection, and flushes on a time or size
//! threshold.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use pilot_store::{Collection, CoordinationStore};
use pilot_types::AgentError;

use crate::queues::UpdateRequest;

/// Default flush interval (spec §4.7: "flush on a timer, default 1.0s, or
/// when the batch reaches a size threshold").
pub const BULK_COLLECTION_TIME: Duration = Duration::from_secs(1);
/// Size threshold that forces an early flush regardless of the timer.
pub const BULK_COLLECTION_SIZE: usize = 256;
/// Bounded retries on a transient store failure before surfacing fatal.
const MAX_RETRIES: u32 = 3;

pub struct Updater<'a> {
    store: &'a dyn CoordinationStore,
    pending: BTreeMap<Collection, Vec<UpdateRequest>>,
    last_flush: Instant,
}

impl<'a> Updater<'a> {
    pub fn new(store: &'a dyn CoordinationStore) -> Self {
        Self { store, pending: BTreeMap::new(), last_flush: Instant::now() }
    }

    /// Drains whatever is currently queued without blocking, buffering by
    /// collection. Returns the number of requests absorbed.
    pub fn drain(&mut self, update_rx: &Receiver<UpdateRequest>) -> usize {
        let mut count = 0;
        while let Ok(req) = update_rx.try_recv() {
            self.pending.entry(req.collection).or_default().push(req);
            count += 1;
        }
        count
    }

    fn due(&self) -> bool {
        let size = self.pending.values().map(Vec::len).sum::<usize>();
        size >= BULK_COLLECTION_SIZE || (size > 0 && self.last_flush.elapsed() >= BULK_COLLECTION_TIME)
    }

    /// Flushes if a timer or size threshold has been crossed. Returns
    /// `true` if a flush happened.
    pub fn flush_if_due(&mut self) -> Result<bool, AgentError> {
        if !self.due() {
            return Ok(false);
        }
        self.flush()?;
        Ok(true)
    }

    /// Unconditional flush of every buffered collection, retrying each
    /// collection's bulk op up to `MAX_RETRIES` times before surfacing the
    /// failure as fatal (spec §4.7 "Failure modes": "store unreachable past
    /// retry budget fails the pilot").
    pub fn flush(&mut self) -> Result<(), AgentError> {
        let pending = std::mem::take(&mut self.pending);
        for (collection, requests) in pending {
            if requests.is_empty() {
                continue;
            }
            self.flush_collection(collection, requests)?;
        }
        self.last_flush = Instant::now();
        Ok(())
    }

    fn flush_collection(&self, collection: Collection, requests: Vec<UpdateRequest>) -> Result<(), AgentError> {
        let mut attempt = 0;
        loop {
            let mut bulk = self.store.bulk(collection);
            for req in &requests {
                bulk.find_update(req.query.clone(), req.update.clone());
            }
            match bulk.execute() {
                Ok(modified) => {
                    tracing::debug!(target: "updater", ?collection, requests = requests.len(), modified, "flushed");
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= MAX_RETRIES {
                        tracing::error!(target: "updater", ?collection, error = %e, "store_unreachable_exhausted_retries");
                        return Err(e);
                    }
                    tracing::warn!(target: "updater", ?collection, attempt, error = %e, "retrying_flush");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use pilot_store::{InMemoryStore, Query, Update};
    use pilot_types::{CuDescription, CuRecord};

    fn doc(store: &InMemoryStore, uid: &str) {
        let mut d = pilot_store::Document::new();
        d.insert("uid".into(), uid.into());
        d.insert("state".into(), "New".into());
        store.insert(Collection::Units, d);
    }

    #[test]
    fn drain_buffers_by_collection() {
        let store = InMemoryStore::new();
        let mut updater = Updater::new(&store);
        let (tx, rx) = unbounded();
        let record = CuRecord::new(CuDescription { uid: "cu.0001".into(), ..Default::default() }, 0);
        tx.send(UpdateRequest::cu_state(&record)).unwrap();
        drop(tx);
        let count = updater.drain(&rx);
        assert_eq!(count, 1);
        assert_eq!(updater.pending.get(&Collection::Units).map(Vec::len), Some(1));
    }

    #[test]
    fn flush_applies_bulk_update_to_store() {
        let store = InMemoryStore::new();
        doc(&store, "cu.0001");
        let mut updater = Updater::new(&store);
        let (tx, rx) = unbounded();
        let mut record = CuRecord::new(CuDescription { uid: "cu.0001".into(), ..Default::default() }, 0);
        record.transition(pilot_types::CuState::PendingExecution, 1).unwrap();
        tx.send(UpdateRequest::cu_state(&record)).unwrap();
        drop(tx);
        updater.drain(&rx);
        updater.flush().unwrap();

        let found = store.find(Collection::Units, &Query::new().eq("uid", "cu.0001")).unwrap();
        assert_eq!(found[0].get("state").unwrap(), "PendingExecution");
    }

    #[test]
    fn flush_if_due_waits_for_size_or_timer() {
        let store = InMemoryStore::new();
        let mut updater = Updater::new(&store);
        let (tx, rx) = unbounded();
        let record = CuRecord::new(CuDescription { uid: "cu.0001".into(), ..Default::default() }, 0);
        tx.send(UpdateRequest::cu_state(&record)).unwrap();
        drop(tx);
        updater.drain(&rx);
        assert!(!updater.flush_if_due().unwrap());
    }

    #[test]
    fn noop_update_set_is_harmless() {
        let _ = Update::new().set("noop", "x");
    }
}
