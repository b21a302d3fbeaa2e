//! Coordination store client (spec §6): the core only needs the interface —
//! the real store and the client-side pilot/unit manager are out of scope
//! (spec §2 Non-goals). `CoordinationStore` names the operations the agent
//! drives against it; [`InMemoryStore`] is a reference implementation used
//! by tests so the pipeline crate can be exercised without a live database.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde_json::Value;

use pilot_types::AgentError;

/// A single document is never allowed to exceed this size (spec §6).
pub const MAX_DOCUMENT_BYTES: usize = 16 * 1024 * 1024;
/// The `slothistory` field specifically is capped at this size (spec §6,
/// §4.2 "bounded history (cap: 4 MiB serialized, overwrite-last when full)").
pub const MAX_SLOTHISTORY_BYTES: usize = 4 * 1024 * 1024;

/// The three logical collections, keyed by session id (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Collection {
    /// `.p` — pilot documents.
    Pilots,
    /// `.cu` — compute unit documents.
    Units,
    /// `.w` — misc/worker bookkeeping documents.
    Misc,
}

impl Collection {
    pub fn suffix(&self) -> &'static str {
        match self {
            Collection::Pilots => ".p",
            Collection::Units => ".cu",
            Collection::Misc => ".w",
        }
    }
}

pub type Document = BTreeMap<String, Value>;

/// An equality-filter query over document fields. Sufficient for every
/// query pattern the agent issues (match by uid, by pilot id, by state).
#[derive(Debug, Clone, Default)]
pub struct Query(pub BTreeMap<String, Value>);

impl Query {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    fn matches(&self, doc: &Document) -> bool {
        self.0.iter().all(|(k, v)| doc.get(k) == Some(v))
    }
}

/// A field-set update (the store's analogue of Mongo's `$set`).
#[derive(Debug, Clone, Default)]
pub struct Update(pub BTreeMap<String, Value>);

impl Update {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    fn apply(&self, doc: &mut Document) {
        for (k, v) in &self.0 {
            doc.insert(k.clone(), v.clone());
        }
    }
}

fn check_size(doc: &Document) -> Result<(), AgentError> {
    let bytes = serde_json::to_vec(doc).map(|v| v.len()).unwrap_or(0);
    if bytes > MAX_DOCUMENT_BYTES {
        return Err(AgentError::StoreUnreachable(format!(
            "document exceeds {MAX_DOCUMENT_BYTES} byte cap ({bytes} bytes)"
        )));
    }
    if let Some(Value::String(s)) = doc.get("slothistory") {
        if s.len() > MAX_SLOTHISTORY_BYTES {
            return Err(AgentError::StoreUnreachable("slothistory exceeds 4 MiB cap".into()));
        }
    }
    Ok(())
}

/// One step of an ordered bulk operation: `.find(q).update(u)`.
pub struct BulkStep {
    pub query: Query,
    pub update: Update,
}

/// `.find(q).update(u)` ... `.execute()` (spec §6 "ordered bulk op
/// abstraction").
pub trait BulkOp {
    fn find_update(&mut self, query: Query, update: Update);
    fn execute(self: Box<Self>) -> Result<u64, AgentError>;
}

pub trait CoordinationStore: Send + Sync {
    fn find_and_modify(
        &self,
        collection: Collection,
        query: &Query,
        update: &Update,
    ) -> Result<Option<Document>, AgentError>;

    /// `find(query).stream()`, collapsed to an eager `Vec` since the agent
    /// always drains the cursor immediately on the calling thread.
    fn find(&self, collection: Collection, query: &Query) -> Result<Vec<Document>, AgentError>;

    fn update(&self, collection: Collection, query: &Query, update: &Update) -> Result<u64, AgentError>;

    fn bulk(&self, collection: Collection) -> Box<dyn BulkOp + '_>;
}

/// Reference in-memory implementation. Not persistent: restart semantics
/// (spec §6 "the agent may restart and rebuild in-memory state from it")
/// apply to the real store, not this test double.
#[derive(Default)]
pub struct InMemoryStore {
    pilots: Mutex<Vec<Document>>,
    units: Mutex<Vec<Document>>,
    misc: Mutex<Vec<Document>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, collection: Collection, doc: Document) {
        self.lock(collection).push(doc);
    }

    fn lock(&self, collection: Collection) -> std::sync::MutexGuard<'_, Vec<Document>> {
        match collection {
            Collection::Pilots => self.pilots.lock().unwrap(),
            Collection::Units => self.units.lock().unwrap(),
            Collection::Misc => self.misc.lock().unwrap(),
        }
    }
}

impl CoordinationStore for InMemoryStore {
    fn find_and_modify(
        &self,
        collection: Collection,
        query: &Query,
        update: &Update,
    ) -> Result<Option<Document>, AgentError> {
        let mut docs = self.lock(collection);
        if let Some(doc) = docs.iter_mut().find(|d| query.matches(d)) {
            update.apply(doc);
            check_size(doc)?;
            return Ok(Some(doc.clone()));
        }
        Ok(None)
    }

    fn find(&self, collection: Collection, query: &Query) -> Result<Vec<Document>, AgentError> {
        let docs = self.lock(collection);
        Ok(docs.iter().filter(|d| query.matches(d)).cloned().collect())
    }

    fn update(&self, collection: Collection, query: &Query, update: &Update) -> Result<u64, AgentError> {
        let mut docs = self.lock(collection);
        let mut count = 0u64;
        for doc in docs.iter_mut().filter(|d| query.matches(d)) {
            update.apply(doc);
            check_size(doc)?;
            count += 1;
        }
        Ok(count)
    }

    fn bulk(&self, collection: Collection) -> Box<dyn BulkOp + '_> {
        Box::new(InMemoryBulk { store: self, collection, steps: Vec::new() })
    }
}

struct InMemoryBulk<'a> {
    store: &'a InMemoryStore,
    collection: Collection,
    steps: Vec<BulkStep>,
}

impl<'a> BulkOp for InMemoryBulk<'a> {
    fn find_update(&mut self, query: Query, update: Update) {
        self.steps.push(BulkStep { query, update });
    }

    fn execute(self: Box<Self>) -> Result<u64, AgentError> {
        let mut total = 0u64;
        for step in &self.steps {
            total += self.store.update(self.collection, &step.query, &step.update)?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(uid: &str, state: &str) -> Document {
        let mut d = Document::new();
        d.insert("uid".into(), Value::String(uid.into()));
        d.insert("state".into(), Value::String(state.into()));
        d
    }

    #[test]
    fn find_and_modify_updates_matching_document() {
        let store = InMemoryStore::new();
        store.insert(Collection::Units, doc("cu.0001", "NEW"));
        let result = store
            .find_and_modify(
                Collection::Units,
                &Query::new().eq("uid", "cu.0001"),
                &Update::new().set("state", "EXECUTING"),
            )
            .unwrap();
        assert_eq!(result.unwrap().get("state").unwrap(), "EXECUTING");
    }

    #[test]
    fn find_filters_by_query() {
        let store = InMemoryStore::new();
        store.insert(Collection::Units, doc("cu.0001", "PENDING_EXECUTION"));
        store.insert(Collection::Units, doc("cu.0002", "DONE"));
        let pending = store.find(Collection::Units, &Query::new().eq("state", "PENDING_EXECUTION")).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].get("uid").unwrap(), "cu.0001");
    }

    #[test]
    fn bulk_executes_ordered_updates() {
        let store = InMemoryStore::new();
        store.insert(Collection::Units, doc("cu.0001", "NEW"));
        store.insert(Collection::Units, doc("cu.0002", "NEW"));
        let mut bulk = store.bulk(Collection::Units);
        bulk.find_update(Query::new().eq("uid", "cu.0001"), Update::new().set("state", "DONE"));
        bulk.find_update(Query::new().eq("uid", "cu.0002"), Update::new().set("state", "FAILED"));
        let modified = bulk.execute().unwrap();
        assert_eq!(modified, 2);
        let all = store.find(Collection::Units, &Query::new()).unwrap();
        assert!(all.iter().any(|d| d.get("state").unwrap() == "DONE"));
        assert!(all.iter().any(|d| d.get("state").unwrap() == "FAILED"));
    }

    #[test]
    fn oversized_document_is_rejected() {
        let store = InMemoryStore::new();
        store.insert(Collection::Misc, doc("w.0001", "NEW"));
        let huge = "x".repeat(MAX_DOCUMENT_BYTES + 1);
        let err = store
            .find_and_modify(Collection::Misc, &Query::new().eq("uid", "w.0001"), &Update::new().set("blob", huge))
            .unwrap_err();
        assert!(matches!(err, AgentError::StoreUnreachable(_)));
    }
}
