//! In-memory vector store with brute-force cosine top-K search.
//!
//! One linear scan per query feeds a bounded heap of size `limit`. No
//! pruning or early termination: results are a pure function of the store
//! contents, the query, `limit` and `threshold`.
//!
//! The first upsert fixes the store dimension. Records of another dimension
//! are kept but flagged; search skips any record whose dimension differs
//! from the query and logs each distinct mismatch once.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use encore_settings::SearchSettings;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::normalize::cosine_similarity;

/// A stored record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    /// Caller-supplied id, unique within the store.
    pub id: String,
    /// Embedding vector.
    pub vector: Vec<f32>,
    /// Opaque caller metadata.
    pub payload: serde_json::Value,
}

/// One search result.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SearchHit {
    /// Record id.
    pub id: String,
    /// Cosine similarity to the query.
    pub score: f32,
    /// Record payload.
    pub payload: serde_json::Value,
}

/// Query parameters for [`VectorStore::search_with`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct SearchParams {
    /// Maximum hits.
    pub limit: usize,
    /// Minimum cosine similarity.
    pub threshold: f32,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self::from_settings(&SearchSettings::default())
    }
}

impl SearchParams {
    /// Build from the `search` settings section.
    pub fn from_settings(settings: &SearchSettings) -> Self {
        Self {
            limit: settings.default_limit,
            threshold: settings.default_threshold,
        }
    }
}

#[derive(Debug)]
struct Entry {
    record: VectorRecord,
    /// Insertion sequence; a replacement keeps the original value.
    seq: u64,
    flagged: bool,
}

/// Heap element ordered so the *worst* candidate is the maximum.
#[derive(Debug)]
struct Candidate {
    score: f32,
    seq: u64,
    slot: usize,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

/// In-memory id → (vector, payload) map answering cosine top-K queries.
///
/// Shared as `Arc<parking_lot::Mutex<VectorStore>>`; the embedding task
/// manager is the only writer.
#[derive(Debug, Default)]
pub struct VectorStore {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
    dimension: Option<usize>,
    next_seq: u64,
    warned_mismatches: Mutex<HashSet<(usize, usize)>>,
}

impl VectorStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record.
    pub fn upsert(&mut self, id: impl Into<String>, vector: Vec<f32>, payload: serde_json::Value) {
        let id = id.into();
        let dimension = *self.dimension.get_or_insert(vector.len());
        let flagged = vector.len() != dimension;
        if flagged {
            debug!(id = %id, expected = dimension, actual = vector.len(), "flagging record with mismatched dimension");
        }

        let record = VectorRecord {
            id: id.clone(),
            vector,
            payload,
        };
        if let Some(&slot) = self.index.get(&id) {
            let entry = &mut self.entries[slot];
            entry.record = record;
            entry.flagged = flagged;
        } else {
            let seq = self.next_seq;
            self.next_seq += 1;
            let _ = self.index.insert(id, self.entries.len());
            self.entries.push(Entry {
                record,
                seq,
                flagged,
            });
        }
    }

    /// Remove a record. Returns whether it existed.
    pub fn delete(&mut self, id: &str) -> bool {
        let Some(slot) = self.index.remove(id) else {
            return false;
        };
        let _ = self.entries.swap_remove(slot);
        if let Some(moved) = self.entries.get(slot) {
            let _ = self.index.insert(moved.record.id.clone(), slot);
        }
        true
    }

    /// Remove all records and forget the dimension.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.dimension = None;
        self.warned_mismatches.lock().clear();
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Dimension fixed by the first upsert.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// Look up a record.
    pub fn get(&self, id: &str) -> Option<&VectorRecord> {
        self.index.get(id).map(|&slot| &self.entries[slot].record)
    }

    /// Whether `id` is stored.
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Number of records whose dimension differs from the store's.
    pub fn flagged_count(&self) -> usize {
        self.entries.iter().filter(|e| e.flagged).count()
    }

    /// Up to `limit` records with similarity `>= threshold`, best first.
    ///
    /// Ties keep insertion order. An empty query or `limit == 0` yields no
    /// results; `f32::NEG_INFINITY` admits every comparable record. Scores
    /// of NaN or infinite vectors rank as `0`.
    pub fn search(&self, query: &[f32], limit: usize, threshold: f32) -> Vec<SearchHit> {
        if query.is_empty() || limit == 0 || self.entries.is_empty() {
            return Vec::new();
        }

        let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(limit.min(self.entries.len()) + 1);
        for (slot, entry) in self.entries.iter().enumerate() {
            let record_dim = entry.record.vector.len();
            if record_dim != query.len() {
                self.warn_mismatch_once(query.len(), record_dim);
                continue;
            }
            let score = cosine_similarity(query, &entry.record.vector);
            // normalize -0.0 so total_cmp treats it as 0
            let score = if score == 0.0 { 0.0 } else { score };
            if score < threshold {
                continue;
            }
            heap.push(Candidate {
                score,
                seq: entry.seq,
                slot,
            });
            if heap.len() > limit {
                let _ = heap.pop();
            }
        }

        heap.into_sorted_vec()
            .into_iter()
            .map(|c| {
                let record = &self.entries[c.slot].record;
                SearchHit {
                    id: record.id.clone(),
                    score: c.score,
                    payload: record.payload.clone(),
                }
            })
            .collect()
    }

    /// [`search`](Self::search) with a params struct.
    pub fn search_with(&self, query: &[f32], params: &SearchParams) -> Vec<SearchHit> {
        self.search(query, params.limit, params.threshold)
    }

    fn warn_mismatch_once(&self, query_dim: usize, record_dim: usize) {
        if self.warned_mismatches.lock().insert((query_dim, record_dim)) {
            warn!(query_dim, record_dim, "dimension mismatch: skipping records in search");
        }
    }
}
