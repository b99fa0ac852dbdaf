//! Store boundary.
//!
//! The orchestrator only ever talks to `ReconcileStore`, so the persistent
//! backend can be swapped for a test double. `InMemoryStore` is both that
//! double and a usable demo backend. A SQL-backed implementation should wrap
//! the three confirm writes (payment allocation, transaction update, history
//! append) in a single transaction; the in-memory store applies the document
//! mutation atomically under one lock.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{ReconcileError, Result};
use crate::schema::{Document, MatchHistory, PaymentStatus, Transaction, TransactionStatus, VendorPattern};

#[async_trait]
pub trait ReconcileStore: Send + Sync {
    /// Open (not fully paid) documents for an owner.
    async fn open_documents(&self, owner_id: &str) -> Result<Vec<Document>>;

    /// Unmatched transactions for an owner, optionally restricted to
    /// specific ids, capped at `limit`.
    async fn unmatched_transactions(
        &self,
        owner_id: &str,
        ids: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<Transaction>>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    async fn get_transaction(&self, id: &str) -> Result<Option<Transaction>>;

    async fn update_transaction(&self, tx: &Transaction) -> Result<()>;

    /// Allocate a payment against a document: increments `amount_paid`,
    /// decrements `amount_remaining` (never below zero), recomputes the
    /// payment status, and returns the updated row.
    async fn apply_payment(&self, document_id: &str, amount: f64) -> Result<Document>;

    async fn patterns_for_owner(&self, owner_id: &str) -> Result<Vec<VendorPattern>>;

    /// Insert or replace the pattern keyed by (owner, vendor name).
    async fn upsert_pattern(&self, pattern: &VendorPattern) -> Result<()>;

    async fn append_history(&self, record: &MatchHistory) -> Result<()>;
}

#[derive(Default)]
struct InMemoryState {
    documents: HashMap<String, Document>,
    transactions: HashMap<String, Transaction>,
    patterns: HashMap<(String, String), VendorPattern>,
    history: Vec<MatchHistory>,
}

/// Hash-map backed store used by the tests and as a standalone demo backend.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<InMemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(documents: Vec<Document>, transactions: Vec<Transaction>) -> Self {
        let store = Self::new();
        {
            let mut state = store.state.lock().expect("store lock poisoned");
            for d in documents {
                state.documents.insert(d.id.clone(), d);
            }
            for t in transactions {
                state.transactions.insert(t.id.clone(), t);
            }
        }
        store
    }

    pub fn history(&self) -> Vec<MatchHistory> {
        self.state.lock().expect("store lock poisoned").history.clone()
    }

    pub fn get_transaction(&self, id: &str) -> Option<Transaction> {
        self.state
            .lock()
            .expect("store lock poisoned")
            .transactions
            .get(id)
            .cloned()
    }

    pub fn pattern(&self, owner_id: &str, vendor_name: &str) -> Option<VendorPattern> {
        self.state
            .lock()
            .expect("store lock poisoned")
            .patterns
            .get(&(owner_id.to_string(), vendor_name.to_lowercase()))
            .cloned()
    }
}

#[async_trait]
impl ReconcileStore for InMemoryStore {
    async fn open_documents(&self, owner_id: &str) -> Result<Vec<Document>> {
        let state = self.state.lock().expect("store lock poisoned");
        let mut docs: Vec<Document> = state
            .documents
            .values()
            .filter(|d| d.owner_id == owner_id && d.payment_status != PaymentStatus::Paid)
            .cloned()
            .collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(docs)
    }

    async fn unmatched_transactions(
        &self,
        owner_id: &str,
        ids: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        let state = self.state.lock().expect("store lock poisoned");
        let mut txs: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|t| {
                t.owner_id == owner_id
                    && t.status == TransactionStatus::Unmatched
                    && ids.map_or(true, |wanted| wanted.contains(&t.id))
            })
            .cloned()
            .collect();
        txs.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
        txs.truncate(limit);
        Ok(txs)
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let state = self.state.lock().expect("store lock poisoned");
        Ok(state.documents.get(id).cloned())
    }

    async fn get_transaction(&self, id: &str) -> Result<Option<Transaction>> {
        let state = self.state.lock().expect("store lock poisoned");
        Ok(state.transactions.get(id).cloned())
    }

    async fn update_transaction(&self, tx: &Transaction) -> Result<()> {
        let mut state = self.state.lock().expect("store lock poisoned");
        state.transactions.insert(tx.id.clone(), tx.clone());
        Ok(())
    }

    async fn apply_payment(&self, document_id: &str, amount: f64) -> Result<Document> {
        let mut state = self.state.lock().expect("store lock poisoned");
        let doc = state
            .documents
            .get_mut(document_id)
            .ok_or_else(|| ReconcileError::StoreError(format!("unknown document: {}", document_id)))?;

        doc.amount_paid += amount;
        let remaining = doc.amount_remaining - amount;
        doc.payment_status = PaymentStatus::from_remaining(remaining, doc.total);
        // Transient negatives are clamped for storage.
        doc.amount_remaining = remaining.max(0.0);
        Ok(doc.clone())
    }

    async fn patterns_for_owner(&self, owner_id: &str) -> Result<Vec<VendorPattern>> {
        let state = self.state.lock().expect("store lock poisoned");
        let mut patterns: Vec<VendorPattern> = state
            .patterns
            .values()
            .filter(|p| p.owner_id == owner_id)
            .cloned()
            .collect();
        patterns.sort_by(|a, b| a.vendor_name.cmp(&b.vendor_name));
        Ok(patterns)
    }

    async fn upsert_pattern(&self, pattern: &VendorPattern) -> Result<()> {
        let mut state = self.state.lock().expect("store lock poisoned");
        state.patterns.insert(
            (pattern.owner_id.clone(), pattern.vendor_name.to_lowercase()),
            pattern.clone(),
        );
        Ok(())
    }

    async fn append_history(&self, record: &MatchHistory) -> Result<()> {
        let mut state = self.state.lock().expect("store lock poisoned");
        state.history.push(record.clone());
        Ok(())
    }
}
