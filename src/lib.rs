//! # Invoice Reconciler
//!
//! A deterministic multi-signal matching engine for reconciling bank
//! transactions against open bills and invoices, with a tiered escalation
//! pipeline for the cases rules alone cannot settle.
//!
//! ## Core Concepts
//!
//! - **Quick scan**: four rule-based signals (reference, amount, identity,
//!   timing) score every direction-appropriate pair; candidates at or above
//!   the auto-confirm threshold are committed without any external call
//! - **AI matching**: unresolved transactions go to a low-effort reasoning
//!   model in batches, with bounded concurrency and a run-level time budget
//! - **Deep investigation**: a capped number of still-uncertain items each
//!   get a dedicated high-effort call
//! - **Pattern learning**: every confirmed match updates per-vendor payment
//!   behaviour (typical delay, keywords, aliases) that feeds back into the
//!   next run
//! - **Progress streaming**: every step of a run is mirrored to a pluggable
//!   sink through a single-writer event channel
//!
//! ## Example
//!
//! ```rust,ignore
//! use invoice_reconciler::*;
//! use std::sync::Arc;
//!
//! # async fn demo(store: Arc<dyn ReconcileStore>, reasoner: Arc<dyn ReasoningService>) {
//! let progress = Arc::new(InMemoryProgress::new());
//! let engine = ReconcileEngine::new(store, reasoner)
//!     .with_options(ReconcileOptions::default())
//!     .with_progress(progress.clone());
//!
//! let report = engine.run("owner-1", None).await.unwrap();
//! println!(
//!     "{} auto-confirmed, {} need review",
//!     report.stats.auto_confirmed, report.stats.needs_review
//! );
//! # }
//! ```
//!
//! The scoring path (`scoring`, `matching`) is fully deterministic and free
//! of I/O, so identical inputs always produce identical candidates.

pub mod currency;
pub mod error;
pub mod matching;
pub mod orchestrator;
pub mod patterns;
pub mod progress;
pub mod schema;
pub mod scoring;
pub mod similarity;
pub mod store;

pub mod llm;

pub use error::{ReconcileError, Result};
pub use matching::{
    calculate_match, confidence_from_score, find_matches_for_document,
    find_matches_for_transaction, MIN_CANDIDATE_CONFIDENCE,
};
pub use orchestrator::{ReconcileEngine, ReconcileOptions};
pub use patterns::ConfirmedMatch;
pub use progress::{
    EventCategory, InMemoryProgress, ProgressEvent, ProgressLog, ProgressRecorder, ProgressSink,
    RunStatus,
};
pub use schema::*;
pub use store::{InMemoryStore, ReconcileStore};

pub use llm::types::{
    Classification, EffortLevel, ReasoningOutcome, ReasoningRequest, ReasoningResponse,
    ReasoningService,
};

#[cfg(feature = "gemini")]
pub use llm::client::GeminiReasoner;
