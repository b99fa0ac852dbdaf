//! The tiered reconciliation run.
//!
//! Strictly sequential across tiers, bounded-parallel within the AI tier:
//! quick rule scan, batched low-effort model pass, capped high-effort pass,
//! then pattern learning. A wall-clock budget is checked cooperatively
//! before each concurrency wave; in-flight batches always finish, and
//! exhaustion is a partial-success outcome, never an error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use log::{debug, info, warn};

use crate::currency;
use crate::error::{ReconcileError, Result};
use crate::llm::types::{
    CandidateContext, Classification, DocumentContext, EffortLevel, PatternContext,
    ReasoningOutcome, ReasoningRequest, ReasoningService, TransactionContext,
};
use crate::matching::{self, direction_amounts};
use crate::patterns::{self, ConfirmedMatch};
use crate::progress::{EventCategory, ProgressRecorder, ProgressSink, RunStatus};
use crate::schema::{
    Direction, Document, MatchCandidate, MatchHistory, MatchType, ReconcileReport, ReconcileStats,
    ReconcileStep, Resolution, Tier, Transaction, TransactionMatch, TransactionStatus,
};
use crate::store::ReconcileStore;

/// Model-tier verdicts below this confidence are never confirmed.
const RESOLVE_CONFIDENCE: u8 = 60;

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Cap on transactions pulled into one run.
    pub max_transactions: usize,
    /// Quick-scan confidence at or above which a match is committed without
    /// escalation.
    pub auto_confirm_threshold: u8,
    /// Transactions per low-effort reasoning call.
    pub batch_size: usize,
    /// Batches in flight per wave.
    pub batch_concurrency: usize,
    /// Maximum items given a high-effort call; the rest become needs_review.
    pub deep_item_cap: usize,
    /// Whole-run wall-clock ceiling, checked between waves.
    pub time_budget: Duration,
    /// Pause between waves to smooth the external call rate.
    pub inter_wave_delay: Duration,
    /// Externally supplied run id for the progress feed.
    pub run_id: Option<String>,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            max_transactions: 200,
            auto_confirm_threshold: 93,
            batch_size: 10,
            batch_concurrency: 4,
            deep_item_cap: 10,
            time_budget: Duration::from_secs(240),
            inter_wave_delay: Duration::from_millis(500),
            run_id: None,
        }
    }
}

struct Deferred {
    tx: Transaction,
    candidates: Vec<MatchCandidate>,
}

struct Escalated {
    tx: Transaction,
    candidates: Vec<MatchCandidate>,
    prior_reasoning: Vec<String>,
}

/// Run-scoped mutable state: the working document set (kept current as
/// allocations land), the outcome per transaction, and the confirmed
/// matches queued for the learning pass.
struct RunState {
    documents: Vec<Document>,
    matches: Vec<TransactionMatch>,
    confirmed: Vec<ConfirmedMatch>,
}

impl RunState {
    fn replace_document(&mut self, updated: Document) {
        if let Some(slot) = self.documents.iter_mut().find(|d| d.id == updated.id) {
            *slot = updated;
        }
    }
}

pub struct ReconcileEngine {
    store: Arc<dyn ReconcileStore>,
    reasoning: Arc<dyn ReasoningService>,
    sink: Option<Arc<dyn ProgressSink>>,
    options: ReconcileOptions,
}

impl ReconcileEngine {
    pub fn new(store: Arc<dyn ReconcileStore>, reasoning: Arc<dyn ReasoningService>) -> Self {
        Self {
            store,
            reasoning,
            sink: None,
            options: ReconcileOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ReconcileOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Reconcile an owner's unmatched transactions against their open
    /// documents. Synchronous from the caller's perspective; the progress
    /// feed mirrors every step live.
    pub async fn run(
        &self,
        owner_id: &str,
        transaction_ids: Option<Vec<String>>,
    ) -> Result<ReconcileReport> {
        if owner_id.trim().is_empty() {
            return Err(ReconcileError::MissingOwner);
        }
        if let Some(ids) = &transaction_ids {
            if ids.is_empty() {
                return Err(ReconcileError::InvalidInput(
                    "transaction id filter is present but empty".to_string(),
                ));
            }
        }

        let run_id = self
            .options
            .run_id
            .clone()
            .unwrap_or_else(|| format!("run-{}", Utc::now().format("%Y%m%d%H%M%S%3f")));

        let (recorder, writer) = match &self.sink {
            Some(sink) => {
                let (r, w) = ProgressRecorder::start(run_id.clone(), sink.clone());
                (r, Some(w))
            }
            None => (ProgressRecorder::disabled(), None),
        };

        let started = Instant::now();
        let mut steps = Vec::new();

        let transactions = self
            .store
            .unmatched_transactions(
                owner_id,
                transaction_ids.as_deref(),
                self.options.max_transactions,
            )
            .await?;
        let documents = self.store.open_documents(owner_id).await?;

        info!(
            "run {}: {} transactions against {} open documents for owner {}",
            run_id,
            transactions.len(),
            documents.len(),
            owner_id
        );
        recorder.emit(
            EventCategory::Info,
            "fetch",
            format!(
                "{} unmatched transactions, {} open documents",
                transactions.len(),
                documents.len()
            ),
        );

        let mut state = RunState {
            documents,
            matches: Vec::new(),
            confirmed: Vec::new(),
        };

        // QUICK_SCAN: pure rule pass, no external calls.
        let step_started = Instant::now();
        let deferred = self.quick_scan(&transactions, &mut state, &recorder).await?;
        steps.push(ReconcileStep {
            name: "quick_scan".to_string(),
            processed: transactions.len(),
            resolved: transactions.len() - deferred.len(),
            duration_ms: step_started.elapsed().as_millis() as u64,
        });

        // AI_MATCH: batched low-effort pass over whatever the rules left.
        let mut stopped_early = false;
        let mut estimated_remaining = 0;
        let mut escalated = Vec::new();
        if !deferred.is_empty() {
            let step_started = Instant::now();
            let processed = deferred.len();
            let outcome = self
                .ai_match(owner_id, deferred, &mut state, &recorder, started)
                .await?;
            escalated = outcome.escalated;
            stopped_early = outcome.stopped_early;
            estimated_remaining = outcome.estimated_remaining;
            // Budget-abandoned transactions are surfaced as needs_review but
            // were never analyzed, so they do not count as resolved here.
            steps.push(ReconcileStep {
                name: "ai_matching".to_string(),
                processed,
                resolved: processed - escalated.len() - estimated_remaining,
                duration_ms: step_started.elapsed().as_millis() as u64,
            });
        }

        // DEEP_INVESTIGATION: capped, one item per call.
        if !escalated.is_empty() {
            let step_started = Instant::now();
            let processed = escalated.len();
            self.deep_investigation(owner_id, escalated, &mut state, &recorder)
                .await?;
            // Only the capped head actually gets a high-effort call; the
            // overflow is routed to review unanalyzed.
            steps.push(ReconcileStep {
                name: "deep_investigation".to_string(),
                processed,
                resolved: processed.min(self.options.deep_item_cap),
                duration_ms: step_started.elapsed().as_millis() as u64,
            });
        }

        // LEARNING: every payment match resolved this run feeds the vendor
        // patterns. Failures here never undo a confirmed match.
        let step_started = Instant::now();
        let patterns_learned = self.learn(owner_id, &state.confirmed, &recorder).await;
        steps.push(ReconcileStep {
            name: "learning".to_string(),
            processed: state.confirmed.len(),
            resolved: patterns_learned,
            duration_ms: step_started.elapsed().as_millis() as u64,
        });

        let mut stats = tally(&state.matches);
        stats.total_transactions = transactions.len();
        stats.stopped_early = stopped_early;
        stats.estimated_remaining = estimated_remaining;

        recorder.emit(
            EventCategory::Info,
            "complete",
            format!(
                "{} auto-confirmed, {} ai, {} deep, {} needs review",
                stats.auto_confirmed, stats.ai_matched, stats.deep_matched, stats.needs_review
            ),
        );
        recorder.finish(RunStatus::Completed, &stats);
        if let Some(writer) = writer {
            let _ = writer.await;
        }

        Ok(ReconcileReport {
            run_id,
            steps,
            matches: state.matches,
            stats,
            patterns_learned,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn quick_scan(
        &self,
        transactions: &[Transaction],
        state: &mut RunState,
        recorder: &ProgressRecorder,
    ) -> Result<Vec<Deferred>> {
        recorder.emit(
            EventCategory::Analyze,
            "quick_scan",
            format!("rule-scoring {} transactions", transactions.len()),
        );

        // Consistent snapshot of batch amounts, taken before any scoring.
        let debit_amounts = direction_amounts(transactions, Direction::Debit);
        let credit_amounts = direction_amounts(transactions, Direction::Credit);

        let mut deferred = Vec::new();
        for tx in transactions {
            let amounts = match tx.direction {
                Direction::Debit => &debit_amounts,
                Direction::Credit => &credit_amounts,
            };
            let candidates =
                matching::find_matches_for_transaction(tx, &state.documents, Some(amounts));

            match candidates.first() {
                Some(best) => recorder.emit(
                    EventCategory::Match,
                    "quick_scan",
                    format!(
                        "{}: {} candidates, best {} at {}",
                        tx.id,
                        candidates.len(),
                        best.document_id,
                        best.confidence
                    ),
                ),
                None => recorder.emit(
                    EventCategory::Search,
                    "quick_scan",
                    format!("{}: no candidates above the confidence gate", tx.id),
                ),
            }

            let auto_confirm = candidates
                .first()
                .filter(|top| top.confidence >= self.options.auto_confirm_threshold)
                .cloned();

            match auto_confirm {
                Some(top) => {
                    if let Some(rate) = top.signals.fx_rate_used {
                        recorder.emit(
                            EventCategory::Fx,
                            "quick_scan",
                            format!("{}: converted at fallback rate {:.4}", tx.id, rate),
                        );
                    }
                    self.confirm(
                        tx,
                        &top.document_id,
                        top.confidence,
                        top.match_type,
                        top.reasons.clone(),
                        Resolution::AutoConfirmed,
                        Tier::QuickScan,
                        state,
                        recorder,
                    )
                    .await?;
                }
                None => deferred.push(Deferred {
                    tx: tx.clone(),
                    candidates,
                }),
            }
        }

        Ok(deferred)
    }

    async fn ai_match(
        &self,
        owner_id: &str,
        deferred: Vec<Deferred>,
        state: &mut RunState,
        recorder: &ProgressRecorder,
        run_started: Instant,
    ) -> Result<AiMatchOutcome> {
        recorder.emit(
            EventCategory::Analyze,
            "ai_matching",
            format!("{} transactions deferred to low-effort pass", deferred.len()),
        );

        let stored_patterns = self.store.patterns_for_owner(owner_id).await?;
        let pattern_contexts: Vec<PatternContext> = stored_patterns
            .iter()
            .map(|p| PatternContext {
                vendor_name: p.vendor_name.clone(),
                avg_delay_days: p.avg_delay_days,
                keywords: p.keywords.clone(),
                confidence: p.confidence,
            })
            .collect();
        let document_contexts = document_contexts(&state.documents);

        let batches: Vec<Vec<Deferred>> = chunk(deferred, self.options.batch_size);
        let mut escalated = Vec::new();
        let mut stopped_early = false;
        let mut estimated_remaining = 0;

        let mut queue = batches.into_iter().peekable();
        while queue.peek().is_some() {
            // Cooperative budget check between waves; in-flight batches
            // always run to completion.
            if run_started.elapsed() > self.options.time_budget {
                let abandoned: Vec<Vec<Deferred>> = queue.collect();
                estimated_remaining = abandoned.iter().map(Vec::len).sum();
                stopped_early = true;
                warn!(
                    "time budget exhausted; abandoning {} transactions",
                    estimated_remaining
                );
                recorder.emit(
                    EventCategory::Info,
                    "ai_matching",
                    format!(
                        "time budget exhausted, {} transactions left unprocessed",
                        estimated_remaining
                    ),
                );
                for batch in abandoned {
                    for item in batch {
                        state.matches.push(needs_review_match(
                            &item.tx,
                            Tier::AiMatching,
                            "time budget exhausted before analysis",
                        ));
                    }
                }
                break;
            }

            let wave: Vec<Vec<Deferred>> = (0..self.options.batch_concurrency)
                .map_while(|_| queue.next())
                .collect();

            let calls = wave.iter().map(|batch| {
                let request = ReasoningRequest {
                    transactions: batch.iter().map(transaction_context).collect(),
                    documents: document_contexts.clone(),
                    patterns: pattern_contexts.clone(),
                };
                async move { self.reasoning.analyze(&request, EffortLevel::Low).await }
            });
            let results = join_all(calls).await;

            for (batch, result) in wave.into_iter().zip(results) {
                match result {
                    Ok(outcomes) => {
                        let by_id: HashMap<String, ReasoningOutcome> = outcomes
                            .into_iter()
                            .map(|o| (o.transaction_id.clone(), o))
                            .collect();
                        for item in batch {
                            let outcome = by_id.get(&item.tx.id).cloned().unwrap_or_else(|| {
                                ReasoningOutcome::needs_review(
                                    &item.tx.id,
                                    "model returned no verdict for this transaction",
                                )
                            });
                            self.settle_ai_outcome(item, outcome, state, &mut escalated, recorder)
                                .await?;
                        }
                    }
                    Err(e) => {
                        // One failed call never fails the run: every
                        // transaction in the batch goes to review.
                        warn!("low-effort reasoning call failed: {}", e);
                        for item in batch {
                            state.matches.push(needs_review_match(
                                &item.tx,
                                Tier::AiMatching,
                                format!("reasoning call failed: {}", e),
                            ));
                        }
                    }
                }
            }

            if queue.peek().is_some() && !self.options.inter_wave_delay.is_zero() {
                tokio::time::sleep(self.options.inter_wave_delay).await;
            }
        }

        Ok(AiMatchOutcome {
            escalated,
            stopped_early,
            estimated_remaining,
        })
    }

    /// Classify one low-effort verdict: confident payment matches are
    /// confirmed, fees/transfers are categorized, uncertain verdicts
    /// (confidence strictly between 0 and 60) escalate to the deep pass.
    async fn settle_ai_outcome(
        &self,
        item: Deferred,
        outcome: ReasoningOutcome,
        state: &mut RunState,
        escalated: &mut Vec<Escalated>,
        recorder: &ProgressRecorder,
    ) -> Result<()> {
        let tx = &item.tx;

        if outcome.classification == Classification::PaymentMatch
            && outcome.confidence >= RESOLVE_CONFIDENCE
        {
            match &outcome.document_id {
                Some(doc_id) if state.documents.iter().any(|d| &d.id == doc_id) => {
                    self.confirm(
                        tx,
                        doc_id,
                        outcome.confidence,
                        outcome.match_type.unwrap_or(MatchType::Partial),
                        outcome.reasoning.clone(),
                        Resolution::PaymentMatch,
                        Tier::AiMatching,
                        state,
                        recorder,
                    )
                    .await?;
                    return Ok(());
                }
                _ => {
                    state.matches.push(needs_review_match(
                        tx,
                        Tier::AiMatching,
                        "model proposed an unknown document id",
                    ));
                    return Ok(());
                }
            }
        }

        match outcome.classification {
            Classification::BankFee | Classification::Transfer => {
                self.categorize(tx, &outcome, state, recorder).await?;
            }
            _ if outcome.confidence > 0 && outcome.confidence < RESOLVE_CONFIDENCE => {
                recorder.emit(
                    EventCategory::Escalate,
                    "ai_matching",
                    format!("{}: confidence {}, escalating", tx.id, outcome.confidence),
                );
                escalated.push(Escalated {
                    tx: tx.clone(),
                    candidates: item.candidates,
                    prior_reasoning: outcome.reasoning,
                });
            }
            Classification::NeedsReview => {
                let mut m = needs_review_match(tx, Tier::AiMatching, "flagged for review");
                m.reasons = outcome.reasoning;
                state.matches.push(m);
            }
            _ => {
                recorder.emit(
                    EventCategory::Classify,
                    "ai_matching",
                    format!("{}: no match", tx.id),
                );
                state.matches.push(TransactionMatch {
                    transaction_id: tx.id.clone(),
                    document_id: None,
                    resolution: Resolution::NoMatch,
                    confidence: outcome.confidence,
                    match_type: MatchType::None,
                    reasons: outcome.reasoning,
                    tier: Tier::AiMatching,
                });
            }
        }
        Ok(())
    }

    async fn deep_investigation(
        &self,
        owner_id: &str,
        escalated: Vec<Escalated>,
        state: &mut RunState,
        recorder: &ProgressRecorder,
    ) -> Result<()> {
        recorder.emit(
            EventCategory::Analyze,
            "deep_investigation",
            format!("{} escalated transactions", escalated.len()),
        );

        let cap = self.options.deep_item_cap;
        let total = escalated.len();
        let mut queue = escalated.into_iter();
        let investigate: Vec<Escalated> = queue.by_ref().take(cap).collect();

        // The remainder is surfaced explicitly, never silently dropped.
        for item in queue {
            recorder.emit(
                EventCategory::Escalate,
                "deep_investigation",
                format!("{}: skipped, deep investigation cap reached", item.tx.id),
            );
            state.matches.push(needs_review_match(
                &item.tx,
                Tier::DeepInvestigation,
                format!(
                    "skipped deep investigation: {} items escalated, cap is {}",
                    total, cap
                ),
            ));
        }

        let stored_patterns = self.store.patterns_for_owner(owner_id).await?;
        let pattern_contexts: Vec<PatternContext> = stored_patterns
            .iter()
            .map(|p| PatternContext {
                vendor_name: p.vendor_name.clone(),
                avg_delay_days: p.avg_delay_days,
                keywords: p.keywords.clone(),
                confidence: p.confidence,
            })
            .collect();

        // One item per call so each gets the model's full context budget.
        for item in investigate {
            let request = ReasoningRequest {
                transactions: vec![transaction_context(&Deferred {
                    tx: item.tx.clone(),
                    candidates: item.candidates.clone(),
                })],
                documents: document_contexts(&state.documents),
                patterns: pattern_contexts.clone(),
            };

            let outcome = match self.reasoning.analyze(&request, EffortLevel::High).await {
                Ok(outcomes) => outcomes
                    .into_iter()
                    .find(|o| o.transaction_id == item.tx.id)
                    .unwrap_or_else(|| {
                        ReasoningOutcome::needs_review(
                            &item.tx.id,
                            "model returned no verdict for this transaction",
                        )
                    }),
                Err(e) => {
                    warn!("high-effort reasoning call failed for {}: {}", item.tx.id, e);
                    ReasoningOutcome::needs_review(
                        &item.tx.id,
                        format!("reasoning call failed: {}", e),
                    )
                }
            };

            self.settle_deep_outcome(&item, outcome, state, recorder).await?;
        }

        Ok(())
    }

    async fn settle_deep_outcome(
        &self,
        item: &Escalated,
        outcome: ReasoningOutcome,
        state: &mut RunState,
        recorder: &ProgressRecorder,
    ) -> Result<()> {
        let tx = &item.tx;

        if outcome.classification == Classification::PaymentMatch
            && outcome.confidence >= RESOLVE_CONFIDENCE
        {
            if let Some(doc_id) = outcome
                .document_id
                .as_ref()
                .filter(|id| state.documents.iter().any(|d| &d.id == *id))
            {
                let doc_id = doc_id.clone();
                self.confirm(
                    tx,
                    &doc_id,
                    outcome.confidence,
                    outcome.match_type.unwrap_or(MatchType::Partial),
                    outcome.reasoning.clone(),
                    Resolution::PaymentMatch,
                    Tier::DeepInvestigation,
                    state,
                    recorder,
                )
                .await?;
                return Ok(());
            }
        }

        match outcome.classification {
            Classification::BankFee | Classification::Transfer => {
                self.categorize(tx, &outcome, state, recorder).await?;
            }
            Classification::NoMatch if outcome.confidence >= RESOLVE_CONFIDENCE => {
                state.matches.push(TransactionMatch {
                    transaction_id: tx.id.clone(),
                    document_id: None,
                    resolution: Resolution::NoMatch,
                    confidence: outcome.confidence,
                    match_type: MatchType::None,
                    reasons: outcome.reasoning,
                    tier: Tier::DeepInvestigation,
                });
            }
            _ => {
                // Even the deep pass could not commit; carry both rounds of
                // model reasoning into the review queue.
                let mut reasons = item.prior_reasoning.clone();
                reasons.extend(outcome.reasoning);
                let mut m = needs_review_match(tx, Tier::DeepInvestigation, "unresolved after deep investigation");
                m.reasons.extend(reasons);
                m.confidence = outcome.confidence;
                state.matches.push(m);
            }
        }
        Ok(())
    }

    /// The three confirm writes: allocate against the document, mark the
    /// transaction matched, append the audit record. Idempotent per
    /// transaction; a store targeting ACID semantics should wrap these in
    /// one transaction.
    #[allow(clippy::too_many_arguments)]
    async fn confirm(
        &self,
        tx: &Transaction,
        document_id: &str,
        confidence: u8,
        match_type: MatchType,
        reasons: Vec<String>,
        resolution: Resolution,
        tier: Tier,
        state: &mut RunState,
        recorder: &ProgressRecorder,
    ) -> Result<()> {
        let current = self.store.get_transaction(&tx.id).await?;
        if matches!(current, Some(t) if t.status == TransactionStatus::Matched) {
            debug!("{} already matched; skipping duplicate confirm", tx.id);
            return Ok(());
        }

        let doc = self
            .store
            .get_document(document_id)
            .await?
            .ok_or_else(|| ReconcileError::StoreError(format!("unknown document: {}", document_id)))?;

        let allocated = allocation_amount(tx, &doc);
        let updated_doc = self.store.apply_payment(document_id, allocated).await?;
        state.replace_document(updated_doc);

        let mut matched_tx = tx.clone();
        matched_tx.status = TransactionStatus::Matched;
        matched_tx.matched_document_id = Some(document_id.to_string());
        self.store.update_transaction(&matched_tx).await?;

        let delay_days = (tx.date - doc.document_date).num_days();
        self.store
            .append_history(&MatchHistory {
                id: format!("{}:{}", tx.id, document_id),
                owner_id: tx.owner_id.clone(),
                transaction_id: tx.id.clone(),
                document_id: document_id.to_string(),
                transaction_amount: tx.amount,
                transaction_currency: tx.currency.clone(),
                allocated_amount: allocated,
                document_currency: doc.currency.clone(),
                transaction_date: tx.date,
                document_date: doc.document_date,
                delay_days,
                match_type,
                manual: false,
                confidence,
                recorded_at: Utc::now(),
            })
            .await?;

        recorder.emit(
            EventCategory::Confirm,
            "confirm",
            format!(
                "{} matched to {} ({:.2} {} allocated, confidence {})",
                tx.id, document_id, allocated, doc.currency, confidence
            ),
        );

        state.confirmed.push(ConfirmedMatch {
            owner_id: tx.owner_id.clone(),
            vendor_name: doc.counterparty_name.clone(),
            transaction_description: tx.description.clone(),
            delay_days,
            confidence,
            match_type,
            manual: false,
            processor: None,
        });

        state.matches.push(TransactionMatch {
            transaction_id: tx.id.clone(),
            document_id: Some(document_id.to_string()),
            resolution,
            confidence,
            match_type,
            reasons,
            tier,
        });
        Ok(())
    }

    /// Non-payment classification: the transaction is explained (fee or
    /// internal transfer) without touching any document ledger.
    async fn categorize(
        &self,
        tx: &Transaction,
        outcome: &ReasoningOutcome,
        state: &mut RunState,
        recorder: &ProgressRecorder,
    ) -> Result<()> {
        let mut categorized = tx.clone();
        categorized.status = TransactionStatus::Categorized;
        self.store.update_transaction(&categorized).await?;

        let resolution = match outcome.classification {
            Classification::Transfer => Resolution::Transfer,
            _ => Resolution::BankFee,
        };
        recorder.emit(
            EventCategory::Classify,
            "classify",
            format!("{}: {:?}", tx.id, outcome.classification),
        );
        state.matches.push(TransactionMatch {
            transaction_id: tx.id.clone(),
            document_id: None,
            resolution,
            confidence: outcome.confidence,
            match_type: MatchType::None,
            reasons: outcome.reasoning.clone(),
            tier: Tier::AiMatching,
        });
        Ok(())
    }

    /// Fold every confirmed payment match into the vendor patterns.
    /// Returns how many matches were learned; failures log and continue.
    async fn learn(
        &self,
        owner_id: &str,
        confirmed: &[ConfirmedMatch],
        recorder: &ProgressRecorder,
    ) -> usize {
        if confirmed.is_empty() {
            return 0;
        }

        let stored = match self.store.patterns_for_owner(owner_id).await {
            Ok(p) => p,
            Err(e) => {
                warn!("pattern load failed, skipping learning pass: {}", e);
                return 0;
            }
        };
        let mut working: Vec<_> = stored;
        let mut learned = 0;

        for c in confirmed {
            let existing_idx = {
                let hits = patterns::lookup(&working, &c.vendor_name);
                hits.first()
                    .and_then(|hit| working.iter().position(|p| p.vendor_name == hit.vendor_name))
            };

            let pattern = match existing_idx {
                Some(idx) => {
                    patterns::update_pattern(&mut working[idx], c);
                    working[idx].clone()
                }
                None => {
                    let p = patterns::new_pattern(c);
                    working.push(p.clone());
                    p
                }
            };

            match self.store.upsert_pattern(&pattern).await {
                Ok(()) => {
                    learned += 1;
                    recorder.emit(
                        EventCategory::Learn,
                        "learning",
                        format!(
                            "{}: {} matches, avg delay {:.1} days",
                            pattern.vendor_name, pattern.match_count, pattern.avg_delay_days
                        ),
                    );
                }
                Err(e) => warn!("pattern upsert failed for {}: {}", pattern.vendor_name, e),
            }
        }

        learned
    }

    /// Manual confirmation path for user-reviewed matches: same side
    /// effects as an automatic confirm, but the pattern nudge is the manual
    /// +5 and the audit record says so.
    pub async fn confirm_manual(
        &self,
        transaction_id: &str,
        document_id: &str,
    ) -> Result<TransactionMatch> {
        let tx = self
            .store
            .get_transaction(transaction_id)
            .await?
            .ok_or_else(|| {
                ReconcileError::InvalidInput(format!("unknown transaction: {}", transaction_id))
            })?;
        let doc = self
            .store
            .get_document(document_id)
            .await?
            .ok_or_else(|| ReconcileError::InvalidInput(format!("unknown document: {}", document_id)))?;

        if tx.status == TransactionStatus::Matched {
            return Err(ReconcileError::InvalidInput(format!(
                "transaction already matched: {}",
                transaction_id
            )));
        }

        let candidate = matching::calculate_match(&tx, &doc, None);
        let allocated = allocation_amount(&tx, &doc);
        self.store.apply_payment(document_id, allocated).await?;

        let mut matched_tx = tx.clone();
        matched_tx.status = TransactionStatus::Matched;
        matched_tx.matched_document_id = Some(document_id.to_string());
        self.store.update_transaction(&matched_tx).await?;

        let delay_days = (tx.date - doc.document_date).num_days();
        self.store
            .append_history(&MatchHistory {
                id: format!("{}:{}", tx.id, document_id),
                owner_id: tx.owner_id.clone(),
                transaction_id: tx.id.clone(),
                document_id: document_id.to_string(),
                transaction_amount: tx.amount,
                transaction_currency: tx.currency.clone(),
                allocated_amount: allocated,
                document_currency: doc.currency.clone(),
                transaction_date: tx.date,
                document_date: doc.document_date,
                delay_days,
                match_type: candidate.match_type,
                manual: true,
                confidence: candidate.confidence,
                recorded_at: Utc::now(),
            })
            .await?;

        let confirmed = ConfirmedMatch {
            owner_id: tx.owner_id.clone(),
            vendor_name: doc.counterparty_name.clone(),
            transaction_description: tx.description.clone(),
            delay_days,
            confidence: candidate.confidence,
            match_type: candidate.match_type,
            manual: true,
            processor: None,
        };
        let _ = self
            .learn(&tx.owner_id, std::slice::from_ref(&confirmed), &ProgressRecorder::disabled())
            .await;

        Ok(TransactionMatch {
            transaction_id: tx.id.clone(),
            document_id: Some(document_id.to_string()),
            resolution: Resolution::PaymentMatch,
            confidence: candidate.confidence,
            match_type: candidate.match_type,
            reasons: candidate.reasons,
            tier: Tier::QuickScan,
        })
    }
}

struct AiMatchOutcome {
    escalated: Vec<Escalated>,
    stopped_early: bool,
    estimated_remaining: usize,
}

fn chunk<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let mut chunks = Vec::new();
    let mut current = Vec::with_capacity(size.max(1));
    for item in items {
        current.push(item);
        if current.len() == size.max(1) {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Amount to allocate against the document: the transaction amount in the
/// document's currency (falling back to the full remaining balance when no
/// FX path exists), capped at what is left.
fn allocation_amount(tx: &Transaction, doc: &Document) -> f64 {
    let in_doc_currency = if currency::currencies_equivalent(&tx.currency, &doc.currency) {
        tx.amount
    } else {
        currency::convert(tx.amount, &tx.currency, &doc.currency).unwrap_or(doc.amount_remaining)
    };
    in_doc_currency.min(doc.amount_remaining)
}

fn transaction_context(item: &Deferred) -> TransactionContext {
    TransactionContext {
        transaction_id: item.tx.id.clone(),
        date: item.tx.date,
        description: item.tx.description.clone(),
        amount: item.tx.amount,
        direction: item.tx.direction.as_str().to_string(),
        currency: item.tx.currency.clone(),
        rule_candidates: item
            .candidates
            .iter()
            .map(|c| CandidateContext {
                document_id: c.document_id.clone(),
                confidence: c.confidence,
                match_type: c.match_type,
                reasons: c.reasons.clone(),
            })
            .collect(),
    }
}

fn document_contexts(documents: &[Document]) -> Vec<DocumentContext> {
    documents
        .iter()
        .filter(|d| d.amount_remaining > 0.0)
        .map(|d| DocumentContext {
            document_id: d.id.clone(),
            doc_type: d.doc_type.as_str().to_string(),
            document_number: d.document_number.clone(),
            counterparty_name: d.counterparty_name.clone(),
            document_date: d.document_date,
            due_date: d.due_date,
            amount_remaining: d.amount_remaining,
            currency: d.currency.clone(),
        })
        .collect()
}

fn needs_review_match(
    tx: &Transaction,
    tier: Tier,
    reason: impl Into<String>,
) -> TransactionMatch {
    TransactionMatch {
        transaction_id: tx.id.clone(),
        document_id: None,
        resolution: Resolution::NeedsReview,
        confidence: 0,
        match_type: MatchType::None,
        reasons: vec![reason.into()],
        tier,
    }
}

fn tally(matches: &[TransactionMatch]) -> ReconcileStats {
    let mut stats = ReconcileStats::default();
    for m in matches {
        match m.resolution {
            Resolution::AutoConfirmed => stats.auto_confirmed += 1,
            Resolution::PaymentMatch => match m.tier {
                Tier::DeepInvestigation => stats.deep_matched += 1,
                _ => stats.ai_matched += 1,
            },
            Resolution::BankFee | Resolution::Transfer => stats.non_payment += 1,
            Resolution::NoMatch => stats.no_match += 1,
            Resolution::NeedsReview => stats.needs_review += 1,
        }
    }
    stats
}
