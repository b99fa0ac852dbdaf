use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use invoice_reconciler::*;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn bill(id: &str, number: &str, vendor: &str, amount: f64, currency: &str) -> Document {
    Document {
        id: id.to_string(),
        owner_id: "owner-1".to_string(),
        doc_type: DocumentType::Bill,
        document_number: number.to_string(),
        counterparty_name: vendor.to_string(),
        document_date: date(2024, 1, 10),
        due_date: Some(date(2024, 2, 9)),
        total: amount,
        amount_paid: 0.0,
        amount_remaining: amount,
        currency: currency.to_string(),
        payment_status: PaymentStatus::Unpaid,
    }
}

fn debit(id: &str, desc: &str, amount: f64, currency: &str) -> Transaction {
    Transaction {
        id: id.to_string(),
        owner_id: "owner-1".to_string(),
        account_id: "acct-1".to_string(),
        date: date(2024, 2, 7),
        description: desc.to_string(),
        amount,
        direction: Direction::Debit,
        currency: currency.to_string(),
        status: TransactionStatus::Unmatched,
        matched_document_id: None,
    }
}

/// Scripted reasoning service: returns a canned outcome per transaction id,
/// `needs_review` with a mid confidence for anything unscripted, and counts
/// calls per effort level.
#[derive(Default)]
struct ScriptedReasoner {
    outcomes: Mutex<HashMap<String, ReasoningOutcome>>,
    low_calls: AtomicUsize,
    high_calls: AtomicUsize,
}

impl ScriptedReasoner {
    fn new() -> Self {
        Self::default()
    }

    fn script(&self, outcome: ReasoningOutcome) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(outcome.transaction_id.clone(), outcome);
    }

    fn low_calls(&self) -> usize {
        self.low_calls.load(Ordering::SeqCst)
    }

    fn high_calls(&self) -> usize {
        self.high_calls.load(Ordering::SeqCst)
    }
}

fn outcome(
    tx_id: &str,
    classification: Classification,
    document_id: Option<&str>,
    confidence: u8,
) -> ReasoningOutcome {
    ReasoningOutcome {
        transaction_id: tx_id.to_string(),
        classification,
        document_id: document_id.map(str::to_string),
        document_ids: Vec::new(),
        confidence,
        reasoning: vec!["scripted".to_string()],
        match_type: Some(MatchType::Partial),
    }
}

#[async_trait]
impl ReasoningService for ScriptedReasoner {
    async fn analyze(
        &self,
        request: &ReasoningRequest,
        effort: EffortLevel,
    ) -> Result<Vec<ReasoningOutcome>> {
        match effort {
            EffortLevel::Low => self.low_calls.fetch_add(1, Ordering::SeqCst),
            EffortLevel::High => self.high_calls.fetch_add(1, Ordering::SeqCst),
        };
        let scripted = self.outcomes.lock().unwrap();
        Ok(request
            .transactions
            .iter()
            .map(|t| {
                scripted.get(&t.transaction_id).cloned().unwrap_or_else(|| {
                    let mut o = ReasoningOutcome::needs_review(&t.transaction_id, "unscripted");
                    o.confidence = 30;
                    o
                })
            })
            .collect())
    }
}

fn fast_options() -> ReconcileOptions {
    ReconcileOptions {
        inter_wave_delay: Duration::ZERO,
        ..ReconcileOptions::default()
    }
}

#[tokio::test]
async fn test_clean_reference_match_auto_confirms_without_model_calls() {
    let store = Arc::new(InMemoryStore::seed(
        vec![bill("doc-1", "INV-2024-001", "Acme Corp", 1000.0, "USD")],
        vec![debit("tx-1", "Payment INV-2024-001 Acme Corp", 1000.0, "USD")],
    ));
    let reasoner = Arc::new(ScriptedReasoner::new());
    let engine = ReconcileEngine::new(store.clone(), reasoner.clone()).with_options(fast_options());

    let report = engine.run("owner-1", None).await.unwrap();

    assert_eq!(report.stats.auto_confirmed, 1);
    assert_eq!(reasoner.low_calls(), 0);
    assert_eq!(reasoner.high_calls(), 0);

    let m = &report.matches[0];
    assert_eq!(m.resolution, Resolution::AutoConfirmed);
    assert_eq!(m.tier, Tier::QuickScan);
    assert_eq!(m.document_id.as_deref(), Some("doc-1"));

    // All three confirm writes landed.
    let tx = store.get_transaction("tx-1").unwrap();
    assert_eq!(tx.status, TransactionStatus::Matched);
    assert_eq!(tx.matched_document_id.as_deref(), Some("doc-1"));
    let doc = ReconcileStore::get_document(store.as_ref(), "doc-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc.payment_status, PaymentStatus::Paid);
    assert_eq!(store.history().len(), 1);
}

#[tokio::test]
async fn test_auto_confirm_learns_vendor_pattern() {
    let store = Arc::new(InMemoryStore::seed(
        vec![bill("doc-1", "INV-2024-001", "Acme Corp", 1000.0, "USD")],
        vec![debit("tx-1", "Payment INV-2024-001 Acme Corp", 1000.0, "USD")],
    ));
    let engine = ReconcileEngine::new(store.clone(), Arc::new(ScriptedReasoner::new()))
        .with_options(fast_options());

    let report = engine.run("owner-1", None).await.unwrap();
    assert_eq!(report.patterns_learned, 1);

    let pattern = store.pattern("owner-1", "acme corp").unwrap();
    assert_eq!(pattern.match_count, 1);
    // tx 2024-02-07 against document 2024-01-10.
    assert!((pattern.avg_delay_days - 28.0).abs() < 1e-9);
    // Automatic seeds cap at 90 no matter how strong the match was.
    assert!((pattern.confidence - 90.0).abs() < 1e-9);
    assert!(pattern.keywords.contains(&"acme".to_string()));
}

#[tokio::test]
async fn test_ambiguous_transaction_escalates_to_low_effort_pass() {
    // Amount and vendor are plausible but the reference disagrees, so the
    // rules land below the auto-confirm bar.
    let store = Arc::new(InMemoryStore::seed(
        vec![bill("doc-1", "INV-2024-001", "Acme Corp", 1000.0, "USD")],
        vec![debit("tx-1", "ACH pmt 99812 acme", 1000.0, "USD")],
    ));
    let reasoner = Arc::new(ScriptedReasoner::new());
    reasoner.script(outcome(
        "tx-1",
        Classification::PaymentMatch,
        Some("doc-1"),
        85,
    ));
    let engine = ReconcileEngine::new(store.clone(), reasoner.clone()).with_options(fast_options());

    let report = engine.run("owner-1", None).await.unwrap();

    assert_eq!(reasoner.low_calls(), 1);
    assert_eq!(report.stats.auto_confirmed, 0);
    assert_eq!(report.stats.ai_matched, 1);
    let m = &report.matches[0];
    assert_eq!(m.resolution, Resolution::PaymentMatch);
    assert_eq!(m.tier, Tier::AiMatching);
    assert_eq!(store.get_transaction("tx-1").unwrap().status, TransactionStatus::Matched);
}

#[tokio::test]
async fn test_bank_fee_categorized_without_touching_documents() {
    let store = Arc::new(InMemoryStore::seed(
        vec![bill("doc-1", "INV-2024-001", "Acme Corp", 1000.0, "USD")],
        vec![debit("tx-fee", "monthly account maintenance fee", 25.0, "USD")],
    ));
    let reasoner = Arc::new(ScriptedReasoner::new());
    reasoner.script(outcome("tx-fee", Classification::BankFee, None, 95));
    let engine = ReconcileEngine::new(store.clone(), reasoner).with_options(fast_options());

    let report = engine.run("owner-1", None).await.unwrap();

    assert_eq!(report.stats.non_payment, 1);
    assert_eq!(
        store.get_transaction("tx-fee").unwrap().status,
        TransactionStatus::Categorized
    );
    let doc = ReconcileStore::get_document(store.as_ref(), "doc-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc.amount_paid, 0.0);
    assert!(store.history().is_empty());
}

#[tokio::test]
async fn test_uncertain_verdict_escalates_to_high_effort() {
    let store = Arc::new(InMemoryStore::seed(
        vec![bill("doc-1", "INV-2024-001", "Acme Corp", 1000.0, "USD")],
        vec![debit("tx-1", "wire out 4417", 990.0, "USD")],
    ));
    let reasoner = Arc::new(ScriptedReasoner::new());
    // Low pass is unsure; the scripted outcome also serves the deep pass,
    // where 85 clears the resolve bar.
    reasoner.script(outcome(
        "tx-1",
        Classification::PaymentMatch,
        Some("doc-1"),
        55,
    ));
    let engine = ReconcileEngine::new(store.clone(), reasoner.clone()).with_options(fast_options());

    // Re-script between tiers is not possible through the shared map, so
    // assert the escalation path instead: 55 escalates, and the deep pass
    // sees the same 55 which is below 60, landing in review.
    let report = engine.run("owner-1", None).await.unwrap();

    assert_eq!(reasoner.low_calls(), 1);
    assert_eq!(reasoner.high_calls(), 1);
    assert_eq!(report.stats.needs_review, 1);
    let m = &report.matches[0];
    assert_eq!(m.tier, Tier::DeepInvestigation);
    assert_eq!(store.get_transaction("tx-1").unwrap().status, TransactionStatus::Unmatched);
}

#[tokio::test]
async fn test_deep_pass_confirms_with_high_confidence_verdict() {
    let store = Arc::new(InMemoryStore::seed(
        vec![bill("doc-1", "INV-2024-001", "Acme Corp", 1000.0, "USD")],
        vec![debit("tx-1", "wire out 4417", 990.0, "USD")],
    ));

    // A reasoner that is unsure at low effort and certain at high effort.
    struct TwoTier;
    #[async_trait]
    impl ReasoningService for TwoTier {
        async fn analyze(
            &self,
            request: &ReasoningRequest,
            effort: EffortLevel,
        ) -> Result<Vec<ReasoningOutcome>> {
            let confidence = match effort {
                EffortLevel::Low => 45,
                EffortLevel::High => 88,
            };
            Ok(request
                .transactions
                .iter()
                .map(|t| outcome(&t.transaction_id, Classification::PaymentMatch, Some("doc-1"), confidence))
                .collect())
        }
    }

    let engine =
        ReconcileEngine::new(store.clone(), Arc::new(TwoTier)).with_options(fast_options());
    let report = engine.run("owner-1", None).await.unwrap();

    assert_eq!(report.stats.deep_matched, 1);
    let m = &report.matches[0];
    assert_eq!(m.resolution, Resolution::PaymentMatch);
    assert_eq!(m.tier, Tier::DeepInvestigation);
    assert_eq!(store.get_transaction("tx-1").unwrap().status, TransactionStatus::Matched);
}

#[tokio::test]
async fn test_lowering_threshold_never_decreases_auto_confirms() {
    // Candidate confidences land around 96, 85, 65 and 0, so each threshold
    // step unlocks at most one more confirm and never loses one.
    fn fixture() -> (Vec<Document>, Vec<Transaction>) {
        (
            vec![
                bill("doc-1", "INV-2024-001", "Acme Corp", 1000.0, "USD"),
                bill("doc-2", "INV-2024-002", "Northwind Traders", 500.0, "USD"),
                bill("doc-3", "INV-2024-003", "Globex", 750.0, "USD"),
            ],
            vec![
                debit("tx-1", "Payment INV-2024-001 Acme Corp", 1000.0, "USD"),
                debit("tx-2", "northwind traders payment 788", 500.0, "USD"),
                debit("tx-3", "globex inv-2024-003", 740.0, "USD"),
                debit("tx-4", "misc withdrawal", 83.0, "USD"),
            ],
        )
    }

    let mut last = 0;
    for threshold in [99, 93, 80, 60, 40] {
        let (docs, txs) = fixture();
        let store = Arc::new(InMemoryStore::seed(docs, txs));
        let options = ReconcileOptions {
            auto_confirm_threshold: threshold,
            ..fast_options()
        };
        let engine =
            ReconcileEngine::new(store, Arc::new(ScriptedReasoner::new())).with_options(options);

        let report = engine.run("owner-1", None).await.unwrap();
        assert!(
            report.stats.auto_confirmed >= last,
            "threshold {} confirmed {} after {} at the higher threshold",
            threshold,
            report.stats.auto_confirmed,
            last
        );
        last = report.stats.auto_confirmed;
    }
    // The lowest threshold must have confirmed every scorable transaction.
    assert_eq!(last, 3);
}

#[tokio::test]
async fn test_deep_investigation_cap_sends_overflow_to_review() {
    // 40 transactions nothing can resolve: every low-effort verdict is an
    // uncertain 30, so all 40 escalate and only the cap gets a deep call.
    let docs = vec![bill("doc-1", "INV-2024-001", "Acme Corp", 999_999.0, "USD")];
    let txs: Vec<Transaction> = (0..40)
        .map(|i| debit(&format!("tx-{:02}", i), "acme corp payment", 500.0 + i as f64, "USD"))
        .collect();
    let store = Arc::new(InMemoryStore::seed(docs, txs));

    struct AlwaysUnsure;
    #[async_trait]
    impl ReasoningService for AlwaysUnsure {
        async fn analyze(
            &self,
            request: &ReasoningRequest,
            _effort: EffortLevel,
        ) -> Result<Vec<ReasoningOutcome>> {
            Ok(request
                .transactions
                .iter()
                .map(|t| {
                    let mut o = ReasoningOutcome::needs_review(&t.transaction_id, "unsure");
                    o.confidence = 30;
                    o
                })
                .collect())
        }
    }

    let engine =
        ReconcileEngine::new(store, Arc::new(AlwaysUnsure)).with_options(fast_options());
    let report = engine.run("owner-1", None).await.unwrap();

    // Every transaction still gets exactly one outcome.
    assert_eq!(report.matches.len(), 40);
    assert_eq!(report.stats.needs_review, 40);
    let deep_skipped = report
        .matches
        .iter()
        .filter(|m| m.reasons.iter().any(|r| r.contains("skipped deep investigation")))
        .count();
    assert_eq!(deep_skipped, 30);

    // The deep step only counts the capped head as resolved.
    let deep_step = report
        .steps
        .iter()
        .find(|s| s.name == "deep_investigation")
        .unwrap();
    assert_eq!(deep_step.processed, 40);
    assert_eq!(deep_step.resolved, 10);
}

#[tokio::test]
async fn test_zero_time_budget_is_partial_success() {
    let docs = vec![bill("doc-1", "INV-2024-001", "Acme Corp", 999_999.0, "USD")];
    let txs: Vec<Transaction> = (0..15)
        .map(|i| debit(&format!("tx-{:02}", i), "acme corp payment", 500.0 + i as f64, "USD"))
        .collect();
    let store = Arc::new(InMemoryStore::seed(docs, txs));
    let reasoner = Arc::new(ScriptedReasoner::new());

    let options = ReconcileOptions {
        time_budget: Duration::ZERO,
        inter_wave_delay: Duration::ZERO,
        ..ReconcileOptions::default()
    };
    let engine = ReconcileEngine::new(store, reasoner.clone()).with_options(options);

    let report = engine.run("owner-1", None).await.unwrap();

    assert_eq!(reasoner.low_calls(), 0);
    assert!(report.stats.stopped_early);
    assert_eq!(report.stats.estimated_remaining, 15);
    assert_eq!(report.stats.needs_review, 15);
    assert_eq!(report.matches.len(), 15);

    // Abandoned transactions are not counted as resolved by the AI step.
    let ai_step = report.steps.iter().find(|s| s.name == "ai_matching").unwrap();
    assert_eq!(ai_step.processed, 15);
    assert_eq!(ai_step.resolved, 0);
}

#[tokio::test]
async fn test_reasoning_transport_failure_degrades_batch_to_review() {
    let docs = vec![bill("doc-1", "INV-2024-001", "Acme Corp", 999_999.0, "USD")];
    let txs = vec![
        debit("tx-1", "acme corp payment", 500.0, "USD"),
        debit("tx-2", "acme corp payment", 501.0, "USD"),
    ];
    let store = Arc::new(InMemoryStore::seed(docs, txs));

    struct Unreachable;
    #[async_trait]
    impl ReasoningService for Unreachable {
        async fn analyze(
            &self,
            _request: &ReasoningRequest,
            _effort: EffortLevel,
        ) -> Result<Vec<ReasoningOutcome>> {
            Err(ReconcileError::ReasoningFailed("connection refused".to_string()))
        }
    }

    let engine =
        ReconcileEngine::new(store.clone(), Arc::new(Unreachable)).with_options(fast_options());
    let report = engine.run("owner-1", None).await.unwrap();

    assert_eq!(report.stats.needs_review, 2);
    for m in &report.matches {
        assert_eq!(m.resolution, Resolution::NeedsReview);
        assert!(m.reasons.iter().any(|r| r.contains("reasoning call failed")));
    }
    // Nothing was mutated.
    assert_eq!(store.get_transaction("tx-1").unwrap().status, TransactionStatus::Unmatched);
}

#[tokio::test]
async fn test_model_inventing_document_id_lands_in_review() {
    let store = Arc::new(InMemoryStore::seed(
        vec![bill("doc-1", "INV-2024-001", "Acme Corp", 1000.0, "USD")],
        vec![debit("tx-1", "acme corp payment", 500.0, "USD")],
    ));
    let reasoner = Arc::new(ScriptedReasoner::new());
    reasoner.script(outcome(
        "tx-1",
        Classification::PaymentMatch,
        Some("doc-does-not-exist"),
        95,
    ));
    let engine = ReconcileEngine::new(store.clone(), reasoner).with_options(fast_options());

    let report = engine.run("owner-1", None).await.unwrap();

    assert_eq!(report.stats.needs_review, 1);
    assert!(report.matches[0]
        .reasons
        .iter()
        .any(|r| r.contains("unknown document id")));
    assert_eq!(store.get_transaction("tx-1").unwrap().status, TransactionStatus::Unmatched);
}

#[tokio::test]
async fn test_cross_currency_auto_confirm_allocates_converted_amount() {
    // ANG debit against a USD bill at the 0.56 fallback rate.
    let store = Arc::new(InMemoryStore::seed(
        vec![bill("doc-1", "INV-2024-001", "Acme Corp", 560.0, "USD")],
        vec![debit("tx-1", "Payment INV-2024-001 Acme Corp", 1000.0, "ANG")],
    ));
    let engine = ReconcileEngine::new(store.clone(), Arc::new(ScriptedReasoner::new()))
        .with_options(fast_options());

    let report = engine.run("owner-1", None).await.unwrap();

    assert_eq!(report.stats.auto_confirmed, 1);
    assert_eq!(report.matches[0].match_type, MatchType::FxConverted);
    let history = store.history();
    assert_eq!(history.len(), 1);
    assert!((history[0].allocated_amount - 560.0).abs() < 0.01);
    assert_eq!(history[0].document_currency, "USD");
}

#[tokio::test]
async fn test_partial_payment_leaves_document_open() {
    let store = Arc::new(InMemoryStore::seed(
        vec![bill("doc-1", "INV-2024-001", "Acme Corp", 1000.0, "USD")],
        vec![debit("tx-1", "installment one", 500.0, "USD")],
    ));
    let reasoner = Arc::new(ScriptedReasoner::new());
    reasoner.script(outcome(
        "tx-1",
        Classification::PaymentMatch,
        Some("doc-1"),
        80,
    ));
    let engine = ReconcileEngine::new(store.clone(), reasoner).with_options(fast_options());

    engine.run("owner-1", None).await.unwrap();

    let doc = ReconcileStore::get_document(store.as_ref(), "doc-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc.payment_status, PaymentStatus::Partial);
    assert!((doc.amount_remaining - 500.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_progress_feed_records_full_run() {
    let store = Arc::new(InMemoryStore::seed(
        vec![bill("doc-1", "INV-2024-001", "Acme Corp", 1000.0, "USD")],
        vec![debit("tx-1", "Payment INV-2024-001 Acme Corp", 1000.0, "USD")],
    ));
    let progress = Arc::new(InMemoryProgress::new());
    let options = ReconcileOptions {
        run_id: Some("run-test".to_string()),
        ..fast_options()
    };
    let engine = ReconcileEngine::new(store, Arc::new(ScriptedReasoner::new()))
        .with_options(options)
        .with_progress(progress.clone());

    let report = engine.run("owner-1", None).await.unwrap();
    assert_eq!(report.run_id, "run-test");

    let log = progress.snapshot("run-test").unwrap();
    assert_eq!(log.status, RunStatus::Completed);
    assert_eq!(log.stats.as_ref().unwrap().auto_confirmed, 1);
    assert!(log
        .events
        .iter()
        .any(|e| e.category == EventCategory::Match));
    assert!(log
        .events
        .iter()
        .any(|e| e.category == EventCategory::Confirm));
}

#[tokio::test]
async fn test_empty_owner_and_empty_id_filter_rejected() {
    let store = Arc::new(InMemoryStore::new());
    let engine = ReconcileEngine::new(store, Arc::new(ScriptedReasoner::new()));

    assert!(matches!(
        engine.run("  ", None).await,
        Err(ReconcileError::MissingOwner)
    ));
    assert!(matches!(
        engine.run("owner-1", Some(vec![])).await,
        Err(ReconcileError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn test_no_transactions_is_empty_success() {
    let store = Arc::new(InMemoryStore::new());
    let engine = ReconcileEngine::new(store, Arc::new(ScriptedReasoner::new()))
        .with_options(fast_options());

    let report = engine.run("owner-1", None).await.unwrap();
    assert_eq!(report.stats.total_transactions, 0);
    assert!(report.matches.is_empty());
    assert_eq!(report.patterns_learned, 0);
}

#[tokio::test]
async fn test_second_transaction_sees_reduced_balance() {
    // Two debits both auto-confirm against the same bill; the second must
    // score against the post-allocation balance, not the original total.
    let store = Arc::new(InMemoryStore::seed(
        vec![bill("doc-1", "INV-2024-001", "Acme Corp", 1000.0, "USD")],
        vec![
            debit("tx-1", "Payment INV-2024-001 Acme Corp", 1000.0, "USD"),
            debit("tx-2", "Payment INV-2024-001 Acme Corp", 600.0, "USD"),
        ],
    ));
    let engine = ReconcileEngine::new(store.clone(), Arc::new(ScriptedReasoner::new()))
        .with_options(fast_options());

    let report = engine.run("owner-1", None).await.unwrap();

    // The first exhausts the document; the second cannot auto-confirm
    // because the remaining balance is zero.
    assert_eq!(report.stats.auto_confirmed, 1);
    let doc = ReconcileStore::get_document(store.as_ref(), "doc-1")
        .await
        .unwrap()
        .unwrap();
    assert!((doc.amount_paid - 1000.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_manual_confirm_applies_payment_and_learns() {
    let store = Arc::new(InMemoryStore::seed(
        vec![bill("doc-1", "INV-2024-001", "Acme Corp", 1000.0, "USD")],
        vec![debit("tx-1", "Payment INV-2024-001 Acme Corp", 1000.0, "USD")],
    ));
    let engine = ReconcileEngine::new(store.clone(), Arc::new(ScriptedReasoner::new()));

    let m = engine.confirm_manual("tx-1", "doc-1").await.unwrap();
    assert_eq!(m.resolution, Resolution::PaymentMatch);

    assert_eq!(store.get_transaction("tx-1").unwrap().status, TransactionStatus::Matched);
    let history = store.history();
    assert_eq!(history.len(), 1);
    assert!(history[0].manual);
    let pattern = store.pattern("owner-1", "acme corp").unwrap();
    assert_eq!(pattern.match_count, 1);

    // A second confirm of the same transaction is rejected.
    assert!(engine.confirm_manual("tx-1", "doc-1").await.is_err());
}
