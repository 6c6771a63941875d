use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use uuid::Uuid;

use pulse_common::{
    content_fingerprint, CanonicalRecord, ComplaintRegistrySettings, IngestError, NaturalKey,
    RawRecord, SourceId,
};
use pulse_ingest::testing::FlakyCanonicalStore;
use pulse_ingest::MergeEngine;
use pulse_sources::{
    ComplaintRegistryAdapter, NativeItem, Normalizer, RetryPolicy, SourceHttp, SourceRateLimiter,
};
use pulse_store::{CanonicalStore, InMemoryStore};

fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, h, m, 0).unwrap()
}

fn source() -> SourceId {
    SourceId::new("reddit")
}

/// A landed record. `observed` is the cursor field, `fresh` the freshness time.
fn rec(native: &str, observed: DateTime<Utc>, fresh: DateTime<Utc>, body: &str, run: Uuid) -> RawRecord {
    let source = source();
    RawRecord {
        natural_key: NaturalKey::derive(&source, native),
        source_id: source,
        observed_at: observed,
        freshness_time: fresh,
        tie_breaker_id: native.to_string(),
        fingerprint: content_fingerprint(body),
        payload: json!({"id": native, "body": body}),
        fetch_run_id: run,
    }
}

async fn canonical(store: &InMemoryStore) -> Vec<CanonicalRecord> {
    CanonicalStore::scan(store, &source(), None).await.unwrap()
}

/// The parts of canonical state that describe content, not merge bookkeeping.
fn content(rows: &[CanonicalRecord]) -> Vec<(String, serde_json::Value, DateTime<Utc>, String)> {
    rows.iter()
        .map(|r| {
            (
                r.natural_key.to_string(),
                r.payload.clone(),
                r.freshness_time,
                r.fingerprint.clone(),
            )
        })
        .collect()
}

fn engine(store: Arc<dyn CanonicalStore>) -> MergeEngine {
    MergeEngine::new(store)
}

#[tokio::test]
async fn merging_a_run_twice_equals_merging_it_once() {
    let store = Arc::new(InMemoryStore::new());
    let run = Uuid::new_v4();
    let records = vec![
        rec("t3_a", at(10, 0), at(10, 0), "first post", run),
        rec("t3_b", at(10, 5), at(10, 20), "second post", run),
        rec("t3_a", at(10, 0), at(10, 40), "first post, edited", run),
    ];

    let engine = engine(store.clone());
    engine.merge(&records, at(12, 0)).await.unwrap();
    let once = canonical(&store).await;

    let report = engine.merge(&records, at(13, 0)).await.unwrap();
    let twice = canonical(&store).await;

    assert_eq!(once, twice);
    assert_eq!(report.unchanged, 2);
    assert_eq!(report.inserted + report.updated, 0);
}

#[tokio::test]
async fn overlapping_runs_converge_in_either_order() {
    let r1 = Uuid::new_v4();
    let r2 = Uuid::new_v4();
    let run1 = vec![
        rec("t3_a", at(10, 0), at(10, 0), "a v1", r1),
        rec("t3_b", at(11, 0), at(11, 10), "b v2", r1),
        rec("t3_c", at(11, 30), at(11, 30), "c v1", r1),
    ];
    let run2 = vec![
        rec("t3_a", at(10, 0), at(10, 45), "a v2", r2),
        rec("t3_b", at(11, 0), at(11, 0), "b v1", r2),
        rec("t3_d", at(11, 50), at(11, 50), "d v1", r2),
    ];

    let forward = Arc::new(InMemoryStore::new());
    let e = engine(forward.clone());
    e.merge(&run1, at(12, 0)).await.unwrap();
    e.merge(&run2, at(13, 0)).await.unwrap();

    let backward = Arc::new(InMemoryStore::new());
    let e = engine(backward.clone());
    e.merge(&run2, at(12, 0)).await.unwrap();
    e.merge(&run1, at(13, 0)).await.unwrap();

    let f = content(&canonical(&forward).await);
    let b = content(&canonical(&backward).await);
    assert_eq!(f, b);
    assert_eq!(f.len(), 4);
    assert_eq!(f[0].1["body"], "a v2");
    assert_eq!(f[1].1["body"], "b v2");
}

#[tokio::test]
async fn freshness_never_decreases() {
    let store = Arc::new(InMemoryStore::new());
    let e = engine(store.clone());
    let key = NaturalKey::derive(&source(), "t1_x");

    let versions = [at(10, 30), at(10, 0), at(11, 0), at(10, 59), at(11, 0)];
    let mut previous = None;
    for (i, fresh) in versions.into_iter().enumerate() {
        let body = format!("comment v{i}");
        e.merge(&[rec("t1_x", at(9, 0), fresh, &body, Uuid::new_v4())], at(12, 0))
            .await
            .unwrap();
        let row = CanonicalStore::get(store.as_ref(), &source(), &key)
            .await
            .unwrap()
            .unwrap();
        if let Some(prev) = previous {
            assert!(row.freshness_time >= prev);
        }
        previous = Some(row.freshness_time);
    }
    assert_eq!(previous, Some(at(11, 0)));
}

#[tokio::test]
async fn later_edit_wins_regardless_of_arrival() {
    let store = Arc::new(InMemoryStore::new());
    let e = engine(store.clone());

    let edit = rec("t3_a", at(10, 0), at(11, 15), "edited body", Uuid::new_v4());
    let original = rec("t3_a", at(10, 0), at(10, 0), "original body", Uuid::new_v4());
    e.merge(&[edit.clone()], at(12, 0)).await.unwrap();
    e.merge(&[original], at(12, 30)).await.unwrap();

    let row = CanonicalStore::get(store.as_ref(), &source(), &edit.natural_key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.payload, edit.payload);
    assert_eq!(row.freshness_time, at(11, 15));
}

#[tokio::test]
async fn overlap_refetch_keeps_one_row_per_key() {
    // Two-hour overlap: run 2 starts at 09:30 and sees A again plus an edit of K1.
    let store = Arc::new(InMemoryStore::new());
    let e = engine(store.clone());
    let r1 = Uuid::new_v4();
    let r2 = Uuid::new_v4();

    let a = rec("K1", at(10, 0), at(10, 0), "A", r1);
    let b = rec("K2", at(11, 30), at(11, 30), "B", r1);
    let report1 = e.merge(&[a.clone(), b], at(12, 0)).await.unwrap();
    assert_eq!(report1.inserted, 2);

    let a_again = RawRecord { fetch_run_id: r2, ..a };
    let c = rec("K1", at(11, 45), at(11, 45), "C", r2);
    e.merge(&[a_again, c.clone()], at(13, 0)).await.unwrap();

    let rows = canonical(&store).await;
    assert_eq!(rows.len(), 2);
    let k1 = rows.iter().find(|r| r.natural_key.as_str() == "reddit:K1").unwrap();
    let k2 = rows.iter().find(|r| r.natural_key.as_str() == "reddit:K2").unwrap();
    assert_eq!(k1.freshness_time, at(11, 45));
    assert_eq!(k1.payload, c.payload);
    assert_eq!(k2.freshness_time, at(11, 30));
}

#[tokio::test]
async fn revised_trend_point_replaces_earlier_fetch() {
    let trends = SourceId::new("trends");
    let store = Arc::new(InMemoryStore::new());
    let e = engine(store.clone());
    let point = |value: i64, fetched: DateTime<Utc>| RawRecord {
        source_id: trends.clone(),
        natural_key: NaturalKey::derive(&trends, "X|Y|US|2025-01-01"),
        observed_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        freshness_time: fetched,
        tie_breaker_id: "X|Y|US|2025-01-01".to_string(),
        fingerprint: content_fingerprint(&value.to_string()),
        payload: json!({"value": value}),
        fetch_run_id: Uuid::new_v4(),
    };

    let first_fetch = Utc.with_ymd_and_hms(2025, 3, 1, 6, 0, 0).unwrap();
    let second_fetch = Utc.with_ymd_and_hms(2025, 3, 2, 6, 0, 0).unwrap();
    e.merge(&[point(54, first_fetch)], first_fetch).await.unwrap();
    let report = e.merge(&[point(61, second_fetch)], second_fetch).await.unwrap();
    assert_eq!(report.updated, 1);

    let rows = store.scan(&trends, None).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].payload["value"], 61);
    assert_eq!(rows[0].merge_count, 2);
}

#[tokio::test]
async fn equal_freshness_resolves_the_same_way_in_any_order() {
    let left = rec("t3_tie", at(10, 0), at(11, 0), "left edit", Uuid::new_v4());
    let right = rec("t3_tie", at(10, 0), at(11, 0), "right edit", Uuid::new_v4());

    let s1 = Arc::new(InMemoryStore::new());
    let e1 = engine(s1.clone());
    e1.merge(&[left.clone()], at(12, 0)).await.unwrap();
    let r1 = e1.merge(&[right.clone()], at(12, 1)).await.unwrap();

    let s2 = Arc::new(InMemoryStore::new());
    let e2 = engine(s2.clone());
    e2.merge(&[right.clone()], at(12, 0)).await.unwrap();
    let r2 = e2.merge(&[left.clone()], at(12, 1)).await.unwrap();

    assert_eq!(content(&canonical(&s1).await), content(&canonical(&s2).await));
    assert_eq!(r1.tie_conflicts, 1);
    assert_eq!(r2.tie_conflicts, 1);

    let winner = if left.version() > right.version() { &left } else { &right };
    assert_eq!(canonical(&s1).await[0].payload, winner.payload);
}

#[tokio::test]
async fn lost_swaps_are_retried_against_fresh_reads() {
    let inner = Arc::new(InMemoryStore::new());
    let flaky = Arc::new(FlakyCanonicalStore::new(inner.clone()).with_conflicts(2));
    let e = MergeEngine::new(flaky.clone()).with_max_cas_attempts(3);

    let report = e
        .merge(&[rec("t3_a", at(10, 0), at(10, 0), "body", Uuid::new_v4())], at(12, 0))
        .await
        .unwrap();
    assert_eq!(report.inserted, 1);
    assert_eq!(flaky.remaining_conflicts(), 0);
    assert_eq!(inner.canonical_len(&source()), 1);
}

#[tokio::test]
async fn exhausted_swaps_raise_merge_conflict() {
    let inner = Arc::new(InMemoryStore::new());
    let flaky = Arc::new(FlakyCanonicalStore::new(inner.clone()).with_conflicts(10));
    let e = MergeEngine::new(flaky).with_max_cas_attempts(3);

    let err = e
        .merge(&[rec("t3_a", at(10, 0), at(10, 0), "body", Uuid::new_v4())], at(12, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::MergeConflict { ref natural_key, .. } if natural_key == "reddit:t3_a"));
    assert_eq!(inner.canonical_len(&source()), 0);
}

#[tokio::test]
async fn storage_failure_mid_run_is_recoverable_by_remerging() {
    let inner = Arc::new(InMemoryStore::new());
    let flaky = Arc::new(FlakyCanonicalStore::new(inner.clone()).fail_after_writes(1));
    let e = MergeEngine::new(flaky.clone()).with_concurrency(1);
    let run = Uuid::new_v4();
    let records = vec![
        rec("t3_a", at(10, 0), at(10, 0), "a", run),
        rec("t3_b", at(10, 5), at(10, 5), "b", run),
        rec("t3_c", at(10, 10), at(10, 10), "c", run),
    ];

    let err = e.merge(&records, at(12, 0)).await.unwrap_err();
    assert!(matches!(err, IngestError::Storage(_)));
    assert_eq!(inner.canonical_len(&source()), 1);

    flaky.heal();
    let report = e.merge(&records, at(12, 5)).await.unwrap();
    assert_eq!(report.unchanged, 1);
    assert_eq!(report.inserted, 2);
    assert_eq!(inner.canonical_len(&source()), 3);
}

fn complaint_registry() -> ComplaintRegistryAdapter {
    let http = SourceHttp::new(
        SourceId::new("cfpb"),
        reqwest::Client::new(),
        Arc::new(SourceRateLimiter::per_minute(60).unwrap()),
        RetryPolicy::immediate(1),
    );
    ComplaintRegistryAdapter::new(
        http,
        ComplaintRegistrySettings {
            companies: Default::default(),
            lookback_days: 7,
            initial_days: 30,
            page_size: 100,
            max_pages: 5,
        },
    )
}

fn complaint(response: &str) -> NativeItem {
    NativeItem::new(
        json!({
            "complaint_id": "9100002",
            "entity": "chase",
            "company_response": response,
            "date_received": "2025-02-11T00:00:00Z",
            "date_sent_to_company": "2025-02-11T00:00:00Z",
            "text": "Issue: Problem with a purchase shown on your statement",
        }),
        Utc::now(),
    )
}

#[tokio::test]
async fn company_response_update_replaces_in_progress_complaint() {
    let adapter = complaint_registry();
    let normalizer = Normalizer::new(10);
    let store = Arc::new(InMemoryStore::new());
    let engine = engine(store.clone());
    let cfpb = SourceId::new("cfpb");

    let first = normalizer.normalize(&adapter, vec![complaint("In progress")], Uuid::new_v4());
    let report = engine.merge(&first.records, at(0, 0)).await.unwrap();
    assert_eq!(report.inserted, 1);

    let second = normalizer.normalize(
        &adapter,
        vec![complaint("Closed with explanation")],
        Uuid::new_v4(),
    );
    let report = engine.merge(&second.records, at(1, 0)).await.unwrap();
    assert_eq!(report.updated, 1);

    // A late refetch of the in-progress version cannot roll the response back.
    let stale = normalizer.normalize(&adapter, vec![complaint("In progress")], Uuid::new_v4());
    let report = engine.merge(&stale.records, at(2, 0)).await.unwrap();
    assert_eq!(report.unchanged, 1);

    let rows = CanonicalStore::scan(store.as_ref(), &cfpb, None).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].payload["company_response"], "Closed with explanation");
}
