//! End-to-end search over ingested libraries: exact identification,
//! similarity ranking, degraded-store behavior.

mod common;

use std::sync::Arc;

use tempfile::TempDir;

use common::faults::FailingFingerprintIndex;
use sonance_core::config::FingerprintConfig;
use sonance_core::embedding::SqliteVectorStore;
use sonance_core::{
    Engine, EngineEvent, Error, IngestStatus, LaneStatus, SearchMode, SearchOutcome, SearchRequest,
};

#[tokio::test]
async fn test_excerpt_of_long_track_identifies_it() {
    let dir = TempDir::new().unwrap();
    let engine = common::open_engine(&dir).await;

    // A four-minute track plus an unrelated shorter one
    let x = dir.path().join("x.wav");
    common::write_melody_wav(&x, 250.0, 11.0, 240.0);
    let y = dir.path().join("y.wav");
    common::write_melody_wav(&y, 700.0, 17.0, 45.0);

    let track_x = engine.ingest_file(&x).await.unwrap().track_id.unwrap();
    engine.ingest_file(&y).await.unwrap();

    // Clean 10s excerpt from the middle of x, mode both
    let clip = common::melody_wav_bytes(250.0, 11.0, 95.0, 10.0);
    let response = engine
        .search(SearchRequest::new(SearchMode::Both), clip)
        .await
        .unwrap();

    assert_eq!(response.outcome, SearchOutcome::Complete);
    assert_eq!(response.exact.status, LaneStatus::Completed);
    assert!(!response.exact.matches.is_empty());
    assert_eq!(response.exact.matches[0].track_id, track_x);
    assert!(
        response.exact.matches[0].confidence > 0.8,
        "confidence {}",
        response.exact.matches[0].confidence
    );
    assert!(
        (response.exact.matches[0].offset_seconds - 95.0).abs() < 1.0,
        "offset {}",
        response.exact.matches[0].offset_seconds
    );
    assert_eq!(response.vibe.status, LaneStatus::Completed);
}

#[tokio::test]
async fn test_short_subclip_clears_aligned_hash_floor() {
    let dir = TempDir::new().unwrap();
    let engine = common::open_engine(&dir).await;

    let wav = dir.path().join("track.wav");
    common::write_melody_wav(&wav, 250.0, 11.0, 30.0);
    let track_id = engine.ingest_file(&wav).await.unwrap().track_id.unwrap();

    // 3.5s is above the query minimum but under the sub-window threshold
    let clip = common::melody_wav_bytes(250.0, 11.0, 12.0, 3.5);
    let response = engine
        .search(SearchRequest::new(SearchMode::Exact), clip)
        .await
        .unwrap();

    assert_eq!(response.exact.status, LaneStatus::Completed);
    assert_eq!(response.exact.matches[0].track_id, track_id);
    assert!(
        response.exact.matches[0].aligned_hashes
            >= FingerprintConfig::default().min_aligned_hashes
    );
    assert_eq!(response.vibe.status, LaneStatus::Skipped);
}

#[tokio::test]
async fn test_too_short_query_rejected_before_lanes() {
    let dir = TempDir::new().unwrap();
    let engine = common::open_engine(&dir).await;
    let mut events = engine.subscribe();

    let clip = common::melody_wav_bytes(250.0, 11.0, 0.0, 2.0);
    let err = engine
        .search(SearchRequest::new(SearchMode::Both), clip)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::QueryTooShort { .. }), "{:?}", err);
    // Rejected before any lane ran: nothing reached the event bus
    assert!(matches!(
        events.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn test_dead_fingerprint_store_degrades_to_vibe_only() {
    common::init_tracing();
    let dir = TempDir::new().unwrap();
    let config = common::engine_config(dir.path());

    let vectors = Arc::new(
        SqliteVectorStore::open(&config.storage.vector_db())
            .await
            .unwrap(),
    );
    let engine = Engine::open_with_stores(config, Arc::new(FailingFingerprintIndex), vectors)
        .await
        .unwrap();
    let mut events = engine.subscribe();

    // Ingestion still commits through the healthy embedding half
    let wav = dir.path().join("track.wav");
    common::write_melody_wav(&wav, 250.0, 11.0, 30.0);
    let report = engine.ingest_file(&wav).await.unwrap();
    assert_eq!(report.status, IngestStatus::Ingested);
    let track_id = report.track_id.unwrap();

    let clip = common::melody_wav_bytes(250.0, 11.0, 8.0, 10.0);
    let response = engine
        .search(SearchRequest::new(SearchMode::Both), clip)
        .await
        .unwrap();

    assert_eq!(response.outcome, SearchOutcome::Partial);
    assert_eq!(response.exact.status, LaneStatus::Failed);
    assert!(response.exact.matches.is_empty());
    assert_eq!(response.vibe.status, LaneStatus::Completed);
    assert!(!response.vibe.matches.is_empty());
    assert_eq!(response.vibe.matches[0].track_id, track_id);

    let mut saw_lane_failure = false;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::LaneFailed { lane, .. } = event {
            assert_eq!(lane, "exact");
            saw_lane_failure = true;
        }
    }
    assert!(saw_lane_failure);
}

#[tokio::test]
async fn test_vibe_ranks_source_first_with_monotone_scores() {
    let dir = TempDir::new().unwrap();
    let engine = common::open_engine(&dir).await;

    // Durations spread past the near-duplicate window so three distinct
    // melodies all commit
    let fixtures = [
        ("a.wav", 250.0, 11.0, 28.0),
        ("b.wav", 330.0, 13.0, 32.0),
        ("c.wav", 700.0, 17.0, 37.0),
    ];
    let mut ids = Vec::new();
    for (name, base, step, seconds) in fixtures {
        let path = dir.path().join(name);
        common::write_melody_wav(&path, base, step, seconds);
        let report = engine.ingest_file(&path).await.unwrap();
        assert_eq!(report.status, IngestStatus::Ingested, "{}", name);
        ids.push(report.track_id.unwrap());
    }

    let clip = common::melody_wav_bytes(250.0, 11.0, 6.0, 10.0);
    let response = engine
        .search(SearchRequest::new(SearchMode::Vibe), clip)
        .await
        .unwrap();

    assert_eq!(response.vibe.status, LaneStatus::Completed);
    assert_eq!(response.exact.status, LaneStatus::Skipped);
    assert!(!response.vibe.matches.is_empty());
    assert_eq!(response.vibe.matches[0].track_id, ids[0]);
    for pair in response.vibe.matches.windows(2) {
        assert!(
            pair[0].score >= pair[1].score,
            "scores out of order: {} then {}",
            pair[0].score,
            pair[1].score
        );
    }
}

#[tokio::test]
async fn test_exclude_and_result_cap_are_honored() {
    let dir = TempDir::new().unwrap();
    let engine = common::open_engine(&dir).await;

    let a = dir.path().join("a.wav");
    common::write_melody_wav(&a, 250.0, 11.0, 28.0);
    let id_a = engine.ingest_file(&a).await.unwrap().track_id.unwrap();
    let b = dir.path().join("b.wav");
    common::write_melody_wav(&b, 330.0, 13.0, 32.0);
    engine.ingest_file(&b).await.unwrap();

    // "More like this" query: the seed track itself must not come back
    let clip = common::melody_wav_bytes(250.0, 11.0, 4.0, 10.0);
    let response = engine
        .search(
            SearchRequest::new(SearchMode::Vibe)
                .with_exclude_track(id_a)
                .with_max_results(1),
            clip,
        )
        .await
        .unwrap();

    assert!(response.vibe.matches.len() <= 1);
    assert!(response.vibe.matches.iter().all(|m| m.track_id != id_a));
}
