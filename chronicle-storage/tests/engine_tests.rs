//! # Storage Engine Tests
//!
//! End-to-end behaviour through the public engine API:
//! - optimistic concurrency on appends
//! - stream deletion
//! - forward, backward and all-stream reads
//! - restart with index persisted and replayed

use bytes::Bytes;
use tempfile::TempDir;

use chronicle_core::{
    config::NodeConfig, traits::EventStore, Error, ExpectedVersion, NewEvent, ReadEventResult,
    ReadStreamResult, StreamSlice, StreamVersion,
};
use chronicle_storage::StorageEngine;

fn test_config(dir: &TempDir) -> NodeConfig {
    let mut config = NodeConfig::with_db_path(dir.path());
    config.db.chunk_size = 4096;
    config.index.memtable_max_entries = 8;
    config
}

fn event(payload: &str) -> NewEvent {
    NewEvent::json("test-event", Bytes::from(payload.to_string()))
}

fn expect_slice(result: ReadStreamResult) -> StreamSlice {
    match result {
        ReadStreamResult::Success(slice) => slice,
        other => panic!("expected a slice, got {:?}", other),
    }
}

fn numbers(slice: &StreamSlice) -> Vec<i32> {
    slice.events.iter().map(|e| e.event_number).collect()
}

// =============================================================================
// Appends and expected versions
// =============================================================================

#[tokio::test]
async fn test_append_and_expected_version() {
    let dir = TempDir::new().unwrap();
    let engine = StorageEngine::open(test_config(&dir)).await.unwrap();

    let first = engine
        .write_events("acct-1", ExpectedVersion::NoStream, vec![event(r#"{"p":0}"#)])
        .await
        .unwrap();
    assert_eq!(first.first_event_number, 0);
    assert_eq!(first.last_event_number, 0);

    match engine.read_event("acct-1", 0).unwrap() {
        ReadEventResult::Success(e) => {
            assert_eq!(e.data, Bytes::from_static(br#"{"p":0}"#));
            assert!(e.is_json);
            assert_eq!(e.log_position, first.prepare_positions[0]);
        }
        other => panic!("unexpected {:?}", other),
    }

    let second = engine
        .write_events("acct-1", ExpectedVersion::Exact(0), vec![event(r#"{"p":1}"#)])
        .await
        .unwrap();
    assert_eq!(second.first_event_number, 1);
    match engine.read_event("acct-1", 1).unwrap() {
        ReadEventResult::Success(e) => assert_eq!(e.data, Bytes::from_static(br#"{"p":1}"#)),
        other => panic!("unexpected {:?}", other),
    }

    let stale = engine
        .write_events("acct-1", ExpectedVersion::Exact(0), vec![event(r#"{"p":2}"#)])
        .await;
    match stale {
        Err(Error::WrongExpectedVersion { actual, .. }) => assert_eq!(actual, StreamVersion::At(1)),
        other => panic!("expected WrongExpectedVersion, got {:?}", other),
    }

    let again = engine
        .write_events("acct-1", ExpectedVersion::NoStream, vec![event("{}")])
        .await;
    assert!(matches!(again, Err(Error::WrongExpectedVersion { .. })));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_multi_event_transaction_is_contiguous() {
    let dir = TempDir::new().unwrap();
    let engine = StorageEngine::open(test_config(&dir)).await.unwrap();

    let events: Vec<NewEvent> = (0..5).map(|i| event(&format!(r#"{{"i":{}}}"#, i))).collect();
    let result = engine
        .write_events("orders", ExpectedVersion::Any, events)
        .await
        .unwrap();
    assert_eq!(result.first_event_number, 0);
    assert_eq!(result.last_event_number, 4);
    assert_eq!(result.prepare_positions.len(), 5);
    assert!(result.prepare_positions.windows(2).all(|w| w[0] < w[1]));
    assert!(result.commit_position.unwrap() > result.prepare_positions[4]);

    let slice = expect_slice(engine.read_stream_forward("orders", 0, 100).unwrap());
    assert_eq!(numbers(&slice), vec![0, 1, 2, 3, 4]);
    assert!(slice.is_end_of_stream);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_empty_write_appends_nothing() {
    let dir = TempDir::new().unwrap();
    let engine = StorageEngine::open(test_config(&dir)).await.unwrap();

    let before = engine.writer_checkpoint();
    let result = engine
        .write_events("quiet", ExpectedVersion::Any, Vec::new())
        .await
        .unwrap();
    assert_eq!(result.commit_position, None);
    assert_eq!(result.first_event_number, 0);
    assert_eq!(engine.writer_checkpoint(), before);
    assert_eq!(engine.read_event("quiet", 0).unwrap(), ReadEventResult::NoStream);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_checkpoints_meet_after_write() {
    let dir = TempDir::new().unwrap();
    let engine = StorageEngine::open(test_config(&dir)).await.unwrap();

    let result = engine
        .write_events("cp", ExpectedVersion::Any, vec![event("{}")])
        .await
        .unwrap();
    assert_eq!(engine.writer_checkpoint(), result.next_position);
    assert!(engine.chaser_checkpoint() > result.commit_position.unwrap());

    engine.wait_for_chaser(engine.writer_checkpoint()).await;
    assert_eq!(engine.chaser_checkpoint(), engine.writer_checkpoint());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rejected_write_never_becomes_visible() {
    let dir = TempDir::new().unwrap();
    let engine = StorageEngine::open(test_config(&dir)).await.unwrap();

    let oversized = NewEvent::new("test-event", Bytes::from(vec![b'x'; 8000]));
    let (small, big) = tokio::join!(
        engine.write_events("ok", ExpectedVersion::Any, vec![event("small")]),
        engine.write_events("big", ExpectedVersion::Any, vec![oversized]),
    );
    assert!(matches!(big, Err(Error::WriteError { .. })));
    let small = small.unwrap();

    // a later batch must not carry anything of the rejected request
    engine
        .write_events("other", ExpectedVersion::Any, vec![event("later")])
        .await
        .unwrap();
    assert!(matches!(engine.read_event("ok", 0).unwrap(), ReadEventResult::Success(_)));
    assert_eq!(engine.read_event("big", 0).unwrap(), ReadEventResult::NoStream);
    assert_eq!(small.first_event_number, 0);

    let all = engine.read_all_forward(0, 100).unwrap();
    let streams: Vec<&str> = all.events.iter().map(|e| e.stream_id.as_str()).collect();
    assert_eq!(streams, vec!["ok", "other"]);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_transaction_with_oversized_event_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let engine = StorageEngine::open(test_config(&dir)).await.unwrap();

    let before = engine.writer_checkpoint();
    let events = vec![
        event("first"),
        event("second"),
        NewEvent::new("test-event", Bytes::from(vec![b'x'; 5000])),
    ];
    let result = engine.write_events("tx", ExpectedVersion::NoStream, events).await;
    assert!(matches!(result, Err(Error::WriteError { .. })));
    assert_eq!(engine.writer_checkpoint(), before);
    assert_eq!(engine.log().writer_position(), before);

    let retry = engine
        .write_events("tx", ExpectedVersion::NoStream, vec![event("first")])
        .await
        .unwrap();
    assert_eq!(retry.first_event_number, 0);
    assert_eq!(expect_slice(engine.read_stream_forward("tx", 0, 10).unwrap()).events.len(), 1);
    engine.shutdown().await.unwrap();
}

// =============================================================================
// Deletion
// =============================================================================

#[tokio::test]
async fn test_delete_stream() {
    let dir = TempDir::new().unwrap();
    let engine = StorageEngine::open(test_config(&dir)).await.unwrap();

    engine
        .write_events("acct-1", ExpectedVersion::NoStream, vec![event("{}"), event("{}")])
        .await
        .unwrap();
    engine
        .delete_stream("acct-1", ExpectedVersion::Exact(1))
        .await
        .unwrap();

    assert_eq!(engine.read_event("acct-1", 0).unwrap(), ReadEventResult::StreamDeleted);
    assert_eq!(engine.read_event("acct-1", -1).unwrap(), ReadEventResult::StreamDeleted);
    assert_eq!(
        engine.read_stream_forward("acct-1", 0, 10).unwrap(),
        ReadStreamResult::StreamDeleted
    );
    assert_eq!(
        engine.read_stream_backward("acct-1", -1, 10).unwrap(),
        ReadStreamResult::StreamDeleted
    );
    assert!(engine.read_index().is_stream_deleted("acct-1").unwrap());

    let write = engine
        .write_events("acct-1", ExpectedVersion::Any, vec![event("{}")])
        .await;
    assert!(matches!(write, Err(Error::StreamDeleted { .. })));
    let delete = engine.delete_stream("acct-1", ExpectedVersion::Any).await;
    assert!(matches!(delete, Err(Error::StreamDeleted { .. })));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_delete_with_wrong_version_is_rejected() {
    let dir = TempDir::new().unwrap();
    let engine = StorageEngine::open(test_config(&dir)).await.unwrap();

    engine
        .write_events("acct-2", ExpectedVersion::Any, vec![event("{}")])
        .await
        .unwrap();
    let result = engine.delete_stream("acct-2", ExpectedVersion::Exact(5)).await;
    assert!(matches!(result, Err(Error::WrongExpectedVersion { .. })));
    assert!(matches!(engine.read_event("acct-2", 0).unwrap(), ReadEventResult::Success(_)));

    engine.shutdown().await.unwrap();
}

// =============================================================================
// Reads
// =============================================================================

#[tokio::test]
async fn test_read_missing_stream_and_event() {
    let dir = TempDir::new().unwrap();
    let engine = StorageEngine::open(test_config(&dir)).await.unwrap();

    assert_eq!(engine.read_event("nobody", 0).unwrap(), ReadEventResult::NoStream);
    assert_eq!(
        engine.read_stream_forward("nobody", 0, 10).unwrap(),
        ReadStreamResult::NoStream
    );

    engine
        .write_events("somebody", ExpectedVersion::Any, vec![event("{}")])
        .await
        .unwrap();
    assert_eq!(engine.read_event("somebody", 7).unwrap(), ReadEventResult::NotFound);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_read_stream_paging() {
    let dir = TempDir::new().unwrap();
    let engine = StorageEngine::open(test_config(&dir)).await.unwrap();

    for i in 0..10 {
        engine
            .write_events("paged", ExpectedVersion::Any, vec![event(&format!(r#"{{"i":{}}}"#, i))])
            .await
            .unwrap();
    }

    let page = expect_slice(engine.read_stream_forward("paged", 0, 4).unwrap());
    assert_eq!(numbers(&page), vec![0, 1, 2, 3]);
    assert_eq!(page.next_event_number, 4);
    assert_eq!(page.last_event_number, 9);
    assert!(!page.is_end_of_stream);

    let page = expect_slice(engine.read_stream_forward("paged", 8, 4).unwrap());
    assert_eq!(numbers(&page), vec![8, 9]);
    assert_eq!(page.next_event_number, 10);
    assert!(page.is_end_of_stream);

    let past = expect_slice(engine.read_stream_forward("paged", 20, 4).unwrap());
    assert!(past.events.is_empty());
    assert!(past.is_end_of_stream);

    let back = expect_slice(engine.read_stream_backward("paged", -1, 3).unwrap());
    assert_eq!(numbers(&back), vec![9, 8, 7]);
    assert_eq!(back.next_event_number, 6);
    assert!(!back.is_end_of_stream);

    let back = expect_slice(engine.read_stream_backward("paged", 1, 5).unwrap());
    assert_eq!(numbers(&back), vec![1, 0]);
    assert!(back.is_end_of_stream);

    match engine.read_event("paged", -1).unwrap() {
        ReadEventResult::Success(e) => assert_eq!(e.event_number, 9),
        other => panic!("unexpected {:?}", other),
    }

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_read_all_forward_in_commit_order() {
    let dir = TempDir::new().unwrap();
    let engine = StorageEngine::open(test_config(&dir)).await.unwrap();

    let streams = ["alpha", "beta", "gamma"];
    for round in 0..4 {
        for stream in streams {
            engine
                .write_events(stream, ExpectedVersion::Any, vec![event(&format!(r#"{{"r":{}}}"#, round))])
                .await
                .unwrap();
        }
    }
    engine.delete_stream("gamma", ExpectedVersion::Any).await.unwrap();

    let mut seen = Vec::new();
    let mut position = 0;
    loop {
        let slice = engine.read_all_forward(position, 5).unwrap();
        seen.extend(slice.events.iter().map(|e| (e.stream_id.clone(), e.event_number)));
        assert!(slice.next_position >= position);
        position = slice.next_position;
        if slice.is_end {
            break;
        }
    }

    let expected: Vec<(String, i32)> = (0..4)
        .flat_map(|round| streams.iter().map(move |s| (s.to_string(), round)))
        .collect();
    assert_eq!(seen, expected);
    assert_eq!(position, engine.chaser_checkpoint());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_events_span_chunks() {
    let dir = TempDir::new().unwrap();
    let engine = StorageEngine::open(test_config(&dir)).await.unwrap();

    let payload = "x".repeat(300);
    for _ in 0..40 {
        engine
            .write_events("big", ExpectedVersion::Any, vec![event(&payload)])
            .await
            .unwrap();
    }

    let stats = engine.get_stats();
    assert!(stats.chunk_count > 2, "expected several chunks, got {}", stats.chunk_count);
    assert_eq!(stats.completed_chunks, stats.chunk_count - 1);
    assert!(stats.index_entries >= 40);

    let slice = expect_slice(engine.read_stream_forward("big", 0, 100).unwrap());
    assert_eq!(slice.events.len(), 40);
    assert!(slice.events.iter().all(|e| e.data.len() == 300));

    let all = engine.read_all_forward(0, 1000).unwrap();
    assert_eq!(all.events.len(), 40);
    assert!(all.is_end);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_event_store_trait() {
    let dir = TempDir::new().unwrap();
    let engine = StorageEngine::open(test_config(&dir)).await.unwrap();
    let store: &dyn EventStore = &engine;

    store
        .append_to_stream("trait", ExpectedVersion::NoStream, vec![event("{}")])
        .await
        .unwrap();
    assert!(matches!(store.read_event("trait", 0).await.unwrap(), ReadEventResult::Success(_)));

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.writer_checkpoint, stats.chaser_checkpoint);
    assert!(!stats.scavenge_running);

    engine.shutdown().await.unwrap();
}

// =============================================================================
// Restart
// =============================================================================

#[tokio::test]
async fn test_restart_preserves_streams() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let end = {
        let engine = StorageEngine::open(config.clone()).await.unwrap();
        for i in 0..20 {
            engine
                .write_events(&format!("s-{}", i % 3), ExpectedVersion::Any, vec![event("{}")])
                .await
                .unwrap();
        }
        engine.delete_stream("s-2", ExpectedVersion::Any).await.unwrap();
        engine.shutdown().await.unwrap();
        engine.writer_checkpoint()
    };

    let engine = StorageEngine::open(config).await.unwrap();
    assert_eq!(engine.writer_checkpoint(), end);
    assert_eq!(engine.chaser_checkpoint(), end);

    let s0 = expect_slice(engine.read_stream_forward("s-0", 0, 100).unwrap());
    assert_eq!(s0.events.len(), 7);
    let s1 = expect_slice(engine.read_stream_forward("s-1", 0, 100).unwrap());
    assert_eq!(s1.events.len(), 7);
    assert_eq!(engine.read_event("s-2", 0).unwrap(), ReadEventResult::StreamDeleted);

    let next = engine
        .write_events("s-0", ExpectedVersion::Exact(6), vec![event("{}")])
        .await
        .unwrap();
    assert_eq!(next.first_event_number, 7);

    engine.shutdown().await.unwrap();
}
