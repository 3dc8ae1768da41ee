//! # Scavenge Tests
//!
//! Tests for:
//! - removal of deleted-stream records from completed chunks
//! - orphan prepares past and within the age limit
//! - index relocation surviving a restart

use bytes::Bytes;
use tempfile::TempDir;
use uuid::Uuid;

use chronicle_core::{
    config::NodeConfig, traits::ScavengeStatus, CommitRecord, ExpectedVersion, NewEvent,
    PrepareFlags, PrepareRecord, ReadEventResult, ReadStreamResult,
};
use chronicle_storage::StorageEngine;

fn test_config(dir: &TempDir) -> NodeConfig {
    let mut config = NodeConfig::with_db_path(dir.path());
    config.db.chunk_size = 4096;
    config.index.memtable_max_entries = 4;
    config
}

fn event(payload: &str) -> NewEvent {
    NewEvent::new("test-event", Bytes::from(payload.to_string()))
}

fn stream_len(engine: &StorageEngine, stream: &str) -> usize {
    match engine.read_stream_forward(stream, 0, 1000).unwrap() {
        ReadStreamResult::Success(slice) => slice.events.len(),
        other => panic!("unexpected {:?}", other),
    }
}

/// Seal the active chunk and wait until the chaser has passed it.
async fn complete_chunk(engine: &StorageEngine) {
    assert!(engine.writer().complete_chunk().await.unwrap());
    engine.wait_for_chaser(engine.writer_checkpoint()).await;
}

fn orphan_prepare(stream: &str, timestamp: i64) -> PrepareRecord {
    PrepareRecord {
        transaction_position: 0,
        transaction_offset: 0,
        expected_version: ExpectedVersion::ANY,
        flags: PrepareFlags::DATA | PrepareFlags::TRANSACTION_BEGIN,
        timestamp,
        event_id: Uuid::new_v4(),
        stream_id: stream.to_string(),
        event_type: "orphan".to_string(),
        data: Bytes::from_static(b"never committed"),
        metadata: Bytes::new(),
    }
}

#[tokio::test]
async fn test_scavenge_removes_deleted_stream() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    {
        let engine = StorageEngine::open(config.clone()).await.unwrap();
        let doomed: Vec<NewEvent> = (0..5).map(|i| event(&format!("doomed-{}", i))).collect();
        engine
            .write_events("doomed", ExpectedVersion::NoStream, doomed)
            .await
            .unwrap();
        for i in 0..3 {
            engine
                .write_events("keeper", ExpectedVersion::Any, vec![event(&format!("keep-{}", i))])
                .await
                .unwrap();
        }
        engine.delete_stream("doomed", ExpectedVersion::Any).await.unwrap();
        complete_chunk(&engine).await;

        let before = engine.log().chunk_infos()[0];
        let result = engine.scavenge().await.unwrap().expect("no pass running");
        assert_eq!(result.chunks_scavenged, 1);
        assert_eq!(result.chunks_skipped, 0);
        // five prepares and their commit
        assert_eq!(result.records_discarded, 6);
        assert!(result.bytes_reclaimed > 0);
        assert!(!result.stopped_early);

        let after = engine.log().chunk_infos()[0];
        assert_eq!(after.scavenge_version, before.scavenge_version + 1);
        assert!(after.file_size < before.file_size);
        assert_eq!(after.start_position, before.start_position);

        assert_eq!(stream_len(&engine, "keeper"), 3);
        assert_eq!(engine.read_event("doomed", 0).unwrap(), ReadEventResult::StreamDeleted);

        let all = engine.read_all_forward(0, 100).unwrap();
        let streams: Vec<&str> = all.events.iter().map(|e| e.stream_id.as_str()).collect();
        assert_eq!(streams, vec!["keeper", "keeper", "keeper"]);
        assert_eq!(engine.scavenger().last_result(), Some(result));

        engine.shutdown().await.unwrap();
    }

    let engine = StorageEngine::open(config).await.unwrap();
    assert_eq!(engine.log().chunk_infos()[0].scavenge_version, 1);
    assert_eq!(stream_len(&engine, "keeper"), 3);
    match engine.read_event("keeper", 2).unwrap() {
        ReadEventResult::Success(e) => assert_eq!(e.data, Bytes::from_static(b"keep-2")),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(engine.read_event("doomed", 3).unwrap(), ReadEventResult::StreamDeleted);

    let next = engine
        .write_events("keeper", ExpectedVersion::Exact(2), vec![event("keep-3")])
        .await
        .unwrap();
    assert_eq!(next.first_event_number, 3);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_scavenge_leaves_live_chunks_alone() {
    let dir = TempDir::new().unwrap();
    let engine = StorageEngine::open(test_config(&dir)).await.unwrap();

    for i in 0..4 {
        engine
            .write_events("live", ExpectedVersion::Any, vec![event(&format!("e{}", i))])
            .await
            .unwrap();
    }
    complete_chunk(&engine).await;
    // still active, never scavenged
    engine
        .write_events("live", ExpectedVersion::Any, vec![event("tail")])
        .await
        .unwrap();

    let result = engine.scavenge().await.unwrap().unwrap();
    assert_eq!(result.chunks_scavenged, 0);
    assert_eq!(result.records_discarded, 0);
    assert_eq!(result.records_kept, 8);
    assert!(engine.log().chunk_infos().iter().all(|c| c.scavenge_version == 0));
    assert_eq!(stream_len(&engine, "live"), 5);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_scavenge_discards_old_orphan_prepare() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.scavenge.orphan_prepare_age_secs = 0;
    let engine = StorageEngine::open(config).await.unwrap();

    engine
        .write_events("stable", ExpectedVersion::Any, vec![event("a")])
        .await
        .unwrap();
    engine.writer().append_prepare(orphan_prepare("limbo", 0)).await.unwrap();
    engine
        .write_events("stable", ExpectedVersion::Any, vec![event("b")])
        .await
        .unwrap();
    complete_chunk(&engine).await;

    let result = engine.scavenge().await.unwrap().unwrap();
    assert_eq!(result.chunks_scavenged, 1);
    assert_eq!(result.records_discarded, 1);
    assert_eq!(stream_len(&engine, "stable"), 2);
    assert_eq!(engine.read_event("limbo", 0).unwrap(), ReadEventResult::NoStream);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_scavenge_skips_chunk_with_young_orphan() {
    let dir = TempDir::new().unwrap();
    let engine = StorageEngine::open(test_config(&dir)).await.unwrap();

    engine
        .write_events("doomed", ExpectedVersion::Any, vec![event("x")])
        .await
        .unwrap();
    engine.delete_stream("doomed", ExpectedVersion::Any).await.unwrap();
    let now = chrono::Utc::now().timestamp_millis();
    engine.writer().append_prepare(orphan_prepare("limbo", now)).await.unwrap();
    complete_chunk(&engine).await;

    let result = engine.scavenge().await.unwrap().unwrap();
    assert_eq!(result.chunks_scavenged, 0);
    assert_eq!(result.chunks_skipped, 1);
    assert_eq!(engine.log().chunk_infos()[0].scavenge_version, 0);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_scavenge_keeps_prepare_committed_in_later_chunk() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.scavenge.orphan_prepare_age_secs = 0;
    let engine = StorageEngine::open(config).await.unwrap();

    engine
        .write_events("doomed", ExpectedVersion::Any, vec![event("x")])
        .await
        .unwrap();
    engine.delete_stream("doomed", ExpectedVersion::Any).await.unwrap();
    let mut prepare = orphan_prepare("spanning", 0);
    prepare.flags.insert(PrepareFlags::TRANSACTION_END);
    let transaction_position = engine.writer().append_prepare(prepare).await.unwrap();
    complete_chunk(&engine).await;

    engine
        .writer()
        .append_commit(CommitRecord {
            transaction_position,
            first_event_number: 0,
            event_count: 1,
            timestamp: 0,
        })
        .await
        .unwrap();
    engine.wait_for_chaser(engine.writer_checkpoint()).await;
    assert!(matches!(engine.read_event("spanning", 0).unwrap(), ReadEventResult::Success(_)));

    let result = engine.scavenge().await.unwrap().unwrap();
    assert_eq!(result.chunks_scavenged, 0);
    assert_eq!(result.chunks_skipped, 1);
    match engine.read_event("spanning", 0).unwrap() {
        ReadEventResult::Success(e) => assert_eq!(e.data, Bytes::from_static(b"never committed")),
        other => panic!("unexpected {:?}", other),
    }

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_start_scavenge_runs_in_background() {
    let dir = TempDir::new().unwrap();
    let engine = StorageEngine::open(test_config(&dir)).await.unwrap();

    engine
        .write_events("bg", ExpectedVersion::Any, vec![event("x")])
        .await
        .unwrap();
    engine.delete_stream("bg", ExpectedVersion::Any).await.unwrap();
    complete_chunk(&engine).await;

    assert_eq!(engine.start_scavenge(), ScavengeStatus::Started);
    for _ in 0..200 {
        if !engine.scavenger().is_running() && engine.scavenger().last_result().is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let result = engine.scavenger().last_result().expect("background pass finished");
    assert_eq!(result.chunks_scavenged, 1);
    assert!(!engine.scavenger().is_running());

    engine.shutdown().await.unwrap();
}
