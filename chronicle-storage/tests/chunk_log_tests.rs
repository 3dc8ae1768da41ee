//! # Chunk Log Tests
//!
//! Tests for:
//! - append, read-back and rollover across chunks
//! - transactions kept inside one chunk by `reserve`
//! - reopen of completed and active chunks

use bytes::Bytes;
use tempfile::TempDir;
use uuid::Uuid;

use chronicle_core::{
    config::DbConfig, metrics::Metrics, CommitRecord, Error, LogRecord, PrepareFlags, PrepareRecord,
};
use chronicle_storage::chunk::{frame_len, verify_chunks, ChunkLog, LogEntry};

const CHUNK_SIZE: u64 = 4096;

fn db_config(dir: &TempDir) -> DbConfig {
    DbConfig {
        path: dir.path().to_path_buf(),
        chunk_size: CHUNK_SIZE,
        ..DbConfig::default()
    }
}

fn prepare(stream: &str, data_size: usize) -> LogRecord {
    LogRecord::Prepare(PrepareRecord {
        transaction_position: 0,
        transaction_offset: 0,
        expected_version: -2,
        flags: PrepareFlags::DATA | PrepareFlags::TRANSACTION_BEGIN | PrepareFlags::TRANSACTION_END,
        timestamp: 1_700_000_000_000,
        event_id: Uuid::new_v4(),
        stream_id: stream.to_string(),
        event_type: "test".to_string(),
        data: Bytes::from(vec![b'x'; data_size]),
        metadata: Bytes::new(),
    })
}

fn commit(transaction_position: u64, first_event_number: i32) -> LogRecord {
    LogRecord::Commit(CommitRecord {
        transaction_position,
        first_event_number,
        event_count: 1,
        timestamp: 1_700_000_000_000,
    })
}

fn read_all(log: &ChunkLog) -> Vec<LogEntry> {
    log.read_sequential_from(0, log.writer_position())
        .collect::<chronicle_core::Result<Vec<_>>>()
        .unwrap()
}

#[test]
fn test_append_and_read_back() {
    let dir = TempDir::new().unwrap();
    let log = ChunkLog::open(&db_config(&dir), Metrics::new()).unwrap();

    let record = prepare("orders", 100);
    let position = log.append(&record).unwrap();
    assert_eq!(position, 0);
    assert_eq!(log.writer_position(), frame_len(&record) as u64);

    let end = log.flush().unwrap();
    assert_eq!(end, log.writer_position());
    assert_eq!(log.read_at(0).unwrap(), record);
    assert!(matches!(log.read_at(end), Err(Error::NotFound { .. })));
}

#[test]
fn test_rollover_keeps_records_whole() {
    let dir = TempDir::new().unwrap();
    let log = ChunkLog::open(&db_config(&dir), Metrics::new()).unwrap();

    let mut positions = Vec::new();
    for i in 0..30 {
        positions.push(log.append(&prepare(&format!("s-{}", i), 500)).unwrap());
    }
    log.flush().unwrap();

    let infos = log.chunk_infos();
    assert!(infos.len() > 3);
    assert!(infos[..infos.len() - 1].iter().all(|c| c.completed));
    assert!(!infos.last().unwrap().completed);

    let entries = read_all(&log);
    assert_eq!(entries.len(), 30);
    for (entry, position) in entries.iter().zip(&positions) {
        assert_eq!(entry.position, *position);
        assert_eq!(entry.position / CHUNK_SIZE, (entry.next_position - 1) / CHUNK_SIZE);
    }
}

#[test]
fn test_reserve_moves_transaction_to_next_chunk() {
    let dir = TempDir::new().unwrap();
    let log = ChunkLog::open(&db_config(&dir), Metrics::new()).unwrap();

    let filler = prepare("filler", 3000);
    log.append(&filler).unwrap();

    let first = prepare("tx", 600);
    let second = prepare("tx", 600);
    let total = frame_len(&first) + frame_len(&second) + frame_len(&commit(0, 0));
    let reserved = log.reserve(total, frame_len(&first)).unwrap();
    assert_eq!(reserved, CHUNK_SIZE);

    assert_eq!(log.append(&first).unwrap(), reserved);
    log.append(&second).unwrap();
    let commit_position = log.append(&commit(reserved, 0)).unwrap();
    assert_eq!(commit_position / CHUNK_SIZE, 1);
}

#[test]
fn test_oversized_record_is_rejected() {
    let dir = TempDir::new().unwrap();
    let log = ChunkLog::open(&db_config(&dir), Metrics::new()).unwrap();

    let result = log.append(&prepare("huge", CHUNK_SIZE as usize));
    assert!(matches!(result, Err(Error::WriteError { .. })));
    // rejected before touching the file, the log stays writable
    log.append(&prepare("small", 10)).unwrap();
}

#[test]
fn test_rollback_discards_appends_across_rollover() {
    let dir = TempDir::new().unwrap();
    let config = db_config(&dir);
    let log = ChunkLog::open(&config, Metrics::new()).unwrap();

    log.append(&prepare("kept", 1000)).unwrap();
    let end = log.flush().unwrap();
    let mark = log.mark();

    for i in 0..6 {
        log.append(&prepare(&format!("dropped-{}", i), 900)).unwrap();
    }
    assert!(log.chunk_infos().len() > 1);

    log.rollback(mark).unwrap();
    assert_eq!(log.writer_position(), end);
    assert_eq!(log.chunk_infos().len(), 1);
    assert!(!log.chunk_infos()[0].completed);
    assert!(!dir.path().join("chunk-000001.chk").exists());
    assert_eq!(read_all(&log).len(), 1);

    // appends continue from the rollback point
    assert_eq!(log.append(&prepare("next", 10)).unwrap(), end);
    let end = log.flush().unwrap();
    drop(log);

    let log = ChunkLog::open(&config, Metrics::new()).unwrap();
    assert_eq!(log.writer_position(), end);
    let entries = read_all(&log);
    assert_eq!(entries.len(), 2);
    match &entries[1].record {
        LogRecord::Prepare(p) => assert_eq!(p.stream_id, "next"),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_rollback_drops_unflushed_bytes() {
    let dir = TempDir::new().unwrap();
    let config = db_config(&dir);
    let log = ChunkLog::open(&config, Metrics::new()).unwrap();

    let mark = log.mark();
    log.append(&prepare("buffered", 50)).unwrap();
    log.rollback(mark).unwrap();
    assert_eq!(log.writer_position(), 0);
    drop(log);

    // nothing reaches the file when the log is dropped
    let log = ChunkLog::open(&config, Metrics::new()).unwrap();
    assert_eq!(log.writer_position(), 0);
    assert!(read_all(&log).is_empty());
}

#[test]
fn test_reopen_restores_chunks() {
    let dir = TempDir::new().unwrap();
    let config = db_config(&dir);

    let (end, count) = {
        let log = ChunkLog::open(&config, Metrics::new()).unwrap();
        for i in 0..12 {
            log.append(&prepare("reopen", 200 + i * 50)).unwrap();
        }
        assert!(log.complete_chunk().unwrap());
        assert!(!log.complete_chunk().unwrap());
        log.append(&prepare("after", 10)).unwrap();
        (log.flush().unwrap(), read_all(&log).len())
    };

    let log = ChunkLog::open(&config, Metrics::new()).unwrap();
    assert_eq!(log.writer_position(), end);
    assert_eq!(read_all(&log).len(), count);
    assert_eq!(log.chunk_versions().values().copied().collect::<Vec<_>>(), vec![0; log.chunk_infos().len()]);
}

#[test]
fn test_read_transaction_collects_prepares() {
    let dir = TempDir::new().unwrap();
    let log = ChunkLog::open(&db_config(&dir), Metrics::new()).unwrap();

    let start = log.writer_position();
    let mut records = Vec::new();
    for i in 0..3 {
        let mut record = prepare("tx", 20);
        if let LogRecord::Prepare(p) = &mut record {
            p.transaction_position = start;
            p.transaction_offset = i;
        }
        records.push(record);
    }
    // interleaved prepare of another transaction
    let first = log.append(&records[0]).unwrap();
    let stranger = log.append(&prepare("other", 20)).unwrap();
    log.append(&records[1]).unwrap();
    log.append(&records[2]).unwrap();
    let commit_position = log.append(&commit(start, 0)).unwrap();
    log.flush().unwrap();

    let prepares = log.read_transaction(start, commit_position, 3).unwrap();
    assert_eq!(prepares.len(), 3);
    assert_eq!(prepares[0].0, first);
    assert!(prepares.iter().all(|(position, p)| *position != stranger && p.stream_id == "tx"));
}

#[test]
fn test_verify_reports_damage_without_repairing() {
    let dir = TempDir::new().unwrap();
    let config = db_config(&dir);

    let end = {
        let log = ChunkLog::open(&config, Metrics::new()).unwrap();
        for i in 0..8 {
            log.append(&prepare(&format!("v-{}", i), 700)).unwrap();
        }
        log.flush().unwrap()
    };
    let last = dir.path().join(format!("chunk-{:06}.chk", end / CHUNK_SIZE));
    {
        let mut file = std::fs::OpenOptions::new().append(true).open(&last).unwrap();
        std::io::Write::write_all(&mut file, &[0x5A; 21]).unwrap();
    }
    let leftover = dir.path().join("chunk-000000.chk.scavenge");
    std::fs::write(&leftover, b"partial").unwrap();
    let torn_len = std::fs::metadata(&last).unwrap().len();

    let report = verify_chunks(&config).unwrap();
    assert_eq!(report.records(), 8);
    assert_eq!(report.end_position, end);
    assert_eq!(report.torn_bytes(), 21);
    assert!(report.chunks[..report.chunks.len() - 1].iter().all(|c| c.completed));
    assert_eq!(report.stale_scavenge_files, vec![leftover.clone()]);

    // nothing on disk changed
    assert_eq!(std::fs::metadata(&last).unwrap().len(), torn_len);
    assert!(leftover.exists());
    let next = dir.path().join(format!("chunk-{:06}.chk", end / CHUNK_SIZE + 1));
    assert!(!next.exists());
}

#[test]
fn test_verify_detects_damaged_completed_chunk() {
    let dir = TempDir::new().unwrap();
    let config = db_config(&dir);
    {
        let log = ChunkLog::open(&config, Metrics::new()).unwrap();
        log.append(&prepare("sealed", 200)).unwrap();
        assert!(log.complete_chunk().unwrap());
    }

    let path = dir.path().join("chunk-000000.chk");
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[chronicle_storage::chunk::CHUNK_HEADER_SIZE + 40] ^= 0xFF;
    std::fs::write(&path, bytes).unwrap();

    match verify_chunks(&config) {
        Err(Error::CorruptedChunk { chunk_number, .. }) => assert_eq!(chunk_number, 0),
        other => panic!("unexpected {:?}", other.map(|r| r.records())),
    }
}

mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn test_log_preserves_records(sizes in prop::collection::vec(0..1500usize, 1..60)) {
            let dir = TempDir::new().unwrap();
            let log = ChunkLog::open(&db_config(&dir), Metrics::new()).unwrap();

            let records: Vec<LogRecord> = sizes.iter().map(|&size| prepare("prop", size)).collect();
            let positions: Vec<u64> = records.iter().map(|r| log.append(r).unwrap()).collect();
            log.flush().unwrap();

            let entries = read_all(&log);
            prop_assert_eq!(entries.len(), records.len());
            for ((entry, record), position) in entries.iter().zip(&records).zip(&positions) {
                prop_assert_eq!(&entry.record, record);
                prop_assert_eq!(entry.position, *position);
                prop_assert_eq!(entry.position / CHUNK_SIZE, (entry.next_position - 1) / CHUNK_SIZE);
            }
            prop_assert!(positions.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
