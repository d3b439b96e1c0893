//! Integration tests for the create / update / fetch lifecycle.
//!
//! These tests drive the public API end to end against the in-process
//! engine, in memory and file-backed.

use rrdio::error::CreateError;
use rrdio::{Client, DatabaseConfig, MemoryEngine, Param, RrdError, params};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tempfile::tempdir;

const T0: u64 = 1_700_000_100;
const STEP: Duration = Duration::from_secs(300);

fn at(offset: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(T0 + offset)
}

#[test]
fn test_single_gauge_round_trip() {
    let client = Client::new(MemoryEngine::new());
    client
        .creator("x.rrd", at(0), 300)
        .ds("v", "GAUGE", &params![600, "U", "U"])
        .rra("AVERAGE", &params![0.5, 1, 100])
        .create(true)
        .unwrap();

    client
        .updater("x.rrd")
        .update(&params![at(300), 42.0])
        .unwrap();

    let mut grid = client
        .fetch("x.rrd", "AVERAGE", at(0), at(600), STEP)
        .unwrap();
    assert_eq!(grid.columns(), 1);
    assert_eq!(grid.rows(), 3);
    assert_eq!(grid.at(1, 0).unwrap(), 42.0);
    assert!(grid.at(0, 0).unwrap().is_nan());
    assert_eq!(grid.start(), at(0));
    assert_eq!(grid.end(), at(600));
    assert_eq!(grid.step(), STEP);

    let snapshot = grid.copy().unwrap();
    grid.release().unwrap();
    assert_eq!(snapshot[1], 42.0);
    assert!(matches!(grid.at(1, 0), Err(RrdError::UseAfterRelease(_))));
    assert!(matches!(grid.release(), Err(RrdError::UseAfterRelease(_))));
    assert_eq!(client.engine().outstanding_buffers(), 0);
}

#[test]
fn test_batched_samples_across_sources() {
    let client = Client::new(MemoryEngine::new());
    let names = ["cpu", "mem", "disk"];
    let mut creator = client.creator("multi.rrd", at(0), 300);
    for name in names {
        creator.ds(name, "GAUGE", &params![600, "U", "U"]);
    }
    creator.rra("LAST", &params![0.5, 1, 50]).create(true).unwrap();

    let mut updater = client.updater("multi.rrd");
    for i in 1..=5u32 {
        let base = f64::from(i);
        updater.cache(&params![at(300 * u64::from(i)), base, base * 10.0, base * 100.0]);
    }
    assert_eq!(updater.pending().len(), 5);
    updater.update(&[]).unwrap();
    assert!(updater.pending().is_empty());

    let grid = client
        .fetch("multi.rrd", "LAST", at(300), at(1500), STEP)
        .unwrap();
    assert_eq!(grid.series_names(), names);
    assert_eq!(grid.rows(), 5);
    for row in 0..5 {
        let base = f64::from(u32::try_from(row).unwrap() + 1);
        assert_eq!(grid.at(row, 0).unwrap(), base);
        assert_eq!(grid.at(row, 1).unwrap(), base * 10.0);
        assert_eq!(grid.at(row, 2).unwrap(), base * 100.0);
    }
    assert!(matches!(grid.at(5, 0), Err(RrdError::Bounds(_))));
    assert!(matches!(grid.at(0, 3), Err(RrdError::Bounds(_))));
    assert_eq!(grid.ds_index("disk"), Some(2));
    drop(grid);
    assert_eq!(client.engine().outstanding_buffers(), 0);
}

#[test]
fn test_rejected_batch_is_retryable() {
    let client = Client::new(MemoryEngine::new());
    client
        .creator("retry.rrd", at(0), 300)
        .ds("v", "GAUGE", &params![600, "U", "U"])
        .rra("AVERAGE", &params![0.5, 1, 10])
        .create(true)
        .unwrap();

    let mut updater = client.updater("retry.rrd");
    updater.cache(&params![at(0), 1.0]);
    updater.cache(&params![at(300), 2.0]);
    let err = updater.update(&[]).unwrap_err();
    assert!(err.to_string().contains("illegal attempt to update"), "{err}");
    assert_eq!(updater.pending().len(), 2);

    updater.clear_pending();
    updater.cache(&params![at(300), 2.0]);
    updater.update(&[]).unwrap();
    assert_eq!(client.engine().last_update("retry.rrd"), Some(1_700_000_400));
}

#[test]
fn test_out_of_range_timestamp_keeps_batch() {
    let client = Client::new(MemoryEngine::new());
    client
        .creator("edge.rrd", at(0), 300)
        .ds("v", "GAUGE", &params![600, "U", "U"])
        .rra("AVERAGE", &params![0.5, 1, 10])
        .create(true)
        .unwrap();

    let mut updater = client.updater("edge.rrd");
    updater.cache(&[Param::Text(i64::MAX.to_string()), Param::from(1)]);
    let err = updater.update(&[]).unwrap_err();
    assert!(err.to_string().contains("timestamp out of range"), "{err}");
    assert_eq!(updater.pending().len(), 1);
    assert_eq!(client.engine().last_update("edge.rrd"), Some(1_700_000_100));
}

#[test]
fn test_unknown_cf_passes_engine_message_through() {
    let client = Client::new(MemoryEngine::new());
    client
        .creator("cf.rrd", at(0), 300)
        .ds("v", "GAUGE", &params![600, "U", "U"])
        .rra("AVERAGE", &params![0.5, 1, 10])
        .create(true)
        .unwrap();

    match client.fetch("cf.rrd", "MAX", at(0), at(300), STEP) {
        Err(RrdError::Engine(e)) => {
            assert_eq!(e.message, "the RRD does not contain an RRA matching the chosen CF");
        }
        other => panic!("expected engine error, got {other:?}"),
    }
    assert!(client.fetch("cf.rrd", "AVERAGE", at(0), at(300), STEP).is_ok());
}

#[test]
fn test_file_backed_lifecycle_from_definition() {
    let temp_dir = tempdir().unwrap();
    let target = temp_dir.path().join("defined.rrd");
    let definition = format!(
        r#"{{
            "target": {target:?},
            "start": {T0},
            "step": 300,
            "data_sources": [{{ "name": "rx", "kind": "COUNTER", "heartbeat": 600, "min": 0 }}],
            "archives": [{{ "cf": "AVERAGE", "steps": 1, "rows": 12 }}]
        }}"#,
        target = target.to_str().unwrap()
    );
    let config = DatabaseConfig::from_json(&definition).unwrap();

    let client = Client::new(MemoryEngine::file_backed());
    config.creator(&client).create(false).unwrap();
    assert!(target.exists());

    // A second exclusive create must not clobber the file.
    assert!(matches!(
        config.creator(&client).create(false),
        Err(RrdError::Create(CreateError::AlreadyExists { .. }))
    ));

    let path = target.to_str().unwrap();
    let mut updater = client.updater(path);
    updater.update(&params![at(300), 1_000]).unwrap();
    updater.update(&params![at(600), 4_000]).unwrap();

    // A fresh engine sees the persisted state.
    let reopened = Client::new(MemoryEngine::file_backed());
    let info = reopened.info(path).unwrap();
    assert_eq!(info.unsigned("last_update"), Some(T0 + 600));

    let grid = reopened
        .fetch(path, "AVERAGE", at(600), at(600), STEP)
        .unwrap();
    assert_eq!(grid.rows(), 1);
    assert!((grid.at(0, 0).unwrap() - 10.0).abs() < 1e-9);
}
