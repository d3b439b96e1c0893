//! Microbenchmarks for info parsing, argument encoding and grid access.
//!
//! Run with: `cargo bench -p rrdio`

#![allow(missing_docs, clippy::cast_possible_truncation)]

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rrdio::args::{DeclKind, encode, join};
use rrdio::engine::{RawFetch, VecBuffer};
use rrdio::info::{InfoRecord, parse_info};
use rrdio::{FetchGrid, Scalar, params};
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

/// Records shaped like `rrd_info` output for `sources` data sources and
/// `archives` archives.
fn info_records(sources: usize, archives: usize) -> Vec<InfoRecord> {
    let mut records = vec![
        InfoRecord::new("filename", Scalar::Str("bench.rrd".into())),
        InfoRecord::new("rrd_version", Scalar::Str("0003".into())),
        InfoRecord::new("step", Scalar::Unsigned(300)),
        InfoRecord::new("last_update", Scalar::Unsigned(1_700_000_100)),
    ];
    for ds in 0..sources {
        let name = format!("ds{ds}");
        records.push(InfoRecord::new(format!("ds[{name}].index"), Scalar::Unsigned(ds as u64)));
        records.push(InfoRecord::new(format!("ds[{name}].type"), Scalar::Str("GAUGE".into())));
        records.push(InfoRecord::new(format!("ds[{name}].minimal_heartbeat"), Scalar::Unsigned(600)));
        records.push(InfoRecord::new(format!("ds[{name}].last_ds"), Scalar::Str("U".into())));
    }
    for rra in 0..archives {
        records.push(InfoRecord::new(format!("rra[{rra}].cf"), Scalar::Str("AVERAGE".into())));
        records.push(InfoRecord::new(format!("rra[{rra}].rows"), Scalar::Unsigned(288)));
        records.push(InfoRecord::new(format!("rra[{rra}].xff"), Scalar::Float(0.5)));
        for ds in 0..sources {
            records.push(InfoRecord::new(
                format!("rra[{rra}].cdp_prep[{ds}].value"),
                Scalar::Float(f64::NAN),
            ));
        }
    }
    records
}

fn bench_parse_info(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_info/sources");

    for sources in [1, 10, 50] {
        let records = info_records(sources, 4);
        group.bench_with_input(BenchmarkId::from_parameter(sources), &records, |b, records| {
            b.iter(|| parse_info(black_box(records.clone())).unwrap());
        });
    }

    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    c.bench_function("encode/ds_declaration", |b| {
        b.iter(|| {
            encode(
                black_box(DeclKind::Ds),
                black_box("temperature"),
                &params!["GAUGE", 600, -40, 120],
            )
        });
    });

    let sample = params![1_700_000_400u64, 1.5, 2.5, "U", 4.5];
    c.bench_function("join/update_sample", |b| {
        b.iter(|| join(black_box(&sample)));
    });
}

fn bench_grid_scan(c: &mut Criterion) {
    let rows = 1_000;
    let columns = 8;
    let live = Arc::new(AtomicUsize::new(0));
    let values: Vec<f64> = (0..rows * columns).map(|i| f64::from(i as u32)).collect();
    let step = 300_i64;
    let end = step * (i64::try_from(rows).unwrap() - 1);

    let raw = RawFetch {
        start: 0,
        end,
        step: 300,
        ds_names: (0..columns).map(|c| format!("ds{c}")).collect(),
        buffer: Box::new(VecBuffer::new(values, Arc::clone(&live))),
    };
    let grid = FetchGrid::new("bench.rrd", "AVERAGE", raw).unwrap();

    c.bench_function("fetch_grid/scan_all_cells", |b| {
        b.iter(|| {
            let mut sum = 0.0;
            for row in 0..grid.rows() {
                for column in 0..grid.columns() {
                    sum += grid.at(black_box(row), black_box(column)).unwrap();
                }
            }
            sum
        });
    });

    c.bench_function("fetch_grid/copy", |b| {
        b.iter(|| grid.copy().unwrap());
    });
}

criterion_group!(benches, bench_parse_info, bench_encode, bench_grid_scan);
criterion_main!(benches);
