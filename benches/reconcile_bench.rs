use std::hint::black_box;
use std::time::Instant;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use proctree::system::buffer::QueryOutcome;
use proctree::system::delta::DeltaEngine;
use proctree::system::layout::{ListingEntry, ListingWriter};
use proctree::system::parser::Listing;
use proctree::system::process::ProcessTree;
use proctree::system::services::ServiceMembership;

const SIZES: [usize; 3] = [500, 1000, 2000];

fn make_names(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("proc_{}.exe", (i * 7919) % n)).collect()
}

/// Binary-heap shaped tree; `tick` advances every process's CPU time.
fn encode_listing(names: &[String], tick: u64) -> Vec<u8> {
    let mut buf = vec![0u8; names.len() * 512 + 4096];
    let mut writer = ListingWriter::new(&mut buf);
    for (i, name) in names.iter().enumerate() {
        let pid = (i as u32 + 1) * 4;
        let parent_pid = if i == 0 { 0 } else { ((i as u32 - 1) / 2 + 1) * 4 };
        writer.push(&ListingEntry {
            pid,
            parent_pid,
            create_time: i as u64,
            user_time: tick * (i as u64 % 13) * 10_000,
            read_transfer: tick * 4096,
            working_set: ((names.len() - i) as u64 + 1) * 1024,
            name,
            ..Default::default()
        });
    }
    let QueryOutcome::Complete(len) = writer.finish() else {
        panic!("bench buffer too small");
    };
    buf.truncate(len);
    buf
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_500_1000_2000");
    for size in SIZES {
        let names = make_names(size);
        let listing = encode_listing(&names, 1);
        group.bench_with_input(BenchmarkId::from_parameter(size), &listing, |b, listing| {
            b.iter(|| black_box(Listing::new(listing).records().count()))
        });
    }
    group.finish();
}

fn bench_reconcile_steady_state(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconcile_500_1000_2000");
    let services = ServiceMembership::new();
    for size in SIZES {
        let names = make_names(size);
        let listings = [encode_listing(&names, 1), encode_listing(&names, 2)];
        let mut tree = ProcessTree::default();
        let mut deltas = DeltaEngine::new(8);
        let mut cycle = 0usize;
        group.bench_function(BenchmarkId::from_parameter(size), |b| {
            b.iter(|| {
                // Alternate listings so rates are computed against a real baseline.
                let listing = &listings[cycle % 2];
                cycle += 1;
                let listing = Listing::new(listing);
                let summary = tree.reconcile(
                    listing.records(),
                    &services,
                    &mut deltas,
                    |_| None,
                    Instant::now(),
                );
                black_box(summary);
                black_box(tree.top_cpu().len());
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_parse, bench_reconcile_steady_state);
criterion_main!(benches);
