// Transfer round-trip tests
//
// Runs the chunk planner's query names through the reassembly engine in
// memory and checks the reconstructed file.

use dnsferry::{
    BaseDomain, ChunkPlanner, DomainKeyed, GapFill, Outcome, PlannedQuery, QueryKind,
    ReassemblyEngine, Reply,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

const DOMAIN: &str = "exfil.example.com";

fn source() -> SocketAddr {
    "192.0.2.50:53000".parse().unwrap()
}

fn engine(root: &Path, base: BaseDomain, gap: GapFill) -> ReassemblyEngine {
    ReassemblyEngine::new(base, Ipv4Addr::new(192, 0, 2, 1), root, Box::new(DomainKeyed))
        .with_gap_fill(gap)
}

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + 7) as u8).collect()
}

/// Feed queries to the engine and return the flushed file's path
fn deliver(engine: &ReassemblyEngine, queries: &[PlannedQuery]) -> PathBuf {
    let mut output = None;
    for query in queries {
        let handled = engine.handle(&query.name, source());
        assert_eq!(handled.reply, Reply::Address(Ipv4Addr::new(192, 0, 2, 1)));
        if let Outcome::Flushed(report) = handled.outcome {
            output = Some(report.output);
        }
    }
    output.expect("transfer was never flushed")
}

#[test]
fn test_round_trip_many_sizes() {
    for len in [0usize, 1, 2, 3, 29, 30, 31, 64, 65, 100, 257, 1024] {
        let dir = tempfile::tempdir().unwrap();
        let base = BaseDomain::new(DOMAIN, None);
        let data = sample(len);

        let planner = ChunkPlanner::new("/etc/sample.bin", data.clone(), base.clone(), 30);
        let queries: Vec<_> = planner.plan().collect();

        let output = deliver(&engine(dir.path(), base, GapFill::Zero), &queries);
        assert_eq!(std::fs::read(output).unwrap(), data, "length {}", len);
    }
}

#[test]
fn test_65_bytes_in_three_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let base = BaseDomain::new(DOMAIN, None);
    let data = sample(65);

    let planner = ChunkPlanner::new("loot/notes", data.clone(), base.clone(), 30);
    let queries: Vec<_> = planner.plan().collect();

    let chunk_indices: Vec<u64> = queries
        .iter()
        .filter_map(|q| match q.kind {
            QueryKind::Chunk { index, .. } => Some(index),
            _ => None,
        })
        .collect();
    assert_eq!(chunk_indices, vec![0, 1, 2]);
    assert_eq!(queries.last().unwrap().kind, QueryKind::Eof);

    let output = deliver(&engine(dir.path(), base, GapFill::Zero), &queries);
    assert_eq!(output, dir.path().join(DOMAIN).join("loot").join("notes"));
    assert_eq!(std::fs::read(output).unwrap(), data);
}

#[test]
fn test_out_of_order_delivery() {
    let base = BaseDomain::new(DOMAIN, Some("srv01"));
    let data = sample(500);
    let planner = ChunkPlanner::new("var/log/app.log", data.clone(), base.clone(), 30);
    let queries: Vec<_> = planner.plan().collect();

    let (path, rest) = queries.split_first().unwrap();
    let (eof, chunks) = rest.split_last().unwrap();

    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _ in 0..5 {
        let mut shuffled = chunks.to_vec();
        shuffled.shuffle(&mut rng);

        let mut ordered = vec![path.clone()];
        ordered.extend(shuffled);
        ordered.push(eof.clone());

        let dir = tempfile::tempdir().unwrap();
        let output = deliver(&engine(dir.path(), base.clone(), GapFill::Zero), &ordered);
        assert_eq!(std::fs::read(output).unwrap(), data);
    }
}

#[test]
fn test_missing_chunk_is_zero_filled() {
    let dir = tempfile::tempdir().unwrap();
    let base = BaseDomain::new(DOMAIN, None);
    let data = sample(150);
    let planner = ChunkPlanner::new("f", data.clone(), base.clone(), 30);

    let queries: Vec<_> = planner
        .plan()
        .filter(|q| !matches!(q.kind, QueryKind::Chunk { index: 2, .. }))
        .collect();

    let engine = engine(dir.path(), base, GapFill::Zero);
    let mut report = None;
    for query in &queries {
        if let Outcome::Flushed(r) = engine.handle(&query.name, source()).outcome {
            report = Some(r);
        }
    }
    let report = report.unwrap();
    assert_eq!(report.missing, vec![2]);

    let written = std::fs::read(&report.output).unwrap();
    assert_eq!(written.len(), data.len());
    assert_eq!(&written[..60], &data[..60]);
    assert!(written[60..90].iter().all(|&b| b == 0));
    assert_eq!(&written[90..], &data[90..]);
}

#[test]
fn test_missing_chunk_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let base = BaseDomain::new(DOMAIN, None);
    let data = sample(150);
    let planner = ChunkPlanner::new("f", data.clone(), base.clone(), 30);

    let queries: Vec<_> = planner
        .plan()
        .filter(|q| !matches!(q.kind, QueryKind::Chunk { index: 2, .. }))
        .collect();

    let output = deliver(&engine(dir.path(), base, GapFill::Skip), &queries);
    let written = std::fs::read(output).unwrap();
    assert_eq!(written.len(), 120);
    assert_eq!(&written[..60], &data[..60]);
    assert_eq!(&written[60..], &data[90..]);
}

#[test]
fn test_reannouncement_discards_earlier_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let base = BaseDomain::new(DOMAIN, None);
    let engine = engine(dir.path(), base.clone(), GapFill::Zero);

    // First attempt is interrupted before EOF
    let first = ChunkPlanner::new("f", sample(90), base.clone(), 30);
    for query in first.plan().filter(|q| q.kind != QueryKind::Eof) {
        engine.handle(&query.name, source());
    }

    let second_data = b"second attempt".to_vec();
    let second = ChunkPlanner::new("f", second_data.clone(), base, 30);
    let queries: Vec<_> = second.plan().collect();

    let output = deliver(&engine, &queries);
    assert_eq!(std::fs::read(output).unwrap(), second_data);
}

#[test]
fn test_48_byte_windows_with_short_tail_label() {
    // 48 bytes encode to 64 characters, leaving a one-character second label
    let dir = tempfile::tempdir().unwrap();
    let base = BaseDomain::new(DOMAIN, None);
    let data: Vec<u8> = (0..=255u8).cycle().take(48 * 40).collect();

    let planner = ChunkPlanner::new("blob", data.clone(), base.clone(), 48);
    let queries: Vec<_> = planner.plan().collect();

    let output = deliver(&engine(dir.path(), base, GapFill::Zero), &queries);
    assert_eq!(std::fs::read(output).unwrap(), data);
}

#[test]
fn test_budgeted_large_windows() {
    let dir = tempfile::tempdir().unwrap();
    let base = BaseDomain::new(DOMAIN, Some("build-agent-17"));
    let data = sample(2000);

    let planner = ChunkPlanner::new("big", data.clone(), base.clone(), 400).with_budget(true);
    let queries: Vec<_> = planner.plan().collect();
    for query in &queries {
        dnsferry::LabelCodec::validate(&query.name).unwrap();
    }

    let output = deliver(&engine(dir.path(), base, GapFill::Zero), &queries);
    assert_eq!(std::fs::read(output).unwrap(), data);
}

#[test]
fn test_case_folded_base_domain() {
    let dir = tempfile::tempdir().unwrap();
    let base = BaseDomain::new(DOMAIN, None);
    let data = sample(70);

    let planner = ChunkPlanner::new("f", data.clone(), base.clone(), 30);
    let queries: Vec<_> = planner
        .plan()
        .map(|mut q| {
            // Resolvers may rewrite the case of the suffix they route on
            q.name = q.name.replace(DOMAIN, "ExFiL.EXAMPLE.com");
            q
        })
        .collect();

    let output = deliver(&engine(dir.path(), base, GapFill::Zero), &queries);
    assert_eq!(std::fs::read(output).unwrap(), data);
}

#[test]
fn test_concurrent_chunk_delivery_for_one_key() {
    let dir = tempfile::tempdir().unwrap();
    let base = BaseDomain::new(DOMAIN, None);
    let engine = std::sync::Arc::new(engine(dir.path(), base.clone(), GapFill::Zero));
    let data = sample(30 * 400 + 17);

    let planner = ChunkPlanner::new("shared", data.clone(), base, 30);
    let queries: Vec<_> = planner.plan().collect();
    let (path, rest) = queries.split_first().unwrap();
    let (eof, chunks) = rest.split_last().unwrap();

    engine.handle(&path.name, source());

    // Interleave chunk names across workers feeding the same session key
    let workers = 4;
    let handles: Vec<_> = (0..workers)
        .map(|w| {
            let engine = std::sync::Arc::clone(&engine);
            let names: Vec<String> = chunks
                .iter()
                .skip(w)
                .step_by(workers)
                .map(|q| q.name.clone())
                .collect();
            std::thread::spawn(move || {
                for name in names {
                    let handled = engine.handle(&name, source());
                    assert!(matches!(handled.outcome, Outcome::ChunkStored { .. }));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(engine.stats().chunks_stored, chunks.len() as u64);

    let Outcome::Flushed(report) = engine.handle(&eof.name, source()).outcome else {
        panic!("expected flush");
    };
    assert!(report.missing.is_empty());
    assert_eq!(std::fs::read(report.output).unwrap(), data);
}

#[test]
fn test_window_encoding_to_path_literal_round_trips() {
    // 0xa5 0xab 0x61 encodes to "path"; "eof" is never a canonical encoding
    for data in [vec![0xa5, 0xab, 0x61], vec![1, 2, 3, 0xa5, 0xab, 0x61]] {
        let dir = tempfile::tempdir().unwrap();
        let base = BaseDomain::new(DOMAIN, None);
        let planner = ChunkPlanner::new("f", data.clone(), base.clone(), 3);
        let queries: Vec<_> = planner.plan().collect();

        let output = deliver(&engine(dir.path(), base, GapFill::Zero), &queries);
        assert_eq!(std::fs::read(output).unwrap(), data);
    }
}
