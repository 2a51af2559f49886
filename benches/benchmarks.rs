//! Benchmark suite for slidegen hot paths.
//!
//! This module provides performance benchmarks for:
//! - Response repair (decoding model output of various shapes and sizes)
//! - Learned-rule lookup (scope filtering over a full feedback log)
//!
//! # Running Benchmarks
//!
//! ```bash
//! # Run all benchmarks
//! cargo bench
//!
//! # Save baseline for comparison
//! cargo bench -- --save-baseline main
//!
//! # Compare against baseline
//! cargo bench -- --baseline main
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::{json, Value};
use slidegen::feedback::{FeedbackStore, Scope};
use slidegen::repair::repair_json;

// ============================================================================
// Response Repair Benchmarks
// ============================================================================

/// A drafting response with `n` slides, fenced and preceded by prose.
fn drafted_response(n: usize) -> String {
    let slides: Vec<Value> = (1..=n)
        .map(|i| {
            json!({
                "title": format!("Slide {i}"),
                "content": format!("Body text for slide {i} with a few sentences of detail."),
                "prompt": format!("3D glass panel, caustics, scene {i}"),
            })
        })
        .collect();
    format!(
        "Here is your deck:\n```json\n{}\n```",
        serde_json::to_string_pretty(&slides).unwrap_or_default()
    )
}

/// Benchmark decoding of well-formed, truncated and control-character input.
fn bench_repair(c: &mut Criterion) {
    let mut group = c.benchmark_group("repair_json");

    for size in [5, 20, 50] {
        let clean = drafted_response(size);
        let truncated = clean[..clean.len() * 2 / 3].to_string();
        let raw_newlines = clean.replace("a few sentences", "a few\nsentences");

        group.throughput(Throughput::Bytes(clean.len() as u64));
        group.bench_with_input(BenchmarkId::new("well_formed", size), &clean, |b, text| {
            b.iter(|| repair_json::<Vec<Value>>(black_box(text), Vec::new()))
        });
        group.bench_with_input(BenchmarkId::new("truncated", size), &truncated, |b, text| {
            b.iter(|| repair_json::<Vec<Value>>(black_box(text), Vec::new()))
        });
        group.bench_with_input(
            BenchmarkId::new("control_chars", size),
            &raw_newlines,
            |b, text| b.iter(|| repair_json::<Vec<Value>>(black_box(text), Vec::new())),
        );
    }

    group.finish();
}

// ============================================================================
// Learned Rule Benchmarks
// ============================================================================

/// Benchmark rule lookup against a log at capacity spread over several scopes.
fn bench_rules_for(c: &mut Criterion) {
    let store = FeedbackStore::in_memory();
    let scopes = [
        Scope::slide_deck(),
        Scope::thumbnail(),
        Scope::single(),
        Scope::mc_studio(),
    ];
    for i in 0..30 {
        let scope = &scopes[i % scopes.len()];
        let _ = store.record_rule("complaint", "prompt", &format!("Rule {}", i % 7), scope);
    }

    c.bench_function("rules_for_full_log", |b| {
        b.iter(|| store.rules_for(black_box(&Scope::thumbnail())).to_string())
    });
}

criterion_group!(repair_benches, bench_repair);

criterion_group!(feedback_benches, bench_rules_for);

criterion_main!(repair_benches, feedback_benches);
