//! Engine throughput benchmarks using Criterion.rs.

use certification_core::contract::DocumentType;
use certification_core::state::{guard, Step, WorkflowState};
use certification_core::test_helpers::{sample_chip, TestHarness, TEST_OTP_CODE};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn bench_full_session(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_session");
    for selection in [1usize, 3] {
        group.bench_with_input(
            BenchmarkId::from_parameter(selection),
            &selection,
            |b, &selection| {
                let chips: Vec<String> = (0..selection).map(sample_chip).collect();
                b.iter(|| {
                    let harness = TestHarness::new();
                    let engine = harness.engine();
                    engine
                        .accept_consent("123", DocumentType::CC, true)
                        .expect("consent");
                    engine.validate_identity("123").expect("identity");
                    engine.validate_otp("123", TEST_OTP_CODE).expect("otp");
                    engine.count_properties("123").expect("count");
                    engine.list_properties("123").expect("list");
                    engine.select_properties("123", &chips).expect("select");
                    engine.validate_selection("123", true).expect("validate");
                    black_box(engine.issue_certificates("123", None).expect("issue"));
                });
            },
        );
    }
    group.finish();
}

fn bench_many_documents(c: &mut Criterion) {
    c.bench_function("consent_and_identity_1000_documents", |b| {
        b.iter(|| {
            let harness = TestHarness::new();
            let engine = harness.engine();
            for index in 0..1_000u32 {
                let document = format!("{}", 10_000_000 + index);
                engine
                    .accept_consent(&document, DocumentType::CC, true)
                    .expect("consent");
                black_box(engine.validate_identity(&document).expect("identity"));
            }
        });
    });
}

fn bench_guard(c: &mut Criterion) {
    c.bench_function("guard_lookup", |b| {
        b.iter(|| {
            black_box(guard(
                black_box(WorkflowState::SelectionMade),
                black_box(Step::SelectProperties),
            ))
        });
    });
}

criterion_group!(benches, bench_full_session, bench_many_documents, bench_guard);
criterion_main!(benches);
