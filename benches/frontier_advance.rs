//! Frontier advance benchmark
//!
//! The monitor advances the frontier once per reported call on the single
//! consumer thread, so this is the hot path of enforcement.
//!
//! ```bash
//! cargo bench --bench frontier_advance
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use libsandbox::automaton::{Automaton, State, Symbol};
use libsandbox::config::FunctionTable;
use libsandbox::filter::IgnoreSet;
use libsandbox::monitor::{CallEvent, Frontier, Monitor};

const CALLS: [&str; 4] = ["open", "read", "write", "close"];

/// `width` parallel loops over the same alphabet, all entered from state 0
fn branching_policy(width: usize) -> Automaton {
    let mut triples = Vec::new();
    for branch in 0..width {
        let base = branch * CALLS.len() + 1;
        triples.push((State::from("0"), Symbol::call("open"), State::new(base.to_string())));
        for (i, call) in CALLS.iter().enumerate().skip(1) {
            triples.push((
                State::new((base + i - 1).to_string()),
                Symbol::call(*call),
                State::new((base + i).to_string()),
            ));
        }
        triples.push((
            State::new((base + CALLS.len() - 1).to_string()),
            Symbol::call("open"),
            State::new(base.to_string()),
        ));
    }
    Automaton::from_triples(State::from("0"), None, triples)
}

fn bench_frontier_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("frontier_step");
    for width in [1usize, 8, 64] {
        let policy = branching_policy(width);
        let frontier = Frontier::initial(&policy).step(&policy, &Symbol::call("open"));
        let read = Symbol::call("read");
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, _| {
            b.iter(|| black_box(frontier.step(&policy, black_box(&read))));
        });
    }
    group.finish();
}

fn bench_monitor_handle(c: &mut Criterion) {
    let functions: FunctionTable = CALLS
        .iter()
        .enumerate()
        .map(|(i, name)| (*name, i as u64 + 1))
        .collect();
    let events: Vec<CallEvent> = (0..1000u64)
        .map(|i| CallEvent {
            pid: 1,
            call_id: i % CALLS.len() as u64 + 1,
        })
        .collect();

    c.bench_function("monitor_handle_1000_events", |b| {
        b.iter(|| {
            let mut monitor = Monitor::new(branching_policy(8), functions.clone(), IgnoreSet::empty());
            monitor.attach(1);
            for event in &events {
                black_box(monitor.handle(*event));
            }
        });
    });
}

criterion_group!(benches, bench_frontier_step, bench_monitor_handle);
criterion_main!(benches);
