use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use caseflow_core::FailurePolicy;
use caseflow_events::{CaseEvent, CaseEventKind, ConsumerError, EventBroker, EventConsumer};

struct Counting {
    subject: CaseEventKind,
    hits: AtomicU64,
}

impl EventConsumer<CaseEvent> for Counting {
    fn name(&self) -> &str {
        "counting"
    }

    fn subject(&self) -> CaseEventKind {
        self.subject
    }

    fn consume(&self, _event: &CaseEvent) -> Result<(), ConsumerError> {
        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn broker_with(consumers_per_level: usize) -> EventBroker<CaseEvent> {
    let broker = EventBroker::with_policy(FailurePolicy::Isolate);
    for subject in [
        CaseEventKind::Task,
        CaseEventKind::TaskEnded,
        CaseEventKind::TaskCompleted,
        CaseEventKind::Workbasket,
    ] {
        for _ in 0..consumers_per_level {
            let consumer: Arc<dyn EventConsumer<CaseEvent>> = Arc::new(Counting {
                subject,
                hits: AtomicU64::new(0),
            });
            let _ = broker.subscribe(consumer);
        }
    }
    broker
}

fn bench_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("broker_forward");

    for per_level in [1usize, 8, 64] {
        let broker = broker_with(per_level);
        let deep = CaseEvent::new(CaseEventKind::TaskCompleted, "task");
        let shallow = CaseEvent::new(CaseEventKind::TaskCreated, "task");

        group.bench_with_input(BenchmarkId::new("deep", per_level), &deep, |b, ev| {
            b.iter(|| black_box(broker.forward(ev)))
        });
        group.bench_with_input(BenchmarkId::new("shallow", per_level), &shallow, |b, ev| {
            b.iter(|| black_box(broker.forward(ev)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_forward);
criterion_main!(benches);
