//! Collections emit a `gc_collect` span with nested `gc_phase` spans and a
//! `gc_complete` event.

use std::fmt;
use std::sync::{Arc, Mutex};

use epoch_gc::{Runtime, RuntimeConfig, SchedulerKind, TypeInfo, CELL_SIZE};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;

static CELL: TypeInfo = TypeInfo::object("Cell", CELL_SIZE, 0);

#[derive(Default)]
struct Recorded {
    spans: Vec<String>,
    messages: Vec<String>,
}

#[derive(Clone, Default)]
struct RecordingLayer(Arc<Mutex<Recorded>>);

struct MessageVisitor<'a>(&'a mut Option<String>);

impl Visit for MessageVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            *self.0 = Some(format!("{value:?}"));
        }
    }
}

impl<S> Layer<S> for RecordingLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
        self.0
            .lock()
            .unwrap()
            .spans
            .push(attrs.metadata().name().to_string());
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut message = None;
        event.record(&mut MessageVisitor(&mut message));
        if let Some(message) = message {
            self.0.lock().unwrap().messages.push(message);
        }
    }
}

#[test]
fn test_collection_spans_and_events() {
    let layer = RecordingLayer::default();
    let recorded = Arc::clone(&layer.0);
    tracing::subscriber::set_global_default(tracing_subscriber::registry().with(layer)).unwrap();

    let runtime = Runtime::new(RuntimeConfig::new(SchedulerKind::Manual)).unwrap();
    let mut mutator = runtime.attach_mutator();
    for _ in 0..10 {
        mutator.allocate_object(&CELL);
    }
    mutator.schedule_and_wait_full_gc();
    drop(mutator);
    runtime.shutdown();

    let recorded = recorded.lock().unwrap();
    assert_eq!(recorded.spans.iter().filter(|s| *s == "gc_collect").count(), 1);
    // Suspend, root set, mark, extra sweep and sweep.
    assert!(recorded.spans.iter().filter(|s| *s == "gc_phase").count() >= 5);
    assert!(recorded.messages.iter().any(|m| m == "gc_complete"));
    // Every phase that starts also ends.
    let count = |name: &str| recorded.messages.iter().filter(|m| *m == name).count();
    assert_eq!(count("phase_start"), 5);
    assert_eq!(count("phase_end"), 5);
}
