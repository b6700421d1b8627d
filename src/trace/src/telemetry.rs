use opentelemetry::trace::TraceId;
use rand::Rng;
use tracing::{field, Span};

/// Generates a random trace id.
pub fn get_trace_id() -> TraceId {
    let mut rng = rand::thread_rng();
    let val: u128 = rng.gen();
    TraceId::from(val)
}

// Records a fresh trace id on the current span declared with `fields(trace_id)`.
pub fn record_trace_id() -> TraceId {
    let trace_id = get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    trace_id
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tracing::{
        field::{Field, Visit},
        span::{Id, Record},
        Subscriber,
    };
    use tracing_subscriber::{layer::Context, prelude::*, Layer};

    use super::*;

    #[derive(Clone, Default)]
    struct RecordedTraceId(Arc<Mutex<Option<String>>>);

    impl Visit for RecordedTraceId {
        fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
            if field.name() == "trace_id" {
                *self.0.lock().unwrap() = Some(format!("{value:?}"));
            }
        }
    }

    impl<S: Subscriber> Layer<S> for RecordedTraceId {
        fn on_record(&self, _id: &Id, values: &Record<'_>, _ctx: Context<'_, S>) {
            values.record(&mut self.clone());
        }
    }

    #[test]
    fn works_get_trace_id() {
        let a = get_trace_id();
        let b = get_trace_id();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 32);
    }

    #[test]
    fn works_record_trace_id() {
        let recorded = RecordedTraceId::default();
        let subscriber = tracing_subscriber::registry().with(recorded.clone());
        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("reconciler", trace_id = field::Empty);
            let _enter = span.enter();
            let trace_id = record_trace_id();
            assert_eq!(
                recorded.0.lock().unwrap().as_deref(),
                Some(trace_id.to_string().as_str())
            );
        });
    }
}
