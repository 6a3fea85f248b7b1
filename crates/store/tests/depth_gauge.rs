#![forbid(unsafe_code)]

// Installs a process-wide metrics recorder; keep this file to a single test.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use jobmon_core::{ObjectKey, RetrySettings};
use jobmon_store::DispatchQueue;
use metrics::{Counter, Gauge, GaugeFn, Histogram, Key, KeyName, Recorder, SharedString, Unit};

static DEPTH: AtomicU64 = AtomicU64::new(0);

struct DepthGauge;

impl GaugeFn for DepthGauge {
    fn increment(&self, value: f64) {
        self.set(depth() + value);
    }
    fn decrement(&self, value: f64) {
        self.set(depth() - value);
    }
    fn set(&self, value: f64) {
        DEPTH.store(value.to_bits(), Ordering::SeqCst);
    }
}

fn depth() -> f64 {
    f64::from_bits(DEPTH.load(Ordering::SeqCst))
}

struct DepthRecorder;

impl Recorder for DepthRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, _: &Key) -> Counter {
        Counter::noop()
    }

    fn register_gauge(&self, key: &Key) -> Gauge {
        if key.name() == "jobmon_queue_depth" {
            Gauge::from_arc(Arc::new(DepthGauge))
        } else {
            Gauge::noop()
        }
    }

    fn register_histogram(&self, _: &Key) -> Histogram {
        Histogram::noop()
    }
}

#[tokio::test]
async fn depth_gauge_follows_parked_key_requeue() {
    metrics::set_boxed_recorder(Box::new(DepthRecorder)).expect("recorder");
    let q = DispatchQueue::new(RetrySettings::default());
    let key = ObjectKey::new("batch", "a");

    q.add(key.clone());
    assert_eq!(depth(), 1.0);
    let got = q.get().await.expect("key");
    assert_eq!(depth(), 0.0);

    // changed while in flight: parked, not queued yet
    q.add(key.clone());
    assert_eq!(depth(), 0.0);

    q.done(&got);
    assert_eq!(q.len(), 1);
    assert_eq!(depth(), 1.0);
}
