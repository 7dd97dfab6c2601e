//! Process-level capture: supervised tasks, the panic hook and the console tee.
//!
//! The panic hook is process-wide, so everything touching it runs inside a
//! single test.

use resilience_engine::diagnostics::Classifier;
use resilience_engine::{
    CaptureLayer, Console, ErrorCategory, ErrorStore, FailureKind, ResilienceMetrics, Severity,
};
use std::io::Write;
use std::sync::{Arc, Mutex};

fn capture_layer() -> CaptureLayer {
    CaptureLayer::new(
        Arc::new(Classifier::new()),
        ErrorStore::default(),
        Arc::new(ResilienceMetrics::default()),
    )
}

#[derive(Clone, Default)]
struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl SharedSink {
    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_supervised_failures_are_attributed_to_their_unit() {
    let capture = capture_layer();

    let ok = capture
        .spawn_supervised("cart", async { Ok::<_, String>(42) })
        .await
        .unwrap();
    assert_eq!(ok, Some(42));
    assert!(capture.store().snapshot().global_errors.is_empty());

    let rejected = capture
        .spawn_supervised("cart", async { Err::<(), _>("cart sync rejected".to_string()) })
        .await
        .unwrap();
    assert_eq!(rejected, None);

    let state = capture.store().snapshot();
    let record = state.unit_errors("cart").last().unwrap().clone();
    assert_eq!(record.error.kind, FailureKind::Rejection);
    assert!(record.severity >= Severity::High);
    assert_eq!(record.error.details["source"], "rejection");

    // Without the hook the supervisor records the panic itself
    let panicked = capture
        .spawn_supervised("wishlist", async {
            if true {
                panic!("wishlist state exploded");
            }
            Ok::<(), String>(())
        })
        .await
        .unwrap();
    assert_eq!(panicked, None);
    let state = capture.store().snapshot();
    let records: Vec<_> = state.unit_errors("wishlist").collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].error.category, ErrorCategory::Script);
    assert_eq!(records[0].error.kind, FailureKind::Panic);
    assert_eq!(records[0].severity, Severity::Critical);

    // With the hook the panic is recorded once, by the hook, under the unit
    capture.install_panic_hook();
    capture.install_panic_hook();
    assert!(capture.panic_hook_installed());

    capture
        .spawn_supervised("reviews", async {
            if true {
                panic!("reviews widget exploded");
            }
            Ok::<(), String>(())
        })
        .await
        .unwrap();
    let state = capture.store().snapshot();
    let records: Vec<_> = state.unit_errors("reviews").collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].severity, Severity::Critical);
    assert!(records[0].error.details["location"].is_string());

    // Panics outside supervision land in the global log without a unit
    let before = capture.store().snapshot().global_errors.len();
    let _ = std::thread::spawn(|| panic!("background worker exploded")).join();
    let state = capture.store().snapshot();
    assert_eq!(state.global_errors.len(), before + 1);
    let last = state.global_errors.last().unwrap();
    assert!(last.unit_name.is_none());
    assert!(last.error.message.contains("background worker exploded"));

    // Disabled capture turns the hook into a pass-through
    capture.disable();
    let _ = std::thread::spawn(|| panic!("ignored while disabled")).join();
    assert_eq!(capture.store().snapshot().global_errors.len(), before + 1);
}

#[test]
fn test_console_tee_writes_original_line_and_captures() {
    let capture = capture_layer();
    let sink = SharedSink::default();
    let console = Console::with_sink(capture.clone(), Box::new(sink.clone()));

    console.error("TypeError: Cannot read properties of undefined (reading 'items')");
    console.warn("Deprecated prop passed to Banner");
    console.info("Cart hydrated");
    console.info("Request to /api/cart timed out");

    assert_eq!(
        sink.contents(),
        "TypeError: Cannot read properties of undefined (reading 'items')\n\
         Deprecated prop passed to Banner\n\
         Cart hydrated\n\
         Request to /api/cart timed out\n"
    );

    let state = capture.store().snapshot();
    assert_eq!(state.global_errors.len(), 3);
    assert_eq!(state.global_errors[0].severity, Severity::Critical);
    assert_eq!(state.global_errors[2].error.category, ErrorCategory::Network);
    assert!(state
        .global_errors
        .iter()
        .all(|record| record.error.message != "Cart hydrated"));
}
