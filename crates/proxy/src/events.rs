//! Per-request event stream for embedding layers.
//!
//! One [`ProcessedEvent`] is produced for every request that was not dropped
//! by the rate limiter. The listener lives in a process-wide slot; emission
//! copies the handle under the lock and invokes it outside, so a slow
//! listener can never wedge assignment.

use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Default)]
pub struct ProcessedEvent {
    pub qname: String,
    /// Numeric query type (1 = A, 28 = AAAA, ...).
    pub qtype: u16,
    /// Textual form of the first answer RDATA, empty when there is none.
    pub answer: String,
    /// Address string of the upstream that served the request, empty when no
    /// upstream was contacted (cache hit, refusal).
    pub upstream_addr: String,
    pub elapsed_ms: u64,
    /// Empty on success.
    pub error: String,
}

pub trait ProcessedEventListener: Send + Sync {
    fn request_processed(&self, event: &ProcessedEvent);
}

static LISTENER: RwLock<Option<Arc<dyn ProcessedEventListener>>> = RwLock::new(None);

/// Installs (or with `None`, removes) the process-wide event listener.
pub fn set_listener(listener: Option<Arc<dyn ProcessedEventListener>>) {
    *LISTENER.write().unwrap() = listener;
}

/// Best-effort emission. A poisoned lock or missing listener means the event
/// is dropped; the response path is never affected.
pub(crate) fn emit(event: &ProcessedEvent) {
    let handle = match LISTENER.read() {
        Ok(slot) => slot.clone(),
        Err(_) => return,
    };
    if let Some(listener) = handle {
        listener.request_processed(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Collector(Mutex<Vec<ProcessedEvent>>);

    impl ProcessedEventListener for Collector {
        fn request_processed(&self, event: &ProcessedEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn emit_reaches_installed_listener() {
        let collector = Arc::new(Collector(Mutex::new(Vec::new())));
        set_listener(Some(collector.clone()));

        emit(&ProcessedEvent {
            qname: "example.com.".into(),
            qtype: 1,
            ..Default::default()
        });

        set_listener(None);
        // Unset slot: emission is a no-op, not an error.
        emit(&ProcessedEvent::default());

        let seen = collector.0.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].qname, "example.com.");
    }
}
