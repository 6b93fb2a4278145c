use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

pub type ErrorHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Receives non-fatal error notifications from every streaming component.
///
/// Every report is also logged. A panicking handler is contained here so it
/// can never unwind into the read loop.
#[derive(Default)]
pub struct ErrorSink {
    handler: RwLock<Option<ErrorHandler>>,
}

impl std::fmt::Debug for ErrorSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorSink")
            .field("has_handler", &self.handler.read().is_some())
            .finish()
    }
}

impl ErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_handler(&self, handler: ErrorHandler) {
        *self.handler.write() = Some(handler);
    }

    pub fn clear_handler(&self) {
        *self.handler.write() = None;
    }

    pub fn report(&self, message: &str) {
        warn!(error = %message, "stream error");

        // clone out so the handler never runs under the lock
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
                warn!("error handler panicked; ignoring");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_report_reaches_handler() {
        let sink = ErrorSink::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&seen);
        sink.set_handler(Arc::new(move |msg: &str| captured.lock().push(msg.to_string())));

        sink.report("first");
        sink.report("second");

        assert_eq!(*seen.lock(), vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn test_report_without_handler_is_noop() {
        ErrorSink::new().report("nobody listening");
    }

    #[test]
    fn test_panicking_handler_is_swallowed() {
        let sink = ErrorSink::new();
        sink.set_handler(Arc::new(|_: &str| panic!("handler blew up")));
        sink.report("boom");
        sink.clear_handler();
        sink.report("after clear");
    }
}
