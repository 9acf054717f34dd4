//! User-visible notifications

use std::sync::Arc;

/// Sink for short title/message notices shown to the desktop user
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, message: &str);
}

/// Notifier that writes to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, message: &str) {
        tracing::info!(title, "{}", message);
    }
}

/// Shared notifier handle
pub type SharedNotifier = Arc<dyn Notifier>;

/// The default notifier
pub fn log_notifier() -> SharedNotifier {
    Arc::new(LogNotifier)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::Notifier;

    /// Records every notification
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub seen: Mutex<Vec<(String, String)>>,
    }

    impl RecordingNotifier {
        pub fn take(&self) -> Vec<(String, String)> {
            std::mem::take(&mut *self.seen.lock().unwrap())
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, title: &str, message: &str) {
            self.seen
                .lock()
                .unwrap()
                .push((title.to_string(), message.to_string()));
        }
    }
}
