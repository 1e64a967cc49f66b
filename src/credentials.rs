//! In-memory store for the database DSN delivered by a `credentials.seal`
//! message. Held only for the process lifetime; zeroized whenever replaced
//! or cleared.

use std::sync::Mutex;

use zeroize::Zeroize;

/// Holds at most one DSN at a time. `set` zeroizes whatever it replaces;
/// `clear` (called on drain and on drop) zeroizes the current value.
#[derive(Default)]
pub struct DbCredentials(Mutex<Option<String>>);

impl DbCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly sealed DSN, zeroizing any previous value.
    pub fn set(&self, dsn: String) {
        let mut guard = self.0.lock().expect("credentials lock poisoned");
        if let Some(mut previous) = guard.replace(dsn) {
            previous.zeroize();
        }
    }

    /// The current DSN, if any. Cloned out since the lock cannot be held
    /// across an `await`; callers must not log the returned value.
    pub fn dsn(&self) -> Option<String> {
        self.0.lock().expect("credentials lock poisoned").clone()
    }

    pub fn is_set(&self) -> bool {
        self.0.lock().expect("credentials lock poisoned").is_some()
    }

    /// Zeroize and drop the current value, if any.
    pub fn clear(&self) {
        let mut guard = self.0.lock().expect("credentials lock poisoned");
        if let Some(mut dsn) = guard.take() {
            dsn.zeroize();
        }
    }
}

impl Drop for DbCredentials {
    fn drop(&mut self) {
        self.clear();
    }
}
