//! Small helpers shared across the crate.

use std::any::Any;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ServerError;

/// Converts a recovered panic payload into a structured error.
///
/// This is the only place panics are allowed to cross a component boundary:
/// every worker entry point wraps its body in `catch_unwind` and funnels the
/// payload through here so the rest of the system only ever sees errors.
pub fn recover_transform(payload: Box<dyn Any + Send>) -> anyhow::Error {
    let text = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    };
    anyhow::Error::new(ServerError::HandlerPanic(text))
}

/// Current wall-clock time in unix nanoseconds.
///
/// Used for gateway frame timestamps. Saturates to zero if the clock is
/// somehow before the epoch rather than panicking.
pub fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    #[test]
    fn recover_transform_keeps_panic_text() {
        let payload = catch_unwind(AssertUnwindSafe(|| panic!("boom: {}", 42))).unwrap_err();
        let err = recover_transform(payload);
        assert!(err.to_string().contains("boom: 42"));
    }

    #[test]
    fn unix_nanos_is_monotonic_enough() {
        let a = unix_nanos();
        let b = unix_nanos();
        assert!(b >= a);
        assert!(a > 0);
    }
}
