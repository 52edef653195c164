//! Thin wrapper for error injection via the `fail` crate.

/// Evaluate a failpoint and return an error from the enclosing function if
/// it is active.  Used by the publisher so tests can abort a transaction at
/// any point of its state machine.
#[macro_export]
macro_rules! try_fail_point {
    ($name:expr) => {{
        if let Some(e) = fail::eval($name, |msg| {
            let msg = msg.unwrap_or_else(|| "synthetic failpoint".to_string());
            anyhow::Error::msg(msg)
        }) {
            return Err(e.into());
        }
    }};
}
