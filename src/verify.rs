//! Soft assertions for internal consistency checks.

/// Evaluates a condition that must hold if the cache's maps are consistent.
///
/// On failure the check is logged at `error` level and the macro evaluates
/// to `false`, letting the caller skip the offending entry and continue. A
/// failed check indicates a bug, not a recoverable runtime condition, so
/// there is no error type to propagate.
macro_rules! verify {
    ($cond:expr, $($msg:tt)+) => {{
        let ok = $cond;
        if !ok {
            tracing::error!(check = stringify!($cond), $($msg)+);
        }
        ok
    }};
}

pub(crate) use verify;
