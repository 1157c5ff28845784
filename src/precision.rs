//! Mixed-precision settings and the scoped autocast context used around
//! forward calls.

use std::cell::Cell;

use candle_core::DType;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    /// 32-bit weights and activations.
    Full,
    /// 16-bit activations where the model allows it.
    Half,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmpBackend {
    /// Autocast scoped to each forward call.
    Native,
    /// Model and optimizers rewrapped once by the module's `configure_apex` hook.
    Apex,
}

/// The AMP path a run uses, if any.
pub fn amp_type(precision: Precision, backend: AmpBackend) -> Option<AmpBackend> {
    match precision {
        Precision::Full => None,
        Precision::Half => Some(backend),
    }
}

thread_local! {
    static AUTOCAST: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is inside an autocast scope.
pub fn is_autocast_enabled() -> bool {
    AUTOCAST.with(Cell::get)
}

/// Dtype a model should compute in for the current scope.
pub fn autocast_dtype() -> DType {
    if is_autocast_enabled() {
        DType::F16
    } else {
        DType::F32
    }
}

/// Enables reduced-precision arithmetic until dropped, restoring the
/// previous state so scopes nest.
#[must_use]
pub struct AutocastGuard {
    previous: bool,
}

impl AutocastGuard {
    pub fn enter() -> Self {
        let previous = AUTOCAST.with(|flag| flag.replace(true));
        Self { previous }
    }
}

impl Drop for AutocastGuard {
    fn drop(&mut self) {
        AUTOCAST.with(|flag| flag.set(self.previous));
    }
}

pub fn autocast<T>(f: impl FnOnce() -> T) -> T {
    let _guard = AutocastGuard::enter();
    f()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn autocast_is_scoped_to_the_call() {
        assert!(!is_autocast_enabled());
        let inside = autocast(|| (is_autocast_enabled(), autocast_dtype()));
        assert_eq!(inside, (true, DType::F16));
        assert!(!is_autocast_enabled());
        assert_eq!(autocast_dtype(), DType::F32);
    }

    #[test]
    fn nested_scopes_restore_outer_state() {
        let outer = AutocastGuard::enter();
        {
            let _inner = AutocastGuard::enter();
            assert!(is_autocast_enabled());
        }
        assert!(is_autocast_enabled());
        drop(outer);
        assert!(!is_autocast_enabled());
    }

    #[test]
    fn full_precision_never_uses_amp() {
        assert_eq!(amp_type(Precision::Full, AmpBackend::Apex), None);
        assert_eq!(amp_type(Precision::Half, AmpBackend::Apex), Some(AmpBackend::Apex));
    }
}
