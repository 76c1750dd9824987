use std::sync::atomic::{AtomicBool, Ordering};

/// Runtime switch for C2C accept logging, flipped through the debug server
/// and read by the planner on every tick.
#[derive(Debug, Default)]
pub struct LogState {
    enabled: AtomicBool,
}

impl LogState {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle() {
        let state = LogState::new(false);
        assert!(!state.enabled());
        state.set(true);
        assert!(state.enabled());
    }
}
