use std::sync::atomic::{AtomicBool, Ordering};

use log::{error, info};

/// Abstract boolean fault output. External LED/metric collaborators poll
/// `is_raised`; the core raises it on spool-write failure, exhausted publish
/// cycles and registration faults, and clears it on a successful publish or
/// keepalive. State transitions are logged once, not per call.
#[derive(Default)]
pub struct FaultIndicator {
    raised: AtomicBool,
}

impl FaultIndicator {
    pub fn raise(&self, reason: &str) {
        if !self.raised.swap(true, Ordering::AcqRel) {
            error!("fault indicator raised: {reason}");
        }
    }

    pub fn clear(&self) {
        if self.raised.swap(false, Ordering::AcqRel) {
            info!("fault indicator cleared");
        }
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_and_clear() {
        let fault = FaultIndicator::default();
        assert!(!fault.is_raised());
        fault.raise("test");
        fault.raise("test again");
        assert!(fault.is_raised());
        fault.clear();
        fault.clear();
        assert!(!fault.is_raised());
    }
}
