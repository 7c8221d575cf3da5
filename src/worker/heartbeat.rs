/// Tracks how long the broker has been silent, in heartbeat intervals.
///
/// Any message from the broker refills the budget; each heartbeat tick
/// spends one. Once the budget is gone the worker reconnects.
#[derive(Debug, Clone)]
pub struct BrokerLiveness {
    liveness: u32,
    remaining: u32,
}

impl BrokerLiveness {
    pub fn new(liveness: u32) -> Self {
        Self {
            liveness,
            remaining: liveness,
        }
    }

    /// Something arrived from the broker
    pub fn record_activity(&mut self) {
        self.remaining = self.liveness;
    }

    /// Spend one interval. Returns true when the broker should be presumed
    /// lost; the budget is refilled so the next reconnect gets a full window.
    pub fn tick(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            self.remaining = self.liveness;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_after_liveness_silent_ticks() {
        let mut liveness = BrokerLiveness::new(3);
        assert!(!liveness.tick());
        assert!(!liveness.tick());
        assert!(liveness.tick());
        // refilled: a full window again before the next reconnect
        assert!(!liveness.tick());
        assert!(!liveness.tick());
        assert!(liveness.tick());
    }

    #[test]
    fn activity_refills_budget() {
        let mut liveness = BrokerLiveness::new(2);
        assert!(!liveness.tick());
        liveness.record_activity();
        assert!(!liveness.tick());
        assert!(liveness.tick());
    }
}
