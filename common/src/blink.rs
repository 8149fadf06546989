use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlinkPattern {
    pub period_ms: u64,
    pub on_duration_ms: u64,
}

/// Two-phase status LED: on for `on_duration_ms`, off for `period_ms`.
/// Phase lengths are latched at each transition, so a pattern swap takes
/// effect at the next transition rather than cutting the current phase
/// short.
#[derive(Debug, Clone)]
pub struct StatusBlinker {
    pattern: BlinkPattern,
    led_on: bool,
    phase_started_ms: u64,
    phase_len_ms: u64,
}

impl StatusBlinker {
    pub fn new(pattern: BlinkPattern, now_ms: u64) -> Self {
        Self {
            pattern,
            led_on: true,
            phase_started_ms: now_ms,
            phase_len_ms: pattern.on_duration_ms,
        }
    }

    pub fn set_pattern(&mut self, pattern: BlinkPattern) {
        self.pattern = pattern;
    }

    pub fn led_on(&self) -> bool {
        self.led_on
    }

    /// Returns the new output level when a phase boundary was crossed.
    pub fn tick(&mut self, now_ms: u64) -> Option<bool> {
        if now_ms.saturating_sub(self.phase_started_ms) < self.phase_len_ms {
            return None;
        }

        self.led_on = !self.led_on;
        self.phase_len_ms = if self.led_on {
            self.pattern.on_duration_ms
        } else {
            self.pattern.period_ms
        };
        self.phase_started_ms = now_ms;
        Some(self.led_on)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAITING: BlinkPattern = BlinkPattern {
        period_ms: 1_000,
        on_duration_ms: 100,
    };
    const CONNECTED: BlinkPattern = BlinkPattern {
        period_ms: 10_000,
        on_duration_ms: 100,
    };

    #[test]
    fn cycles_on_then_off() {
        let mut blinker = StatusBlinker::new(WAITING, 0);
        assert!(blinker.led_on());

        assert_eq!(blinker.tick(50), None);
        assert_eq!(blinker.tick(100), Some(false));
        assert_eq!(blinker.tick(600), None);
        assert_eq!(blinker.tick(1_100), Some(true));
        assert_eq!(blinker.tick(1_200), Some(false));
    }

    #[test]
    fn pattern_swap_applies_at_next_transition() {
        let mut blinker = StatusBlinker::new(CONNECTED, 0);

        assert_eq!(blinker.tick(100), Some(false));

        // Swapping mid-phase must not shorten the running 10s off phase.
        blinker.set_pattern(WAITING);
        assert_eq!(blinker.tick(1_200), None);
        assert_eq!(blinker.tick(10_100), Some(true));

        // From here the waiting preset governs phase lengths.
        assert_eq!(blinker.tick(10_200), Some(false));
        assert_eq!(blinker.tick(11_200), Some(true));
    }
}
