use crate::blink::BlinkPattern;
use crate::config::{BlinkConfig, ConnectivityConfig};
use crate::types::LinkState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    /// Full station association plus broker session setup.
    ConnectWifi,
    /// Broker handshake and subscription only.
    ConnectBroker,
    PublishReadings,
    RefreshDisplay,
    /// Retry ceiling exceeded. Fatal; the executor reboots the device.
    Restart,
}

/// Liveness-poll inputs gathered by the node each loop iteration.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkHealth {
    pub wifi_up: bool,
    pub broker_up: bool,
}

/// Connectivity supervisor. Owns every piece of reconnect/publish state and
/// is driven purely by `tick` with an external time source, so the whole
/// retry policy runs identically on device and host.
#[derive(Debug, Clone)]
pub struct LinkSupervisor {
    config: ConnectivityConfig,
    blink: BlinkConfig,

    wifi_connected: bool,
    broker_connected: bool,

    // Shared between WiFi-level and broker-level attempts, and never reset
    // on success: a node that keeps flapping eventually earns a clean
    // reboot.
    retry_count: u32,

    last_broker_attempt_ms: u64,
    last_wifi_attempt_ms: u64,
    last_publish_ms: u64,
    last_display_ms: u64,
}

impl LinkSupervisor {
    pub fn new(config: ConnectivityConfig, blink: BlinkConfig) -> Self {
        Self {
            config,
            blink,
            wifi_connected: false,
            broker_connected: false,
            retry_count: 0,
            last_broker_attempt_ms: 0,
            last_wifi_attempt_ms: 0,
            last_publish_ms: 0,
            last_display_ms: 0,
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn state(&self) -> LinkState {
        if !self.wifi_connected {
            LinkState::WifiDown
        } else if !self.broker_connected {
            LinkState::WifiUpBrokerDown
        } else {
            LinkState::Connected
        }
    }

    /// Preset matching the broker state as of the last tick. The blinker
    /// picks it up at its next phase transition.
    pub fn blink_pattern(&self) -> BlinkPattern {
        if self.broker_connected {
            self.blink.connected
        } else {
            self.blink.waiting
        }
    }

    /// Zeroes the display stamp so the next connected tick redraws.
    pub fn force_display_refresh(&mut self) {
        self.last_display_ms = 0;
    }

    pub fn tick(&mut self, health: LinkHealth, now_ms: u64) -> Vec<LinkAction> {
        let mut actions = Vec::new();

        self.wifi_connected = health.wifi_up;
        self.broker_connected = health.broker_up;

        if self.retry_count > self.config.max_retries_before_reboot {
            actions.push(LinkAction::Restart);
            return actions;
        }

        if !self.broker_connected {
            if now_ms.saturating_sub(self.last_broker_attempt_ms)
                >= self.config.broker_retry_cooldown_ms
            {
                if self.wifi_connected {
                    self.retry_count += 1;
                    actions.push(LinkAction::ConnectBroker);
                }
                // The attempt time advances even while WiFi is down.
                self.last_broker_attempt_ms = now_ms;
            }
        } else {
            if now_ms.saturating_sub(self.last_publish_ms) >= self.config.publish_interval_ms {
                self.last_publish_ms = now_ms;
                actions.push(LinkAction::PublishReadings);
            }
            if now_ms.saturating_sub(self.last_display_ms) >= self.config.display_refresh_ms {
                self.last_display_ms = now_ms;
                actions.push(LinkAction::RefreshDisplay);
            }
        }

        if !self.wifi_connected
            && now_ms.saturating_sub(self.last_wifi_attempt_ms)
                >= self.config.wifi_retry_cooldown_ms
        {
            // WiFi-level attempts count against the same ceiling.
            self.retry_count += 1;
            self.last_wifi_attempt_ms = now_ms;
            actions.push(LinkAction::ConnectWifi);
        }

        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const UP: LinkHealth = LinkHealth {
        wifi_up: true,
        broker_up: true,
    };
    const BROKER_DOWN: LinkHealth = LinkHealth {
        wifi_up: true,
        broker_up: false,
    };
    const ALL_DOWN: LinkHealth = LinkHealth {
        wifi_up: false,
        broker_up: false,
    };

    fn supervisor() -> LinkSupervisor {
        LinkSupervisor::new(ConnectivityConfig::default(), BlinkConfig::default())
    }

    fn drive(
        supervisor: &mut LinkSupervisor,
        health: LinkHealth,
        from_ms: u64,
        to_ms: u64,
        step_ms: u64,
    ) -> Vec<(u64, LinkAction)> {
        let mut seen = Vec::new();
        let mut now = from_ms;
        while now <= to_ms {
            for action in supervisor.tick(health, now) {
                seen.push((now, action));
            }
            now += step_ms;
        }
        seen
    }

    #[test]
    fn broker_attempts_respect_cooldown_under_fast_polling() {
        let mut supervisor = supervisor();

        let seen = drive(&mut supervisor, BROKER_DOWN, 0, 60_000, 10);
        let attempts: Vec<u64> = seen
            .iter()
            .filter(|(_, action)| *action == LinkAction::ConnectBroker)
            .map(|(at, _)| *at)
            .collect();

        assert_eq!(attempts, vec![30_000, 60_000]);
        assert_eq!(supervisor.retry_count(), 2);
    }

    #[test]
    fn attempt_time_is_stamped_even_while_wifi_is_down() {
        let mut supervisor = supervisor();

        // Cooldown expires at 30s, but WiFi is down: no attempt, no count.
        let seen = drive(&mut supervisor, ALL_DOWN, 0, 30_000, 10);
        assert!(seen.is_empty());
        assert_eq!(supervisor.retry_count(), 0);

        // WiFi back right after: the stamp already moved, so the next
        // attempt waits for a full cooldown.
        let actions = supervisor.tick(BROKER_DOWN, 30_010);
        assert!(actions.is_empty());

        let actions = supervisor.tick(BROKER_DOWN, 60_000);
        assert_eq!(actions, vec![LinkAction::ConnectBroker]);
    }

    #[test]
    fn publication_is_throttled_to_the_configured_interval() {
        let mut supervisor = supervisor();

        let seen = drive(&mut supervisor, UP, 0, 360_000, 10);
        let publishes: Vec<u64> = seen
            .iter()
            .filter(|(_, action)| *action == LinkAction::PublishReadings)
            .map(|(at, _)| *at)
            .collect();

        assert_eq!(publishes, vec![120_000, 240_000, 360_000]);
    }

    #[test]
    fn display_refresh_only_while_connected() {
        let mut supervisor = supervisor();

        let seen = drive(&mut supervisor, BROKER_DOWN, 0, 20_000, 100);
        assert!(!seen
            .iter()
            .any(|(_, action)| *action == LinkAction::RefreshDisplay));

        let refreshes = drive(&mut supervisor, UP, 20_100, 50_000, 100)
            .iter()
            .filter(|(_, action)| *action == LinkAction::RefreshDisplay)
            .count();
        assert_eq!(refreshes, 3);
    }

    #[test]
    fn forced_refresh_redraws_at_the_next_connected_tick() {
        let mut supervisor = supervisor();

        let actions = supervisor.tick(UP, 60_000);
        assert!(actions.contains(&LinkAction::RefreshDisplay));

        let actions = supervisor.tick(UP, 61_000);
        assert!(!actions.contains(&LinkAction::RefreshDisplay));

        supervisor.force_display_refresh();
        let actions = supervisor.tick(UP, 62_000);
        assert!(actions.contains(&LinkAction::RefreshDisplay));
    }

    #[test]
    fn blink_preset_follows_broker_state() {
        let blink = BlinkConfig::default();
        let mut supervisor = supervisor();

        supervisor.tick(BROKER_DOWN, 0);
        assert_eq!(supervisor.blink_pattern(), blink.waiting);

        supervisor.tick(UP, 10);
        assert_eq!(supervisor.blink_pattern(), blink.connected);

        supervisor.tick(BROKER_DOWN, 20);
        assert_eq!(supervisor.blink_pattern(), blink.waiting);
    }

    #[test]
    fn exactly_five_attempts_in_a_150s_outage() {
        let mut supervisor = supervisor();

        let seen = drive(&mut supervisor, BROKER_DOWN, 0, 150_000, 10);
        let attempts = seen
            .iter()
            .filter(|(_, action)| *action == LinkAction::ConnectBroker)
            .count();

        assert_eq!(attempts, 5);
        assert!(!seen.iter().any(|(_, action)| *action == LinkAction::Restart));
        assert_eq!(supervisor.retry_count(), 5);
    }

    #[test]
    fn restart_fires_once_the_counter_exceeds_the_ceiling() {
        let mut supervisor = supervisor();

        drive(&mut supervisor, BROKER_DOWN, 0, 150_000, 10);
        assert_eq!(supervisor.retry_count(), 5);

        // At the ceiling, not over it: the sixth gated attempt still runs.
        let actions = supervisor.tick(BROKER_DOWN, 180_000);
        assert_eq!(actions, vec![LinkAction::ConnectBroker]);
        assert_eq!(supervisor.retry_count(), 6);

        let actions = supervisor.tick(BROKER_DOWN, 180_010);
        assert_eq!(actions, vec![LinkAction::Restart]);
    }

    #[test]
    fn restart_is_unconditional_once_over_the_ceiling() {
        let mut supervisor = supervisor();

        drive(&mut supervisor, BROKER_DOWN, 0, 180_000, 10);
        assert_eq!(supervisor.retry_count(), 6);

        // Even a recovered link cannot cancel the pending reboot.
        let actions = supervisor.tick(UP, 180_010);
        assert_eq!(actions, vec![LinkAction::Restart]);
    }

    #[test]
    fn retry_count_is_not_reset_by_successful_reconnects() {
        let mut supervisor = supervisor();

        drive(&mut supervisor, BROKER_DOWN, 0, 60_000, 10);
        assert_eq!(supervisor.retry_count(), 2);

        // A long healthy stretch leaves the counter untouched.
        drive(&mut supervisor, UP, 60_010, 400_000, 10);
        assert_eq!(supervisor.retry_count(), 2);

        // Later outages keep accumulating toward the reboot ceiling.
        let seen = drive(&mut supervisor, BROKER_DOWN, 400_010, 550_000, 10);
        assert_eq!(supervisor.retry_count(), 6);
        assert!(seen.iter().any(|(_, action)| *action == LinkAction::Restart));
    }

    #[test]
    fn wifi_attempts_share_the_retry_counter() {
        let mut supervisor = supervisor();

        let seen = drive(&mut supervisor, ALL_DOWN, 0, 600_000, 100);
        let attempts: Vec<u64> = seen
            .iter()
            .filter(|(_, action)| *action == LinkAction::ConnectWifi)
            .map(|(at, _)| *at)
            .collect();

        assert_eq!(attempts, vec![300_000, 600_000]);
        assert_eq!(supervisor.retry_count(), 2);
        assert!(!seen
            .iter()
            .any(|(_, action)| *action == LinkAction::ConnectBroker));
    }

    #[test]
    fn state_reflects_the_last_liveness_poll() {
        let mut supervisor = supervisor();
        assert_eq!(supervisor.state(), LinkState::WifiDown);

        supervisor.tick(BROKER_DOWN, 0);
        assert_eq!(supervisor.state(), LinkState::WifiUpBrokerDown);

        supervisor.tick(UP, 10);
        assert_eq!(supervisor.state(), LinkState::Connected);

        supervisor.tick(ALL_DOWN, 20);
        assert_eq!(supervisor.state(), LinkState::WifiDown);
    }
}
