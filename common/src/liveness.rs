use crate::{
    config::LivenessConfig,
    net::{NetworkLink, RestartHandle},
    relay::RelayDriver,
    types::RestartReason,
};

/// What a watchdog check decided, for call-site logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessOutcome {
    Alive,
    /// The trip was spurious: the link is up, the transport just went
    /// quiet. Activity was refreshed, nothing else happened.
    SpuriousTripRefreshed,
    RecoveredAfterReset,
    RestartRequested,
}

/// Activity-keyed watchdog. The asynchronous transport can stop servicing
/// clients without the association ever dropping, so liveness is evidence
/// of traffic (a served request or a completed telemetry cycle), not link
/// state.
#[derive(Debug)]
pub struct LivenessWatchdog {
    config: LivenessConfig,
    last_activity_ms: u64,
}

impl LivenessWatchdog {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            config,
            last_activity_ms: 0,
        }
    }

    pub fn mark_activity(&mut self, now_ms: u64) {
        self.last_activity_ms = now_ms;
    }

    pub fn check(
        &mut self,
        now_ms: u64,
        link: &mut dyn NetworkLink,
        relay: &mut dyn RelayDriver,
        restart: &mut dyn RestartHandle,
    ) -> LivenessOutcome {
        if now_ms.saturating_sub(self.last_activity_ms) < self.config.activity_timeout_ms {
            return LivenessOutcome::Alive;
        }

        if link.is_associated() {
            self.mark_activity(now_ms);
            return LivenessOutcome::SpuriousTripRefreshed;
        }

        // Link is down and nothing has moved: power-cycle the interface
        // (the link waits out its post-reset grace internally).
        if link.hard_reset().is_ok() && link.is_associated() {
            self.mark_activity(now_ms);
            return LivenessOutcome::RecoveredAfterReset;
        }

        relay.set_energized(false);
        restart.request_restart(RestartReason::LivenessExhausted);
        LivenessOutcome::RestartRequested
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::test_support::{RecordingRelay, RecordingRestart, StubLink};

    fn watchdog() -> LivenessWatchdog {
        LivenessWatchdog::new(LivenessConfig::default())
    }

    #[test]
    fn recent_activity_keeps_the_watchdog_quiet() {
        let mut watchdog = watchdog();
        let mut link = StubLink::default();
        let mut relay = RecordingRelay::default();
        let mut restart = RecordingRestart::default();

        watchdog.mark_activity(5_000);
        let outcome = watchdog.check(64_999, &mut link, &mut relay, &mut restart);

        assert_eq!(outcome, LivenessOutcome::Alive);
        assert_eq!(link.hard_reset_calls, 0);
    }

    #[test]
    fn spurious_trip_with_association_only_refreshes() {
        let mut watchdog = watchdog();
        let mut link = StubLink {
            associated: true,
            ..StubLink::default()
        };
        let mut relay = RecordingRelay::default();
        let mut restart = RecordingRestart::default();

        // Heater started, then 61s of silence while the network stays up.
        watchdog.mark_activity(0);
        let outcome = watchdog.check(61_000, &mut link, &mut relay, &mut restart);

        assert_eq!(outcome, LivenessOutcome::SpuriousTripRefreshed);
        assert!(restart.reasons.is_empty());
        assert_eq!(link.hard_reset_calls, 0);

        // Refresh took: the very next check is quiet again.
        let outcome = watchdog.check(62_000, &mut link, &mut relay, &mut restart);
        assert_eq!(outcome, LivenessOutcome::Alive);
    }

    #[test]
    fn dead_link_recovers_through_an_interface_reset() {
        let mut watchdog = watchdog();
        let mut link = StubLink {
            hard_reset_restores: true,
            ..StubLink::default()
        };
        let mut relay = RecordingRelay::default();
        let mut restart = RecordingRestart::default();

        let outcome = watchdog.check(60_000, &mut link, &mut relay, &mut restart);

        assert_eq!(outcome, LivenessOutcome::RecoveredAfterReset);
        assert_eq!(link.hard_reset_calls, 1);
        assert!(restart.reasons.is_empty());
    }

    #[test]
    fn exhausted_liveness_forces_relay_off_then_restarts() {
        let mut watchdog = watchdog();
        let mut link = StubLink::default();
        let mut relay = RecordingRelay::default();
        let mut restart = RecordingRestart::default();

        let outcome = watchdog.check(60_000, &mut link, &mut relay, &mut restart);

        assert_eq!(outcome, LivenessOutcome::RestartRequested);
        assert_eq!(relay.states, vec![false]);
        assert_eq!(restart.reasons, vec![RestartReason::LivenessExhausted]);
    }
}
