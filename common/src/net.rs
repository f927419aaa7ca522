use thiserror::Error;

use crate::{config::ConnectivityConfig, relay::RelayDriver, types::RestartReason};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("association did not come up within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("network interface error: {0}")]
    Interface(String),
}

/// Station-side view of the wireless interface. `reassociate` and
/// `hard_reset` are synchronous and bounded; both return only once the
/// attempt has definitively succeeded or failed.
pub trait NetworkLink {
    fn is_associated(&mut self) -> bool;

    /// Force-disassociate, re-issue association with the stored
    /// credentials, and wait up to the configured reassociation timeout.
    fn reassociate(&mut self) -> Result<(), LinkError>;

    /// Power-cycle the interface, restore station mode and any static
    /// addressing, then re-associate. Clears driver-level lockups that a
    /// plain reconnect cannot. `Ok` means the link came back.
    fn hard_reset(&mut self) -> Result<(), LinkError>;
}

pub trait RestartHandle {
    /// Full process restart. Discards all in-memory state; implementations
    /// do not return control to the caller on real hardware.
    fn request_restart(&mut self, reason: RestartReason);
}

/// What a guardian poll did, for call-site logging.
#[derive(Debug)]
pub enum GuardianEvent {
    Reassociated,
    ReassociationFailed { consecutive: u32, error: LinkError },
    InterfaceReset { recovered: bool },
    IdleRestartRequested,
}

/// Staged reconnect escalation plus the idle periodic restart. Pure logic
/// over injected capabilities; timing comes in through `now_ms`.
#[derive(Debug)]
pub struct ConnectivityGuardian {
    config: ConnectivityConfig,
    last_check_ms: u64,
    consecutive_failures: u32,
    last_idle_reset_ms: u64,
}

impl ConnectivityGuardian {
    pub fn new(config: ConnectivityConfig) -> Self {
        Self {
            config,
            last_check_ms: 0,
            consecutive_failures: 0,
            last_idle_reset_ms: 0,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn poll(
        &mut self,
        now_ms: u64,
        heater_requested: bool,
        link: &mut dyn NetworkLink,
        relay: &mut dyn RelayDriver,
        restart: &mut dyn RestartHandle,
    ) -> Vec<GuardianEvent> {
        let mut events = Vec::new();

        // The idle-restart clock only runs while the heater is genuinely
        // idle; a requested cycle always pushes it forward, so the restart
        // can never interrupt an active session.
        if heater_requested {
            self.last_idle_reset_ms = now_ms;
        } else if now_ms.saturating_sub(self.last_idle_reset_ms)
            >= self.config.idle_restart_interval_ms
        {
            relay.set_energized(false);
            restart.request_restart(RestartReason::IdleMaintenance);
            events.push(GuardianEvent::IdleRestartRequested);
            return events;
        }

        if link.is_associated() {
            self.consecutive_failures = 0;
            return events;
        }

        if now_ms.saturating_sub(self.last_check_ms) < self.config.poll_interval_ms {
            return events;
        }
        self.last_check_ms = now_ms;

        match link.reassociate() {
            Ok(()) => {
                self.consecutive_failures = 0;
                events.push(GuardianEvent::Reassociated);
            }
            Err(error) => {
                self.consecutive_failures += 1;
                events.push(GuardianEvent::ReassociationFailed {
                    consecutive: self.consecutive_failures,
                    error,
                });
                if self.consecutive_failures >= self.config.failure_threshold {
                    let recovered = link.hard_reset().is_ok();
                    self.consecutive_failures = 0;
                    events.push(GuardianEvent::InterfaceReset { recovered });
                }
            }
        }

        events
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn guardian() -> ConnectivityGuardian {
        ConnectivityGuardian::new(ConnectivityConfig::default())
    }

    #[test]
    fn associated_link_clears_counter_without_attempts() {
        let mut guardian = guardian();
        let mut link = StubLink {
            associated: true,
            ..StubLink::default()
        };
        let mut relay = RecordingRelay::default();
        let mut restart = RecordingRestart::default();

        let events = guardian.poll(10_000, false, &mut link, &mut relay, &mut restart);

        assert!(events.is_empty());
        assert_eq!(link.reassociate_calls, 0);
    }

    #[test]
    fn reconnect_attempts_are_gated_by_the_poll_interval() {
        let mut guardian = guardian();
        let mut link = StubLink::default();
        let mut relay = RecordingRelay::default();
        let mut restart = RecordingRestart::default();

        guardian.poll(10_000, false, &mut link, &mut relay, &mut restart);
        assert_eq!(link.reassociate_calls, 1);

        // Within the same window nothing new is attempted.
        guardian.poll(15_000, false, &mut link, &mut relay, &mut restart);
        assert_eq!(link.reassociate_calls, 1);

        guardian.poll(20_000, false, &mut link, &mut relay, &mut restart);
        assert_eq!(link.reassociate_calls, 2);
    }

    #[test]
    fn successful_reassociation_resets_the_counter() {
        let mut guardian = guardian();
        let mut link = StubLink::default();
        let mut relay = RecordingRelay::default();
        let mut restart = RecordingRestart::default();

        guardian.poll(10_000, false, &mut link, &mut relay, &mut restart);
        assert_eq!(guardian.consecutive_failures(), 1);

        link.reassociate_result_ok = true;
        link.associated = false;
        let events = guardian.poll(20_000, false, &mut link, &mut relay, &mut restart);

        assert!(matches!(events[0], GuardianEvent::Reassociated));
        assert_eq!(guardian.consecutive_failures(), 0);
    }

    #[test]
    fn failure_threshold_triggers_exactly_one_interface_reset() {
        let mut guardian = guardian();
        let mut link = StubLink {
            hard_reset_restores: true,
            ..StubLink::default()
        };
        let mut relay = RecordingRelay::default();
        let mut restart = RecordingRestart::default();

        guardian.poll(10_000, false, &mut link, &mut relay, &mut restart);
        guardian.poll(20_000, false, &mut link, &mut relay, &mut restart);
        assert_eq!(link.hard_reset_calls, 0);

        let events = guardian.poll(30_000, false, &mut link, &mut relay, &mut restart);

        assert_eq!(link.hard_reset_calls, 1);
        assert_eq!(guardian.consecutive_failures(), 0);
        assert!(matches!(
            events.last(),
            Some(GuardianEvent::InterfaceReset { recovered: true })
        ));
        assert!(restart.reasons.is_empty());
    }

    #[test]
    fn attempts_resume_normally_after_an_interface_reset() {
        let mut guardian = guardian();
        let mut link = StubLink::default();
        let mut relay = RecordingRelay::default();
        let mut restart = RecordingRestart::default();

        for check_ms in [10_000, 20_000, 30_000] {
            guardian.poll(check_ms, false, &mut link, &mut relay, &mut restart);
        }
        assert_eq!(link.hard_reset_calls, 1);

        link.associated = false;
        let events = guardian.poll(40_000, false, &mut link, &mut relay, &mut restart);

        assert!(matches!(
            events[0],
            GuardianEvent::ReassociationFailed { consecutive: 1, .. }
        ));
        assert_eq!(link.hard_reset_calls, 1);
    }

    #[test]
    fn idle_restart_fires_after_a_full_idle_interval() {
        let mut guardian = guardian();
        let mut link = StubLink {
            associated: true,
            ..StubLink::default()
        };
        let mut relay = RecordingRelay::default();
        let mut restart = RecordingRestart::default();

        let events = guardian.poll(1_799_999, false, &mut link, &mut relay, &mut restart);
        assert!(events.is_empty());

        let events = guardian.poll(1_800_000, false, &mut link, &mut relay, &mut restart);

        assert!(matches!(events[0], GuardianEvent::IdleRestartRequested));
        assert_eq!(restart.reasons, vec![RestartReason::IdleMaintenance]);
        // Relay forced off before the restart goes out.
        assert_eq!(relay.states, vec![false]);
    }

    #[test]
    fn requested_heater_pushes_the_idle_clock_forward() {
        let mut guardian = guardian();
        let mut link = StubLink {
            associated: true,
            ..StubLink::default()
        };
        let mut relay = RecordingRelay::default();
        let mut restart = RecordingRestart::default();

        // Heater requested across more than a full idle interval: the
        // restart must never fire.
        let mut now_ms = 0;
        while now_ms <= 2_400_000 {
            let events = guardian.poll(now_ms, true, &mut link, &mut relay, &mut restart);
            assert!(events.is_empty());
            now_ms += 10_000;
        }
        assert!(restart.reasons.is_empty());

        // Once idle, the interval restarts from the last requested cycle.
        let events = guardian.poll(2_400_000 + 1_799_999, false, &mut link, &mut relay, &mut restart);
        assert!(events.is_empty());
        let events = guardian.poll(2_400_000 + 1_800_000, false, &mut link, &mut relay, &mut restart);
        assert!(matches!(events[0], GuardianEvent::IdleRestartRequested));
    }
}
