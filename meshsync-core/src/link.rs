//! Link lifecycle state machine.
//!
//! This module provides a pure, side-effect-free state machine for one
//! peer link's lifecycle: connect, reconnect with backoff, periodic
//! refresh (cheap health re-announcement) and periodic recycling
//! (proactive teardown of healthy links to bound accumulated session
//! state). The state machine takes events as input and produces a new
//! state plus a list of actions to execute.
//!
//! The actual I/O (connecting, sending, timers) is performed by
//! meshsync-engine, not by this module.

use std::time::Duration;

/// Lifecycle state of one peer link - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LinkState {
    /// No connection, no pending retry.
    #[default]
    Down,
    /// Connection attempt in progress.
    Connecting,
    /// Connected and exchanging frames.
    Up,
    /// Disconnected, waiting for the reconnect timer.
    Reconnecting {
        /// Number of reconnection attempts so far.
        attempt: u32,
    },
}

impl LinkState {
    /// Create a new state machine in the Down state.
    pub fn new() -> Self {
        Self::Down
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function - no side effects. The caller is
    /// responsible for executing the returned actions.
    pub fn on_event(self, event: LinkEvent, backoff: &BackoffPolicy) -> (Self, Vec<LinkAction>) {
        match (self, event) {
            // From Down
            (Self::Down, LinkEvent::ConnectRequested) => {
                (Self::Connecting, vec![LinkAction::Connect])
            }

            // From Connecting
            (Self::Connecting, LinkEvent::ConnectSucceeded) => (
                Self::Up,
                vec![
                    LinkAction::Notify(LinkNotice::Up),
                    LinkAction::SendAnnounce,
                ],
            ),
            (Self::Connecting, LinkEvent::ConnectFailed { error }) => (
                Self::Reconnecting { attempt: 1 },
                vec![
                    LinkAction::Notify(LinkNotice::ReconnectFailed { attempt: 1, error }),
                    LinkAction::StartReconnectTimer {
                        delay: backoff.delay(1),
                    },
                ],
            ),
            (Self::Connecting, LinkEvent::TeardownRequested) => {
                (Self::Down, vec![LinkAction::Disconnect])
            }

            // From Up
            (Self::Up, LinkEvent::RefreshTimer) => (Self::Up, vec![LinkAction::SendAnnounce]),
            (Self::Up, LinkEvent::RecycleTimer) => {
                // Resource hygiene, not a failure response: tear the healthy
                // link down and immediately re-establish it.
                (
                    Self::Connecting,
                    vec![LinkAction::Disconnect, LinkAction::Connect],
                )
            }
            (Self::Up, LinkEvent::LinkLost { reason }) => (
                Self::Reconnecting { attempt: 1 },
                vec![
                    LinkAction::Notify(LinkNotice::Down { reason }),
                    LinkAction::StartReconnectTimer {
                        delay: backoff.delay(1),
                    },
                ],
            ),
            (Self::Up, LinkEvent::TeardownRequested) => (
                Self::Down,
                vec![
                    LinkAction::Disconnect,
                    LinkAction::Notify(LinkNotice::Down {
                        reason: "teardown requested".into(),
                    }),
                ],
            ),

            // From Reconnecting. The attempt count is kept through the
            // retry so repeated failures keep growing the backoff.
            (Self::Reconnecting { attempt }, LinkEvent::ReconnectTimer) => {
                (Self::Reconnecting { attempt }, vec![LinkAction::Connect])
            }
            (Self::Reconnecting { .. }, LinkEvent::ConnectSucceeded) => (
                Self::Up,
                vec![
                    LinkAction::Notify(LinkNotice::Up),
                    LinkAction::SendAnnounce,
                ],
            ),
            (Self::Reconnecting { attempt }, LinkEvent::ConnectFailed { error }) => {
                let next_attempt = attempt.saturating_add(1);
                (
                    Self::Reconnecting {
                        attempt: next_attempt,
                    },
                    vec![
                        LinkAction::Notify(LinkNotice::ReconnectFailed {
                            attempt: next_attempt,
                            error,
                        }),
                        LinkAction::StartReconnectTimer {
                            delay: backoff.delay(next_attempt),
                        },
                    ],
                )
            }
            (Self::Reconnecting { .. }, LinkEvent::TeardownRequested) => {
                (Self::Down, vec![LinkAction::CancelReconnect])
            }

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Check if the link is currently up.
    pub fn is_up(&self) -> bool {
        matches!(self, Self::Up)
    }

    /// Check if the link is trying to (re)connect.
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting { .. })
    }
}

/// Events that can occur in the link lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Manager requested connection.
    ConnectRequested,
    /// Transport connection succeeded.
    ConnectSucceeded,
    /// Transport connection failed.
    ConnectFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// An established connection was lost.
    LinkLost {
        /// Reason for the loss.
        reason: String,
    },
    /// Reconnect timer fired.
    ReconnectTimer,
    /// Refresh timer fired (cheap, frequent health re-announcement).
    RefreshTimer,
    /// Recycle timer fired (rare, disruptive proactive re-establish).
    RecycleTimer,
    /// Manager requested permanent teardown.
    TeardownRequested,
}

/// Actions to be executed by the connection manager.
///
/// These are instructions, not side effects. The manager interprets
/// them and performs the actual I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    /// Initiate a transport connection.
    Connect,
    /// Close the transport connection.
    Disconnect,
    /// Re-announce local presence on the link.
    SendAnnounce,
    /// Start a timer for reconnection.
    StartReconnectTimer {
        /// Delay before attempting reconnection.
        delay: Duration,
    },
    /// Cancel any pending reconnect timer.
    CancelReconnect,
    /// Surface a notice to the application event stream.
    Notify(LinkNotice),
}

/// Notices surfaced to the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkNotice {
    /// The link came up.
    Up,
    /// The link went down.
    Down {
        /// Reason for going down.
        reason: String,
    },
    /// A reconnection attempt failed.
    ReconnectFailed {
        /// Which reconnection attempt this was.
        attempt: u32,
        /// Error message describing the failure.
        error: String,
    },
}

/// Reconnect backoff policy.
///
/// Delays double per attempt from `base` up to `cap`, plus random jitter
/// to prevent thundering herd when many nodes reconnect after a relay
/// restart. The curve is monotonically non-decreasing and bounded above;
/// the specific constants are configuration, not correctness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay for the first attempt.
    pub base: Duration,
    /// Upper bound on the deterministic part of the delay.
    pub cap: Duration,
    /// Maximum random jitter added on top.
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(30),
            jitter: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Deterministic part of the delay for the given attempt (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let scaled = self.base.saturating_mul(2u32.saturating_pow(exp));
        scaled.min(self.cap)
    }

    /// Full delay for the given attempt: deterministic part plus jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay(attempt) + random_jitter(self.jitter)
    }
}

/// Random jitter between zero and `max` inclusive.
fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes).expect("getrandom failed");
    let random = u64::from_le_bytes(bytes);
    Duration::from_millis(random % (max_ms + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(30),
            jitter: Duration::ZERO,
        }
    }

    #[test]
    fn starts_down() {
        assert_eq!(LinkState::new(), LinkState::Down);
    }

    #[test]
    fn connect_request_transitions_to_connecting() {
        let (state, actions) =
            LinkState::Down.on_event(LinkEvent::ConnectRequested, &no_jitter());

        assert_eq!(state, LinkState::Connecting);
        assert!(actions.iter().any(|a| matches!(a, LinkAction::Connect)));
    }

    #[test]
    fn connect_success_brings_link_up_and_announces() {
        let (state, actions) =
            LinkState::Connecting.on_event(LinkEvent::ConnectSucceeded, &no_jitter());

        assert!(state.is_up());
        assert!(actions
            .iter()
            .any(|a| matches!(a, LinkAction::Notify(LinkNotice::Up))));
        assert!(actions
            .iter()
            .any(|a| matches!(a, LinkAction::SendAnnounce)));
    }

    #[test]
    fn connect_failure_starts_backoff() {
        let (state, actions) = LinkState::Connecting.on_event(
            LinkEvent::ConnectFailed {
                error: "timeout".into(),
            },
            &no_jitter(),
        );

        assert_eq!(state, LinkState::Reconnecting { attempt: 1 });
        assert!(actions.iter().any(|a| matches!(
            a,
            LinkAction::StartReconnectTimer { delay } if *delay == Duration::from_secs(2)
        )));
    }

    #[test]
    fn repeated_failures_increase_delay() {
        let mut state = LinkState::Connecting;
        let mut delays = Vec::new();
        for _ in 0..4 {
            let (next, actions) = state.on_event(
                LinkEvent::ConnectFailed {
                    error: "refused".into(),
                },
                &no_jitter(),
            );
            for action in &actions {
                if let LinkAction::StartReconnectTimer { delay } = action {
                    delays.push(*delay);
                }
            }
            // Timer fires, the retry goes out, and fails again
            let (retrying, _) = next.on_event(LinkEvent::ReconnectTimer, &no_jitter());
            state = retrying;
        }

        assert_eq!(
            delays,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
            ]
        );
    }

    #[test]
    fn backoff_is_monotone_and_bounded() {
        let policy = no_jitter();
        let mut prev = Duration::ZERO;
        for attempt in 1..64 {
            let delay = policy.base_delay(attempt);
            assert!(delay >= prev, "backoff must not decrease");
            assert!(delay <= policy.cap, "backoff must stay bounded");
            prev = delay;
        }
        assert_eq!(policy.base_delay(1000), policy.cap);
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(1),
            jitter: Duration::from_millis(500),
        };
        for attempt in 1..20 {
            let delay = policy.delay(attempt);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn reconnect_timer_issues_connect_and_keeps_attempt() {
        let (state, actions) = LinkState::Reconnecting { attempt: 3 }
            .on_event(LinkEvent::ReconnectTimer, &no_jitter());

        assert_eq!(state, LinkState::Reconnecting { attempt: 3 });
        assert!(actions.iter().any(|a| matches!(a, LinkAction::Connect)));
    }

    #[test]
    fn reconnect_failure_increments_attempt() {
        let (state, _) = LinkState::Reconnecting { attempt: 2 }.on_event(
            LinkEvent::ConnectFailed {
                error: "refused".into(),
            },
            &no_jitter(),
        );

        assert_eq!(state, LinkState::Reconnecting { attempt: 3 });
    }

    #[test]
    fn link_loss_triggers_reconnect_with_notice() {
        let (state, actions) = LinkState::Up.on_event(
            LinkEvent::LinkLost {
                reason: "connection reset".into(),
            },
            &no_jitter(),
        );

        assert_eq!(state, LinkState::Reconnecting { attempt: 1 });
        assert!(actions.iter().any(|a| matches!(
            a,
            LinkAction::Notify(LinkNotice::Down { reason }) if reason == "connection reset"
        )));
    }

    #[test]
    fn refresh_keeps_link_up_and_announces() {
        let (state, actions) = LinkState::Up.on_event(LinkEvent::RefreshTimer, &no_jitter());

        assert!(state.is_up());
        assert_eq!(actions, vec![LinkAction::SendAnnounce]);
    }

    #[test]
    fn recycle_reestablishes_healthy_link() {
        let (state, actions) = LinkState::Up.on_event(LinkEvent::RecycleTimer, &no_jitter());

        assert_eq!(state, LinkState::Connecting);
        assert_eq!(actions, vec![LinkAction::Disconnect, LinkAction::Connect]);
    }

    #[test]
    fn refresh_while_down_is_ignored() {
        let (state, actions) = LinkState::Down.on_event(LinkEvent::RefreshTimer, &no_jitter());
        assert_eq!(state, LinkState::Down);
        assert!(actions.is_empty());
    }

    #[test]
    fn teardown_from_up_disconnects() {
        let (state, actions) =
            LinkState::Up.on_event(LinkEvent::TeardownRequested, &no_jitter());

        assert_eq!(state, LinkState::Down);
        assert!(actions.iter().any(|a| matches!(a, LinkAction::Disconnect)));
    }

    #[test]
    fn teardown_while_reconnecting_cancels_timer() {
        let (state, actions) = LinkState::Reconnecting { attempt: 4 }
            .on_event(LinkEvent::TeardownRequested, &no_jitter());

        assert_eq!(state, LinkState::Down);
        assert!(actions
            .iter()
            .any(|a| matches!(a, LinkAction::CancelReconnect)));
    }

    #[test]
    fn full_reconnection_flow() {
        let state = LinkState::Reconnecting { attempt: 3 };

        let (state, _) = state.on_event(LinkEvent::ReconnectTimer, &no_jitter());
        assert_eq!(state, LinkState::Reconnecting { attempt: 3 });

        let (state, _) = state.on_event(LinkEvent::ConnectSucceeded, &no_jitter());
        assert!(state.is_up());
    }

    #[test]
    fn is_connecting_helper() {
        assert!(!LinkState::Down.is_connecting());
        assert!(LinkState::Connecting.is_connecting());
        assert!(!LinkState::Up.is_connecting());
        assert!(LinkState::Reconnecting { attempt: 1 }.is_connecting());
    }
}
