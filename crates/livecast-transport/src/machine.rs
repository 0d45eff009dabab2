//! Pure connection state machine.
//!
//! Transport callbacks are translated into [`Input`]s; the machine answers
//! with the [`Action`]s the manager must perform. No I/O happens here, so
//! reconnection and renewal behaviour can be tested without a network.

use std::time::Duration;

use tracing::debug;

use crate::connection::{ConnectionState, ReconnectPolicy};

/// Something that happened to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// `start()` was called.
    Start,

    /// A join attempt (including publish/subscribe) completed.
    Joined,

    /// A join attempt failed.
    JoinFailed { retryable: bool, reason: String },

    /// The transport disconnected without `leave()` being called.
    ConnectionLost { reason: String },

    /// A scheduled rejoin is due.
    RetryDue,

    /// The transport signalled that the token will expire soon.
    TokenWillExpire,

    /// In-place renewal succeeded.
    RenewSucceeded,

    /// In-place renewal failed.
    RenewFailed { reason: String },

    /// The token expired before it was renewed.
    TokenExpired,

    /// `leave()` was called.
    Leave,
}

/// Work the manager must perform in response to an input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Acquire a fresh credential and join. Attempt 0 is the initial join.
    Join { attempt: u32 },

    /// Wait `delay`, then feed [`Input::RetryDue`].
    ScheduleRetry { attempt: u32, delay: Duration },

    /// Renew the credential in place.
    RenewToken,

    /// Drop the current channel link before rejoining. Tracks are kept.
    Teardown,

    /// Report the terminal failure to the caller.
    ReportFailed { reason: String },

    /// Leave the channel and release everything.
    Disconnect,
}

/// Connection state machine for one manager.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    policy: ReconnectPolicy,
    max_renew_failures: u32,
    renew_failures: u32,
    renewing: bool,
}

impl ConnectionMachine {
    pub fn new(policy: ReconnectPolicy, max_renew_failures: u32) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            policy,
            max_renew_failures: max_renew_failures.max(1),
            renew_failures: 0,
            renewing: false,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Consecutive renewal failures since the last success.
    pub fn renew_failures(&self) -> u32 {
        self.renew_failures
    }

    /// Apply an input and return the actions to perform.
    pub fn handle(&mut self, input: Input) -> Vec<Action> {
        let previous = self.state.clone();
        let actions = self.transition(input.clone());

        if previous != self.state {
            debug!(
                previous = %previous.name(),
                current = %self.state.name(),
                ?input,
                "Connection state transition"
            );
        }
        actions
    }

    fn transition(&mut self, input: Input) -> Vec<Action> {
        match (&self.state, input) {
            (ConnectionState::Disconnected | ConnectionState::Failed { .. }, Input::Start) => {
                self.reset_renewal();
                self.state = ConnectionState::Connecting;
                vec![Action::Join { attempt: 0 }]
            }
            (_, Input::Start) => Vec::new(),

            (ConnectionState::Connecting | ConnectionState::Reconnecting { .. }, Input::Joined) => {
                self.reset_renewal();
                self.state = ConnectionState::Connected;
                Vec::new()
            }
            // A join that completed after leave() must be undone.
            (ConnectionState::Disconnected, Input::Joined) => vec![Action::Disconnect],
            (_, Input::Joined) => Vec::new(),

            // The caller of start() gets the error and decides whether to retry.
            (ConnectionState::Connecting, Input::JoinFailed { .. }) => {
                self.state = ConnectionState::Disconnected;
                vec![Action::Teardown]
            }
            (
                ConnectionState::Reconnecting { attempt },
                Input::JoinFailed { retryable, reason },
            ) => {
                let attempt = *attempt;
                if retryable && self.policy.should_retry(attempt) {
                    let next = attempt + 1;
                    self.state = ConnectionState::Reconnecting { attempt: next };
                    vec![
                        Action::Teardown,
                        Action::ScheduleRetry {
                            attempt: next,
                            delay: self.policy.delay_for_attempt(next),
                        },
                    ]
                } else {
                    let reason = format!("Failed after {} attempts: {}", attempt, reason);
                    self.state = ConnectionState::Failed {
                        reason: reason.clone(),
                    };
                    vec![Action::Teardown, Action::ReportFailed { reason }]
                }
            }
            (_, Input::JoinFailed { .. }) => Vec::new(),

            (ConnectionState::Connected, Input::ConnectionLost { .. })
            | (ConnectionState::Connected, Input::TokenExpired) => self.begin_reconnect(),
            (_, Input::ConnectionLost { .. }) | (_, Input::TokenExpired) => Vec::new(),

            (ConnectionState::Reconnecting { attempt }, Input::RetryDue) => {
                vec![Action::Join { attempt: *attempt }]
            }
            (_, Input::RetryDue) => Vec::new(),

            (ConnectionState::Connected, Input::TokenWillExpire) if !self.renewing => {
                self.renewing = true;
                vec![Action::RenewToken]
            }
            (_, Input::TokenWillExpire) => Vec::new(),

            (_, Input::RenewSucceeded) => {
                self.reset_renewal();
                Vec::new()
            }
            (state, Input::RenewFailed { .. }) => {
                self.renewing = false;
                self.renew_failures += 1;
                if self.renew_failures >= self.max_renew_failures && state.is_connected() {
                    self.begin_reconnect()
                } else {
                    Vec::new()
                }
            }

            (ConnectionState::Disconnected, Input::Leave) => Vec::new(),
            (_, Input::Leave) => {
                self.reset_renewal();
                self.state = ConnectionState::Disconnected;
                vec![Action::Disconnect]
            }
        }
    }

    fn begin_reconnect(&mut self) -> Vec<Action> {
        self.reset_renewal();
        if !self.policy.should_retry(0) {
            let reason = "Reconnection disabled".to_string();
            self.state = ConnectionState::Failed {
                reason: reason.clone(),
            };
            return vec![Action::Teardown, Action::ReportFailed { reason }];
        }

        self.state = ConnectionState::Reconnecting { attempt: 1 };
        vec![
            Action::Teardown,
            Action::ScheduleRetry {
                attempt: 1,
                delay: self.policy.delay_for_attempt(1),
            },
        ]
    }

    fn reset_renewal(&mut self) {
        self.renew_failures = 0;
        self.renewing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(max_attempts: u32) -> ConnectionMachine {
        ConnectionMachine::new(
            ReconnectPolicy {
                max_attempts,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_millis(1_000),
            },
            2,
        )
    }

    fn connected(max_attempts: u32) -> ConnectionMachine {
        let mut m = machine(max_attempts);
        m.handle(Input::Start);
        m.handle(Input::Joined);
        m
    }

    fn retries(actions: &[Action]) -> usize {
        actions
            .iter()
            .filter(|a| matches!(a, Action::ScheduleRetry { .. }))
            .count()
    }

    #[test]
    fn start_joins_once() {
        let mut m = machine(3);
        assert_eq!(m.handle(Input::Start), vec![Action::Join { attempt: 0 }]);
        assert!(m.handle(Input::Start).is_empty());
        m.handle(Input::Joined);
        assert!(m.handle(Input::Start).is_empty());
        assert!(m.state().is_connected());
    }

    #[test]
    fn initial_join_failure_is_not_retried() {
        let mut m = machine(3);
        m.handle(Input::Start);
        let actions = m.handle(Input::JoinFailed {
            retryable: true,
            reason: "offline".into(),
        });

        assert_eq!(actions, vec![Action::Teardown]);
        assert_eq!(*m.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn connection_loss_backs_off_exponentially() {
        let mut m = connected(3);

        let actions = m.handle(Input::ConnectionLost {
            reason: "network".into(),
        });
        assert!(actions.contains(&Action::ScheduleRetry {
            attempt: 1,
            delay: Duration::from_millis(100),
        }));

        assert_eq!(m.handle(Input::RetryDue), vec![Action::Join { attempt: 1 }]);
        let actions = m.handle(Input::JoinFailed {
            retryable: true,
            reason: "network".into(),
        });
        assert!(actions.contains(&Action::ScheduleRetry {
            attempt: 2,
            delay: Duration::from_millis(200),
        }));

        m.handle(Input::RetryDue);
        m.handle(Input::Joined);
        assert!(m.state().is_connected());
    }

    #[test]
    fn exhausted_reconnect_reports_failure_once() {
        let mut m = connected(2);
        m.handle(Input::ConnectionLost {
            reason: "network".into(),
        });

        let mut reports = 0;
        for _ in 0..5 {
            m.handle(Input::RetryDue);
            let actions = m.handle(Input::JoinFailed {
                retryable: true,
                reason: "network".into(),
            });
            reports += actions
                .iter()
                .filter(|a| matches!(a, Action::ReportFailed { .. }))
                .count();
            m.handle(Input::ConnectionLost {
                reason: "network".into(),
            });
        }

        assert_eq!(reports, 1);
        assert!(m.state().is_failed());
    }

    #[test]
    fn non_retryable_rejoin_fails_immediately() {
        let mut m = connected(5);
        m.handle(Input::ConnectionLost {
            reason: "network".into(),
        });
        m.handle(Input::RetryDue);
        let actions = m.handle(Input::JoinFailed {
            retryable: false,
            reason: "permission denied".into(),
        });

        assert!(matches!(actions.last(), Some(Action::ReportFailed { .. })));
    }

    #[test]
    fn successful_renewals_never_rejoin() {
        let mut m = connected(3);
        for _ in 0..10 {
            assert_eq!(m.handle(Input::TokenWillExpire), vec![Action::RenewToken]);
            assert!(m.handle(Input::RenewSucceeded).is_empty());
        }
        assert!(m.state().is_connected());
    }

    #[test]
    fn two_renewal_failures_trigger_one_rejoin() {
        let mut m = connected(3);
        let mut scheduled = 0;

        m.handle(Input::TokenWillExpire);
        scheduled += retries(&m.handle(Input::RenewFailed {
            reason: "503".into(),
        }));
        assert!(m.state().is_connected());
        assert_eq!(m.renew_failures(), 1);

        m.handle(Input::TokenWillExpire);
        scheduled += retries(&m.handle(Input::RenewFailed {
            reason: "503".into(),
        }));

        assert_eq!(scheduled, 1);
        assert_eq!(*m.state(), ConnectionState::Reconnecting { attempt: 1 });
    }

    #[test]
    fn renewal_success_resets_failure_count() {
        let mut m = connected(3);
        m.handle(Input::TokenWillExpire);
        m.handle(Input::RenewFailed {
            reason: "503".into(),
        });
        m.handle(Input::TokenWillExpire);
        m.handle(Input::RenewSucceeded);
        m.handle(Input::TokenWillExpire);
        let actions = m.handle(Input::RenewFailed {
            reason: "503".into(),
        });

        assert!(actions.is_empty());
        assert!(m.state().is_connected());
    }

    #[test]
    fn token_expiry_escalates_immediately() {
        let mut m = connected(3);
        let actions = m.handle(Input::TokenExpired);
        assert_eq!(retries(&actions), 1);
    }

    #[test]
    fn leave_is_idempotent_and_cancels_reconnect() {
        let mut m = connected(3);
        m.handle(Input::ConnectionLost {
            reason: "network".into(),
        });

        assert_eq!(m.handle(Input::Leave), vec![Action::Disconnect]);
        assert!(m.handle(Input::Leave).is_empty());
        assert!(m.handle(Input::RetryDue).is_empty());
        assert_eq!(m.handle(Input::Joined), vec![Action::Disconnect]);
    }
}
