//! Session timers
//!
//! Both timers hold only a weak reference to the session and re-check the
//! state when they fire, so a condition resolved in the meantime turns them
//! into no-ops.

use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, warn};

use super::UplinkSession;
use crate::state::{FatalErrorKind, Followup, SessionState};

impl UplinkSession {
    /// Force-close the session if the remote goodbye does not arrive in time
    pub(super) fn arm_goodbye_confirmation_timer(&self) {
        let session = self.downgrade();
        let timeout = self.inner.config.goodbye_confirmation_timeout();
        tokio::spawn(async move {
            sleep(timeout).await;
            let Some(inner) = session.upgrade() else {
                return;
            };
            let session = UplinkSession::from_inner(inner);
            if session.state() != SessionState::GoodbyeHandshake {
                return;
            }
            warn!(
                "[{}] No goodbye confirmation received within {} msec; closing the connection",
                session.log_descriptor(),
                timeout.as_millis()
            );
            if let Err(e) = session.close_outgoing_stream() {
                debug!(
                    "[{}] Failed to close after goodbye timeout: {}",
                    session.log_descriptor(),
                    e
                );
            }
        });
    }

    /// Periodically check for overdue heartbeat responses
    ///
    /// The watchdog ends when the session reaches a terminal state or is
    /// dropped. A missed response is treated as a broken connection.
    pub fn spawn_heartbeat_watchdog(&self) -> JoinHandle<()> {
        let session = self.downgrade();
        let period = self.inner.config.heartbeat_check_interval();
        let mut state_rx = self.inner.state.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = state_rx.changed() => {
                        if changed.is_err() || state_rx.borrow().is_terminal() {
                            break;
                        }
                        continue;
                    }
                }
                let Some(inner) = session.upgrade() else {
                    break;
                };
                let session = UplinkSession::from_inner(inner);
                if session.inner.state.is_in_terminal_state() {
                    break;
                }
                if session.inner.state.validate_heartbeat_response_if_expected()
                    == Followup::InitiateUncleanShutdown
                {
                    let error = format!(
                        "no heartbeat response within {} msec",
                        session.inner.config.heartbeat_response_timeout_ms
                    );
                    if let Err(e) =
                        session.handle_fatal_error(FatalErrorKind::LowLevelConnectionError, &error)
                    {
                        debug!(
                            "[{}] Failed to shut down after missed heartbeat: {}",
                            session.log_descriptor(),
                            e
                        );
                    }
                    break;
                }
            }
        })
    }
}
