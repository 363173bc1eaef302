//! Playback state machine
//!
//! Validates every transition of a single playback session against the
//! allow-list in [`PlayerState::can_transition_to`] and owns the stall timer:
//! entering `Buffering` arms a one-shot deadline, leaving it disarms it, and
//! the deadline firing while still buffering forces `Stalled`.

use crate::{config::StateMachineConfig, types::PlayerState, Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const OBSERVER_CAPACITY: usize = 64;

/// A committed transition, delivered to observers as `(new, previous)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub state: PlayerState,
    pub previous: PlayerState,
}

/// Validated lifecycle of one playback session
#[derive(Debug)]
pub struct PlaybackStateMachine {
    state: PlayerState,
    stall_timeout: Duration,
    stall_deadline: Option<Instant>,
    entered_at: Instant,
    observers: Option<broadcast::Sender<StateChange>>,
}

impl PlaybackStateMachine {
    pub fn new(config: &StateMachineConfig) -> Self {
        let (tx, _) = broadcast::channel(OBSERVER_CAPACITY);
        Self {
            state: PlayerState::Idle,
            stall_timeout: config.stall_timeout(),
            stall_deadline: None,
            entered_at: Instant::now(),
            observers: Some(tx),
        }
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    /// Time spent in the current state
    pub fn time_in_state(&self) -> Duration {
        self.entered_at.elapsed()
    }

    pub fn can_transition(&self, to: PlayerState) -> bool {
        self.state.can_transition_to(to)
    }

    /// Subscribe to committed transitions.
    ///
    /// The channel closes when the machine is destroyed.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<StateChange>> {
        self.observers.as_ref().map(|tx| tx.subscribe())
    }

    /// Apply a transition, rejecting edges outside the allow-list
    pub fn transition(&mut self, to: PlayerState) -> Result<StateChange> {
        let from = self.state;
        if !from.can_transition_to(to) {
            warn!(from = %from, to = %to, "Rejected state transition");
            return Err(Error::InvalidStateTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        Ok(self.commit(to))
    }

    /// Force the machine back to `Idle`
    pub fn reset(&mut self) -> StateChange {
        self.commit(PlayerState::Idle)
    }

    /// Deadline of the armed stall timer
    pub fn stall_deadline(&self) -> Option<Instant> {
        self.stall_deadline
    }

    /// Fire the stall timer if it is due.
    ///
    /// Returns the `Buffering -> Stalled` change when the deadline has passed
    /// and the session never left `Buffering`.
    pub fn on_stall_timer(&mut self, now: Instant) -> Option<StateChange> {
        let deadline = self.stall_deadline?;
        if now < deadline {
            return None;
        }
        self.stall_deadline = None;
        if self.state != PlayerState::Buffering {
            return None;
        }
        info!(waited_ms = self.stall_timeout.as_millis() as u64, "Buffering stalled");
        Some(self.commit(PlayerState::Stalled))
    }

    /// Drop all observers and disarm the timer
    pub fn destroy(&mut self) {
        self.stall_deadline = None;
        self.observers = None;
    }

    fn commit(&mut self, to: PlayerState) -> StateChange {
        let change = StateChange {
            state: to,
            previous: self.state,
        };
        self.state = to;
        self.entered_at = Instant::now();

        if to == PlayerState::Buffering {
            self.stall_deadline = Some(self.entered_at + self.stall_timeout);
        } else {
            self.stall_deadline = None;
        }

        if let Some(tx) = &self.observers {
            let _ = tx.send(change);
        }

        debug!(from = %change.previous, to = %to, "State transition");
        change
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine_in(state: PlayerState) -> PlaybackStateMachine {
        let mut machine = PlaybackStateMachine::new(&StateMachineConfig::default());
        machine.commit(state);
        machine
    }

    #[test]
    fn test_all_pairs_follow_table() {
        for from in PlayerState::ALL {
            for to in PlayerState::ALL {
                let mut machine = machine_in(from);
                let result = machine.transition(to);
                if from.can_transition_to(to) {
                    assert!(result.is_ok(), "{from} -> {to} should pass");
                    assert_eq!(machine.state(), to);
                } else {
                    assert!(result.is_err(), "{from} -> {to} should be rejected");
                    assert_eq!(machine.state(), from);
                }
            }
        }
    }

    #[test]
    fn test_observers_receive_new_and_previous() {
        let mut machine = PlaybackStateMachine::new(&StateMachineConfig::default());
        let mut rx = machine.subscribe().unwrap();

        machine.transition(PlayerState::Loading).unwrap();
        machine.transition(PlayerState::Ready).unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            StateChange { state: PlayerState::Loading, previous: PlayerState::Idle }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            StateChange { state: PlayerState::Ready, previous: PlayerState::Loading }
        );
    }

    #[test]
    fn test_destroy_closes_observers() {
        let mut machine = PlaybackStateMachine::new(&StateMachineConfig::default());
        let mut rx = machine.subscribe().unwrap();
        machine.destroy();
        assert!(matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Closed)));
        assert!(machine.subscribe().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffering_past_timeout_stalls() {
        let mut machine = machine_in(PlayerState::Playing);
        machine.transition(PlayerState::Buffering).unwrap();
        let deadline = machine.stall_deadline().unwrap();

        tokio::time::advance(Duration::from_millis(2_999)).await;
        assert!(machine.on_stall_timer(Instant::now()).is_none());
        assert_eq!(machine.state(), PlayerState::Buffering);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(Instant::now() >= deadline);
        let change = machine.on_stall_timer(Instant::now()).unwrap();
        assert_eq!(change.state, PlayerState::Stalled);
        assert_eq!(change.previous, PlayerState::Buffering);
        assert!(machine.stall_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_leaving_buffering_disarms_timer() {
        let mut machine = machine_in(PlayerState::Playing);
        machine.transition(PlayerState::Buffering).unwrap();

        tokio::time::advance(Duration::from_secs(1)).await;
        machine.transition(PlayerState::Playing).unwrap();
        assert!(machine.stall_deadline().is_none());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(machine.on_stall_timer(Instant::now()).is_none());
        assert_eq!(machine.state(), PlayerState::Playing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reentering_buffering_rearms_timer() {
        let mut machine = machine_in(PlayerState::Playing);
        machine.transition(PlayerState::Buffering).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        machine.transition(PlayerState::Playing).unwrap();
        machine.transition(PlayerState::Buffering).unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(machine.on_stall_timer(Instant::now()).is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(machine.on_stall_timer(Instant::now()).is_some());
    }
}
