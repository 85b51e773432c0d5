//! Session lifecycle state machine.
//!
//! Transitions follow the fixed graph below; every edge taken is recorded in
//! the event queue so the application observes each state distinctly, never a
//! collapsed jump. Headset-driven transitions advance at most one edge per
//! [`StateMachine::update_from_status`] call and only while the application
//! has drained the queue, which is what keeps the ordering discipline.
//!
//! ```text
//! UNKNOWN -> IDLE -> READY -> SYNCHRONIZED <-> VISIBLE <-> FOCUSED
//!                                  |               |          |
//!                                  +---------- STOPPING <-----+
//! any state -> LOSS_PENDING on disconnect
//! ```

use {
    crate::{
        backend::HmdStatus,
        error::{RuntimeError, RuntimeResult},
    },
    log::debug,
    openxr_sys as sys,
    std::collections::VecDeque,
};

/// One queued `XrEventDataSessionStateChanged`, timestamped in backend time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StateEvent {
    pub state: sys::SessionState,
    pub time: f64,
}

/// The 8-state session lifecycle plus its pending event queue.
#[derive(Debug)]
pub struct StateMachine {
    state: sys::SessionState,
    queue: VecDeque<StateEvent>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: sys::SessionState::UNKNOWN,
            queue: VecDeque::new(),
        }
    }

    /// The most recent state entered (which the application may not have
    /// polled yet).
    pub fn state(&self) -> sys::SessionState {
        self.state
    }

    /// Whether events are waiting to be polled.
    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    fn transition(&mut self, to: sys::SessionState, now: f64) {
        if self.state == to {
            return;
        }

        debug!("session state {:?} -> {:?}", self.state, to);

        self.state = to;
        self.queue.push_back(StateEvent { state: to, time: now });
    }

    /// `xrCreateSession` entered the lifecycle.
    pub fn on_create(&mut self, now: f64) {
        self.transition(sys::SessionState::IDLE, now);
    }

    /// `xrBeginSession`.
    pub fn on_begin(&mut self, now: f64) -> RuntimeResult<()> {
        if self.state != sys::SessionState::IDLE && self.state != sys::SessionState::READY {
            return Err(RuntimeError::SessionNotReady);
        }

        self.transition(sys::SessionState::SYNCHRONIZED, now);

        Ok(())
    }

    /// `xrEndSession`.
    pub fn on_end(&mut self, now: f64) -> RuntimeResult<()> {
        if self.state != sys::SessionState::STOPPING {
            return Err(RuntimeError::SessionNotStopping);
        }

        self.transition(sys::SessionState::IDLE, now);

        Ok(())
    }

    /// `xrRequestExitSession`.
    pub fn on_request_exit(&mut self, now: f64) -> RuntimeResult<()> {
        if !matches!(
            self.state,
            sys::SessionState::SYNCHRONIZED
                | sys::SessionState::VISIBLE
                | sys::SessionState::FOCUSED
        ) {
            return Err(RuntimeError::SessionNotRunning);
        }

        self.transition(sys::SessionState::STOPPING, now);

        Ok(())
    }

    /// Headset disconnect; terminal until the session is recreated.
    pub fn lose(&mut self, now: f64) {
        self.transition(sys::SessionState::LOSS_PENDING, now);
    }

    /// Steps the visibility-driven part of the graph from a status poll and
    /// reports whether the application should render this frame.
    ///
    /// At most one edge advances per call, and only while the application
    /// has seen every previously emitted state.
    pub fn update_from_status(&mut self, status: &HmdStatus, now: f64) -> bool {
        let drained = !self.has_pending();

        if status.is_visible {
            if drained {
                match self.state {
                    sys::SessionState::SYNCHRONIZED => {
                        self.transition(sys::SessionState::VISIBLE, now)
                    }
                    sys::SessionState::VISIBLE if status.hmd_mounted => {
                        self.transition(sys::SessionState::FOCUSED, now)
                    }
                    sys::SessionState::FOCUSED if !status.hmd_mounted => {
                        self.transition(sys::SessionState::VISIBLE, now)
                    }
                    _ => (),
                }
            }

            self.state.into_raw() >= sys::SessionState::VISIBLE.into_raw()
        } else {
            if drained {
                match self.state {
                    sys::SessionState::FOCUSED => self.transition(sys::SessionState::VISIBLE, now),
                    sys::SessionState::VISIBLE => {
                        self.transition(sys::SessionState::SYNCHRONIZED, now)
                    }
                    _ => (),
                }
            }

            false
        }
    }

    /// Pops the next queued state event. When delivering IDLE while the
    /// headset is usable, READY is queued behind it so the application can
    /// begin the session.
    pub fn pop_event(&mut self, hmd_ready: bool, now: f64) -> Option<StateEvent> {
        let event = self.queue.pop_front()?;

        if event.state == sys::SessionState::IDLE
            && self.state == sys::SessionState::IDLE
            && hmd_ready
        {
            self.transition(sys::SessionState::READY, now);
        }

        Some(event)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn visible_status(mounted: bool) -> HmdStatus {
        HmdStatus {
            service_ready: true,
            hmd_present: true,
            hmd_mounted: mounted,
            is_visible: true,
            ..Default::default()
        }
    }

    fn drain(machine: &mut StateMachine) -> Vec<sys::SessionState> {
        let mut states = Vec::new();

        while let Some(event) = machine.pop_event(true, 0.0) {
            states.push(event.state);
        }

        states
    }

    #[test]
    pub fn idle_emits_ready_when_polled() {
        let mut machine = StateMachine::new();
        machine.on_create(1.0);

        let first = machine.pop_event(true, 1.5).unwrap();

        assert_eq!(first.state, sys::SessionState::IDLE);
        assert_eq!(
            machine.pop_event(true, 1.5).unwrap().state,
            sys::SessionState::READY
        );
        assert!(machine.pop_event(true, 1.5).is_none());
    }

    #[test]
    pub fn full_ascent_one_step_per_wait() {
        let mut machine = StateMachine::new();
        machine.on_create(0.0);
        drain(&mut machine);
        machine.on_begin(0.0).unwrap();
        drain(&mut machine);

        assert_eq!(machine.state(), sys::SessionState::SYNCHRONIZED);

        // Still pending: no advance happens until the app polls.
        machine.update_from_status(&visible_status(true), 1.0);
        assert_eq!(machine.state(), sys::SessionState::VISIBLE);

        // VISIBLE has not been polled yet; FOCUSED must wait.
        machine.update_from_status(&visible_status(true), 2.0);
        assert_eq!(machine.state(), sys::SessionState::VISIBLE);

        drain(&mut machine);
        machine.update_from_status(&visible_status(true), 3.0);
        assert_eq!(machine.state(), sys::SessionState::FOCUSED);
    }

    #[test]
    pub fn every_emitted_state_is_one_edge_apart() {
        let mut machine = StateMachine::new();
        machine.on_create(0.0);
        machine.on_begin(0.0).unwrap();

        for i in 0..4 {
            machine.update_from_status(&visible_status(true), i as f64);
            drain(&mut machine);
        }

        machine.update_from_status(&visible_status(false), 10.0);
        drain(&mut machine);
        machine.update_from_status(
            &HmdStatus {
                is_visible: false,
                ..visible_status(false)
            },
            11.0,
        );

        // FOCUSED retreats through VISIBLE, never jumping to SYNCHRONIZED.
        assert_eq!(machine.state(), sys::SessionState::VISIBLE);
    }

    #[test]
    pub fn unmount_retreats_to_visible() {
        let mut machine = StateMachine::new();
        machine.on_create(0.0);
        machine.on_begin(0.0).unwrap();
        drain(&mut machine);

        machine.update_from_status(&visible_status(true), 1.0);
        drain(&mut machine);
        machine.update_from_status(&visible_status(true), 2.0);
        drain(&mut machine);
        assert_eq!(machine.state(), sys::SessionState::FOCUSED);

        machine.update_from_status(&visible_status(false), 3.0);
        assert_eq!(machine.state(), sys::SessionState::VISIBLE);
    }

    #[test]
    pub fn begin_requires_ready() {
        let mut machine = StateMachine::new();

        assert_eq!(machine.on_begin(0.0), Err(RuntimeError::SessionNotReady));
    }

    #[test]
    pub fn end_requires_stopping() {
        let mut machine = StateMachine::new();
        machine.on_create(0.0);

        assert_eq!(machine.on_end(0.0), Err(RuntimeError::SessionNotStopping));
    }

    #[test]
    pub fn exit_stop_end_cycle() {
        let mut machine = StateMachine::new();
        machine.on_create(0.0);
        machine.on_begin(0.0).unwrap();

        machine.on_request_exit(0.0).unwrap();
        assert_eq!(machine.state(), sys::SessionState::STOPPING);
        machine.on_end(1.0).unwrap();
        assert_eq!(machine.state(), sys::SessionState::IDLE);
    }

    #[test]
    pub fn loss_is_reachable_from_any_state() {
        let mut machine = StateMachine::new();
        machine.on_create(0.0);
        machine.lose(1.0);

        assert_eq!(machine.state(), sys::SessionState::LOSS_PENDING);
        assert_eq!(machine.on_begin(2.0), Err(RuntimeError::SessionNotReady));
    }
}
