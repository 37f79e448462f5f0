//! Named lifecycle states shared by [`Fox`](crate::Fox) and [`Client`](crate::Client).
//!
//! Every state gets a transition method (`running()`) and a predicate
//! (`is_running()`) on [`StateMachine`]. Transitions are not validated: any
//! state may follow any other. Moves outside the nominal lifecycle are
//! reported at `warn` so they show up in logs without failing the caller.

use std::fmt;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Initialized,
    Starting,
    Started,
    Running,
    Paused,
    Stopping,
    Stopped,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Initialized => "initialized",
            State::Starting => "starting",
            State::Started => "started",
            State::Running => "running",
            State::Paused => "paused",
            State::Stopping => "stopping",
            State::Stopped => "stopped",
        }
    }

    /// Whether `self -> to` is part of the nominal consumer/client lifecycle.
    pub fn is_expected_transition(self, to: State) -> bool {
        use State::*;
        matches!(
            (self, to),
            (Initialized, Starting)
                | (Initialized, Stopping)
                | (Starting, Started)
                | (Starting, Running)
                | (Starting, Stopping)
                | (Started, Stopping)
                | (Running, Paused)
                | (Running, Stopping)
                | (Paused, Running)
                | (Paused, Stopping)
                | (Stopping, Stopped)
        )
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct StateMachine {
    state: State,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: State::Initialized,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is(&self, state: State) -> bool {
        self.state == state
    }

    /// Moves into `to`, returning the previous state.
    pub fn transition(&mut self, to: State) -> State {
        let from = self.state;
        if from != to && !from.is_expected_transition(to) {
            warn!(%from, %to, "unexpected state transition");
        }
        self.state = to;
        from
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! states {
    ($($variant:ident => $enter:ident, $query:ident;)*) => {
        impl StateMachine {
            $(
                pub fn $enter(&mut self) -> State {
                    self.transition(State::$variant)
                }

                pub fn $query(&self) -> bool {
                    self.is(State::$variant)
                }
            )*
        }
    };
}

states! {
    Initialized => initialized, is_initialized;
    Starting => starting, is_starting;
    Started => started, is_started;
    Running => running, is_running;
    Paused => paused, is_paused;
    Stopping => stopping, is_stopping;
    Stopped => stopped, is_stopped;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_initialized() {
        let machine = StateMachine::new();
        assert!(machine.is_initialized());
        assert!(!machine.is_running());
    }

    #[test]
    fn generated_pairs_transition_and_query() {
        let mut machine = StateMachine::new();
        assert_eq!(machine.starting(), State::Initialized);
        machine.running();
        assert!(machine.is_running());
        assert!(!machine.is_starting());
        machine.stopped();
        assert!(machine.is_stopped());
        assert!(!machine.is_running());
    }

    #[test]
    fn any_transition_is_permitted() {
        let mut machine = StateMachine::new();
        machine.stopped();
        // stopped -> running is outside the lifecycle but still applied
        machine.running();
        assert_eq!(machine.state(), State::Running);
    }

    #[test]
    fn nominal_lifecycle() {
        assert!(State::Running.is_expected_transition(State::Paused));
        assert!(State::Paused.is_expected_transition(State::Running));
        assert!(!State::Stopped.is_expected_transition(State::Running));
        assert!(!State::Initialized.is_expected_transition(State::Paused));
    }
}
