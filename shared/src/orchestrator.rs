use quanta::Clock;

use crate::{
    config::{BenchConfig, Role},
    error::Result,
    sweep::{BandwidthSweep, RecordSink},
    transport::{Endpoint, Transport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Listening,
    Connecting,
    Connected,
    Running,
    Closed,
}

impl State {
    fn can_become(self, next: State) -> bool {
        matches!(
            (self, next),
            (State::Idle, State::Listening)
                | (State::Idle, State::Connecting)
                | (State::Listening, State::Connected)
                | (State::Connecting, State::Connected)
                | (State::Connected, State::Running)
                | (State::Running, State::Closed)
        )
    }
}

/// Takes one process through exactly one role: establish the endpoint, run the sweep,
/// close the endpoint.
pub struct RoleOrchestrator<T: Transport> {
    config: BenchConfig,
    transport: T,
    clock: Clock,
    history: Vec<State>,
}

impl<T: Transport> RoleOrchestrator<T> {
    pub fn new(config: BenchConfig, transport: T) -> Self {
        Self::with_clock(config, transport, Clock::new())
    }

    pub fn with_clock(config: BenchConfig, transport: T, clock: Clock) -> Self {
        RoleOrchestrator {
            config,
            transport,
            clock,
            history: vec![State::Idle],
        }
    }

    pub fn state(&self) -> State {
        self.history.last().copied().unwrap_or(State::Idle)
    }

    /// Every state visited so far, starting with `Idle`.
    pub fn history(&self) -> &[State] {
        &self.history
    }

    fn enter(&mut self, next: State) {
        debug_assert!(
            self.state().can_become(next),
            "invalid transition {:?} -> {:?}",
            self.state(),
            next
        );
        tracing::info!(from = ?self.state(), to = ?next, "role state");
        self.history.push(next);
    }

    pub fn run(&mut self, sink: &mut dyn RecordSink) -> Result<()> {
        self.config.validate()?;

        let mut endpoint = match self.config.role {
            Role::Listener { port } => {
                self.enter(State::Listening);
                self.transport.accept(port)?
            }
            Role::Connector { addr } => {
                self.enter(State::Connecting);
                self.transport.connect(addr)?
            }
        };

        self.enter(State::Connected);
        tracing::info!(peer = %endpoint.peer(), "peer connected");

        self.enter(State::Running);

        let outcome = {
            let sweep = BandwidthSweep::new(&self.config, &self.clock);
            sweep.run(&mut self.transport, &mut endpoint, sink)
        };

        let closed = endpoint.close();
        self.enter(State::Closed);

        match (outcome, closed) {
            (Ok(reported), Ok(())) => {
                tracing::info!(sizes = reported, "sweep complete");
                Ok(())
            }
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(close_error)) => {
                tracing::warn!(
                    error = %close_error,
                    "failed to close endpoint after a failed sweep"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_role_paths_are_valid() {
        let listener = [
            State::Idle,
            State::Listening,
            State::Connected,
            State::Running,
            State::Closed,
        ];
        let connector = [
            State::Idle,
            State::Connecting,
            State::Connected,
            State::Running,
            State::Closed,
        ];

        for path in [listener, connector] {
            assert!(path.windows(2).all(|step| step[0].can_become(step[1])));
        }
    }

    #[test]
    fn closed_is_terminal() {
        for next in [
            State::Idle,
            State::Listening,
            State::Connecting,
            State::Connected,
            State::Running,
            State::Closed,
        ] {
            assert!(!State::Closed.can_become(next));
        }
        assert!(!State::Listening.can_become(State::Running));
    }
}
