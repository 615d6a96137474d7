use std::time::Duration;

use quanta::Clock;

use crate::{
    config::BenchConfig, error::Result, memory_region::MemoryRegion, transport::Endpoint,
    window::Window,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Warmup,
    Measure,
}

/// Repeats full windows at one message size, one barrier per repetition.
#[derive(Debug, Clone, Copy)]
pub struct TransferLoop<'c> {
    clock: &'c Clock,
    warmup: usize,
    iterations: usize,
    window_depth: usize,
}

impl<'c> TransferLoop<'c> {
    pub fn new(clock: &'c Clock, config: &BenchConfig) -> Self {
        TransferLoop {
            clock,
            warmup: config.warmup_iterations(),
            iterations: config.iterations,
            window_depth: config.window_depth,
        }
    }

    pub fn repetitions(&self, phase: Phase) -> usize {
        match phase {
            Phase::Warmup => self.warmup,
            Phase::Measure => self.iterations,
        }
    }

    /// Run every repetition of `phase` and return the wall-clock time they took.
    pub fn run<E: Endpoint>(
        &self,
        phase: Phase,
        endpoint: &mut E,
        send: &MemoryRegion,
        recv: &mut MemoryRegion,
        len: usize,
    ) -> Result<Duration> {
        let repetitions = self.repetitions(phase);

        let begin = self.clock.now();

        for _ in 0..repetitions {
            Window::issue(endpoint, send, recv, len, self.window_depth)?.wait()?;
        }

        let elapsed = self.clock.now() - begin;

        tracing::trace!(?phase, len, repetitions, ?elapsed, "phase finished");

        Ok(elapsed)
    }

    pub fn warmup<E: Endpoint>(
        &self,
        endpoint: &mut E,
        send: &MemoryRegion,
        recv: &mut MemoryRegion,
        len: usize,
    ) -> Result<()> {
        self.run(Phase::Warmup, endpoint, send, recv, len).map(|_| ())
    }

    pub fn measure<E: Endpoint>(
        &self,
        endpoint: &mut E,
        send: &MemoryRegion,
        recv: &mut MemoryRegion,
        len: usize,
    ) -> Result<Duration> {
        self.run(Phase::Measure, endpoint, send, recv, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repetitions(iterations: usize, phase: Phase) -> usize {
        let clock = Clock::new();
        let config = BenchConfig {
            iterations,
            ..Default::default()
        };
        TransferLoop::new(&clock, &config).repetitions(phase)
    }

    #[test]
    fn warmup_is_a_tenth_rounded_up() {
        assert_eq!(repetitions(256, Phase::Warmup), 26);
        assert_eq!(repetitions(256, Phase::Measure), 256);
        assert_eq!(repetitions(5, Phase::Warmup), 1);
    }
}
