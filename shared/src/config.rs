use std::net::SocketAddr;

use crate::{
    error::{BenchError, Result},
    memory_region::MemoryKind,
    sweep::SizeSchedule,
};

pub const DEFAULT_PORT: u16 = 13337;
pub const DEFAULT_MAX_MSG_LOG: u32 = 23;
pub const DEFAULT_ITERATIONS: usize = 256;
pub const DEFAULT_WINDOW_DEPTH: usize = 64;

const MAX_MSG_LOG_LIMIT: u32 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accept one peer on `port`, then answer the sweep and print the results.
    Listener { port: u16 },
    /// Connect to `addr`, then drive the sweep.
    Connector { addr: SocketAddr },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MemoryType {
    #[default]
    Host,
    Cuda,
}

/// Everything one benchmark run needs, fixed before the run starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchConfig {
    pub role: Role,
    pub memory: MemoryType,
    /// Both peers share a node; the listener then moves to the second GPU.
    pub intra_node: bool,
    /// Sizes run from 2^0 to 2^(max_msg_log - 1).
    pub max_msg_log: u32,
    pub iterations: usize,
    pub window_depth: usize,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            role: Role::Listener { port: DEFAULT_PORT },
            memory: MemoryType::Host,
            intra_node: false,
            max_msg_log: DEFAULT_MAX_MSG_LOG,
            iterations: DEFAULT_ITERATIONS,
            window_depth: DEFAULT_WINDOW_DEPTH,
        }
    }
}

impl BenchConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_MSG_LOG_LIMIT).contains(&self.max_msg_log) {
            return Err(BenchError::InvalidArgument(format!(
                "max_msg_log must be within 1..={}, got {}",
                MAX_MSG_LOG_LIMIT, self.max_msg_log
            )));
        }

        if self.iterations == 0 {
            return Err(BenchError::InvalidArgument(
                "iterations must be non-zero".to_owned(),
            ));
        }

        if self.window_depth == 0 {
            return Err(BenchError::InvalidArgument(
                "window depth must be non-zero".to_owned(),
            ));
        }

        Ok(())
    }

    pub fn schedule(&self) -> SizeSchedule {
        SizeSchedule::new(self.max_msg_log)
    }

    /// A tenth of the measured repetitions, rounded up.
    pub fn warmup_iterations(&self) -> usize {
        self.iterations.div_ceil(10)
    }

    pub fn device_ordinal(&self) -> usize {
        match self.role {
            Role::Listener { .. } if self.intra_node => 1,
            _ => 0,
        }
    }

    pub fn memory_kind(&self) -> MemoryKind {
        match self.memory {
            MemoryType::Host => MemoryKind::Host,
            MemoryType::Cuda => MemoryKind::Device {
                ordinal: self.device_ordinal(),
            },
        }
    }
}
