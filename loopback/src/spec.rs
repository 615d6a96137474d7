use std::{
    net::{Ipv4Addr, SocketAddr},
    num::NonZeroUsize,
};

use bibw_shared::{config::DEFAULT_PORT, BenchConfig, MemoryType, Role};
use clap::{arg, command, Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MemType {
    Host,
    Cuda,
}

/// Runs the listener and the connector on two threads of this process.
#[derive(Parser, Debug, Clone, Copy)]
#[command(version, about, long_about = None)]
pub struct Spec {
    #[arg(short, long, value_enum, default_value_t = MemType::Host)]
    pub mem_type: MemType,
    #[arg(long, default_value = "64")]
    pub iterations: NonZeroUsize,
    #[arg(long, default_value = "64")]
    pub window_size: NonZeroUsize,
    #[arg(long, default_value_t = 20)]
    pub max_msg_log: u32,
}

impl Spec {
    fn config(&self, role: Role) -> BenchConfig {
        BenchConfig {
            role,
            memory: match self.mem_type {
                MemType::Host => MemoryType::Host,
                MemType::Cuda => MemoryType::Cuda,
            },
            // both halves share the one GPU of this process
            intra_node: false,
            max_msg_log: self.max_msg_log,
            iterations: self.iterations.get(),
            window_depth: self.window_size.get(),
        }
    }

    pub fn listener(&self) -> BenchConfig {
        self.config(Role::Listener { port: DEFAULT_PORT })
    }

    /// The address is never dialed; the in-process link ignores it.
    pub fn connector(&self) -> BenchConfig {
        self.config(Role::Connector {
            addr: SocketAddr::new(Ipv4Addr::LOCALHOST.into(), DEFAULT_PORT),
        })
    }
}
