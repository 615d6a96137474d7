use std::{
    net::{IpAddr, SocketAddr},
    num::{NonZeroI32, NonZeroUsize},
};

use bibw_shared::{
    config::{DEFAULT_MAX_MSG_LOG, DEFAULT_PORT},
    BenchConfig, MemoryType, Role,
};
use clap::{arg, command, Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MemType {
    Host,
    Cuda,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    Tcp,
    Verbs,
}

/// Windowed bidirectional bandwidth benchmark. Start the listener first, then point the
/// connector at it with `--server`.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct GlobalArgs {
    /// Listener address; connects to it instead of listening
    #[arg(short, long)]
    pub server: Option<IpAddr>,
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,
    /// Both processes share a node; the listener uses the second GPU
    #[arg(short, long)]
    pub intra_node: bool,
    #[arg(short, long, value_enum, default_value_t = MemType::Host)]
    pub mem_type: MemType,
    #[arg(short, long, value_enum, default_value_t = TransportKind::Tcp)]
    pub transport: TransportKind,
    #[arg(short, long, default_value = "mlx5_0")]
    pub dev: String,
    #[arg(short, long)]
    pub gid_index: Option<NonZeroI32>,
    /// Extra attempts when the listener is not up yet, 100 ms apart
    #[arg(long, default_value_t = 50)]
    pub connect_retries: u32,
    #[arg(long, default_value = "256")]
    pub iterations: NonZeroUsize,
    #[arg(long, default_value = "64")]
    pub window_size: NonZeroUsize,
    /// Sizes run from 1 byte up to 2^(max_msg_log - 1) bytes
    #[arg(long, default_value_t = DEFAULT_MAX_MSG_LOG)]
    pub max_msg_log: u32,
}

impl GlobalArgs {
    pub fn role(&self) -> Role {
        match self.server {
            Some(ip) => Role::Connector {
                addr: SocketAddr::new(ip, self.port),
            },
            None => Role::Listener { port: self.port },
        }
    }

    pub fn bench_config(&self) -> BenchConfig {
        BenchConfig {
            role: self.role(),
            memory: match self.mem_type {
                MemType::Host => MemoryType::Host,
                MemType::Cuda => MemoryType::Cuda,
            },
            intra_node: self.intra_node,
            max_msg_log: self.max_msg_log,
            iterations: self.iterations.get(),
            window_depth: self.window_size.get(),
        }
    }
}
