pub mod config;
pub mod error;
pub mod memory_region;
pub mod orchestrator;
pub mod sweep;
pub mod transfer_loop;
pub mod transport;
pub mod window;

pub use config::{BenchConfig, MemoryType, Role};
pub use error::{BenchError, Result};
pub use memory_region::{MemoryKind, MemoryRegion};
pub use orchestrator::{RoleOrchestrator, State};
pub use sweep::{BandwidthSweep, RecordSink, SizeResult, SizeSchedule};
pub use transport::{Endpoint, Transport};
