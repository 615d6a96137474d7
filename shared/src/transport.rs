use std::{io, net::SocketAddr};

use crate::{
    error::Result,
    memory_region::{MemoryKind, MemoryRegion, RegionSlice},
};

pub use self::work_completion::{CompletionStatus, Opcode, WorkCompletion};

pub mod loopback;
pub mod tcp;
#[cfg(feature = "verbs")]
pub mod verbs;
pub mod work_completion;

/// A pending send or receive. Completes exactly once, as a `WorkCompletion` with the same
/// `wr_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOperation {
    pub wr_id: u64,
    pub opcode: Opcode,
    pub len: usize,
}

/// Connection establishment and memory management of the underlying transport.
pub trait Transport {
    type Endpoint: Endpoint;

    fn allocate(&mut self, kind: MemoryKind, capacity: usize) -> Result<MemoryRegion> {
        MemoryRegion::allocate(kind, capacity)
    }

    fn release(&mut self, region: MemoryRegion) -> Result<()> {
        region.release()
    }

    /// Block until exactly one peer connects on `port`.
    fn accept(&mut self, port: u16) -> Result<Self::Endpoint>;

    fn connect(&mut self, addr: SocketAddr) -> Result<Self::Endpoint>;
}

/// One side of an established connection.
///
/// Posting never blocks; completions are produced by `poll`, which is also what drives
/// the transport forward.
pub trait Endpoint {
    /// # Safety
    ///
    /// The region behind `region` must stay allocated until the operation completes or the
    /// endpoint is closed.
    unsafe fn post_send(&mut self, region: RegionSlice) -> Result<TransferOperation>;

    /// # Safety
    ///
    /// Same as `post_send`; additionally nothing else may read or write the viewed bytes
    /// until the operation completes.
    unsafe fn post_recv(&mut self, region: RegionSlice) -> Result<TransferOperation>;

    /// Make progress and append finished operations to `completions`.
    ///
    /// An `Err` means the endpoint itself is unusable; a failed operation is reported as a
    /// completion with a failed status instead.
    fn poll(&mut self, completions: &mut Vec<WorkCompletion>) -> io::Result<()>;

    /// Number of posted operations that have not completed yet.
    fn outstanding(&self) -> usize;

    fn peer(&self) -> String;

    /// Terminate the connection. Callers wait for all outstanding operations first.
    fn close(self) -> Result<()>
    where
        Self: Sized;
}
