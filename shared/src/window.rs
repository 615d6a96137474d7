//! A window of concurrently outstanding send/receive pairs and the barrier that waits for it.

use std::{collections::HashMap, hint::spin_loop, marker::PhantomData};

use crate::{
    error::{BenchError, Result},
    memory_region::MemoryRegion,
    transport::{CompletionStatus, Endpoint, TransferOperation, WorkCompletion},
};

/// Operations issued together over one pair of regions.
///
/// The window borrows both regions for as long as its operations may be in flight, so they
/// cannot be released or touched until `wait` returns.
pub struct Window<'a, E: Endpoint> {
    endpoint: &'a mut E,
    operations: Vec<TransferOperation>,
    len: usize,
    _regions: PhantomData<(&'a MemoryRegion, &'a mut MemoryRegion)>,
}

impl<'a, E: Endpoint> Window<'a, E> {
    /// Post `depth` sends and `depth` receives of `len` bytes, interleaved send-then-receive.
    ///
    /// Lengths are checked before anything is posted.
    pub fn issue(
        endpoint: &'a mut E,
        send: &'a MemoryRegion,
        recv: &'a mut MemoryRegion,
        len: usize,
        depth: usize,
    ) -> Result<Self> {
        let send_slice = send.slice(len)?;
        let recv_slice = recv.slice_mut(len)?;

        let mut operations = Vec::with_capacity(depth * 2);

        for _ in 0..depth {
            // both regions are borrowed by the window until the barrier returns
            unsafe {
                operations.push(endpoint.post_send(send_slice)?);
                operations.push(endpoint.post_recv(recv_slice)?);
            }
        }

        tracing::trace!(len, depth, "window issued");

        Ok(Window {
            endpoint,
            operations,
            len,
            _regions: PhantomData,
        })
    }

    pub fn operations(&self) -> &[TransferOperation] {
        &self.operations
    }

    /// Block until every operation in the window has completed.
    pub fn wait(self) -> Result<Vec<WorkCompletion>> {
        wait_all(self.endpoint, &self.operations).map_err(|e| match e {
            BenchError::Transfer { reason, .. } => BenchError::Transfer {
                size: self.len,
                reason,
            },
            other => other,
        })
    }
}

/// Poll `endpoint` until every operation in `operations` has completed and return the
/// completions in issue order. Stops at the first failed completion.
pub fn wait_all<E: Endpoint + ?Sized>(
    endpoint: &mut E,
    operations: &[TransferOperation],
) -> Result<Vec<WorkCompletion>> {
    let mut pending: HashMap<u64, usize> = operations
        .iter()
        .enumerate()
        .map(|(index, op)| (op.wr_id, index))
        .collect();

    let mut finished: Vec<Option<WorkCompletion>> = vec![None; operations.len()];
    let mut polled = Vec::with_capacity(operations.len());

    while !pending.is_empty() {
        endpoint.poll(&mut polled).map_err(|e| BenchError::Transfer {
            size: operations.first().map_or(0, |op| op.len),
            reason: format!("endpoint {} failed: {}", endpoint.peer(), e),
        })?;

        if polled.is_empty() {
            spin_loop();
            continue;
        }

        for wc in polled.drain(..) {
            let Some(index) = pending.remove(&wc.wr_id) else {
                tracing::trace!(wr_id = wc.wr_id, "completion outside the window");
                continue;
            };

            let op = &operations[index];

            if let CompletionStatus::Failed(reason) = &wc.status {
                return Err(BenchError::Transfer {
                    size: op.len,
                    reason: format!("{} wr {}: {}", op.opcode, op.wr_id, reason),
                });
            }

            finished[index] = Some(wc);
        }
    }

    Ok(finished.into_iter().flatten().collect())
}
