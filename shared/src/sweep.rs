use std::{
    io::{self, Write},
    time::Duration,
};

use quanta::Clock;

use crate::{
    config::{BenchConfig, Role},
    error::Result,
    memory_region::{MemoryKind, MemoryRegion},
    transfer_loop::TransferLoop,
    transport::{Endpoint, Transport},
};

pub const REPORT_HEADER: &str = "Size (bytes)\t\tBi-Bandwidth (GB/s)";

/// Message sizes 2^0, 2^1, ..., 2^(max_log - 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeSchedule {
    max_log: u32,
}

impl SizeSchedule {
    pub fn new(max_log: u32) -> Self {
        SizeSchedule { max_log }
    }

    pub fn sizes(&self) -> impl Iterator<Item = usize> {
        (0..self.max_log).map(|exp| 1usize << exp)
    }

    pub fn len(&self) -> usize {
        self.max_log as usize
    }

    pub fn is_empty(&self) -> bool {
        self.max_log == 0
    }

    pub fn max_size(&self) -> usize {
        self.sizes().last().unwrap_or(0)
    }
}

/// `pairs * size * 2` bytes moved in `elapsed`, in GB/s (10^9 bytes per second).
pub fn bandwidth_gbps(pairs: usize, size: usize, elapsed: Duration) -> f64 {
    (pairs as f64 * size as f64 * 2.0) / elapsed.as_secs_f64() / 1e9
}

/// Outcome of the measured phase at one message size.
#[derive(Debug, Clone, PartialEq)]
pub struct SizeResult {
    pub size: usize,
    pub elapsed: Duration,
    pub bandwidth_gbps: f64,
    pub one_way_latency_us: f64,
}

impl SizeResult {
    pub fn new(size: usize, iterations: usize, window_depth: usize, elapsed: Duration) -> Self {
        SizeResult {
            size,
            elapsed,
            bandwidth_gbps: bandwidth_gbps(iterations * window_depth, size, elapsed),
            one_way_latency_us: elapsed.as_secs_f64() / 2.0 / iterations as f64 * 1e6,
        }
    }
}

/// Destination of sweep results, fed in ascending size order.
pub trait RecordSink {
    /// Called once, after the regions exist and before the first size runs.
    fn begin(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn record(&mut self, result: &SizeResult) -> io::Result<()>;
}

impl RecordSink for Vec<SizeResult> {
    fn record(&mut self, result: &SizeResult) -> io::Result<()> {
        self.push(result.clone());
        Ok(())
    }
}

/// Tab-separated size/bandwidth table.
pub struct TableSink<W: Write> {
    out: W,
}

impl<W: Write> TableSink<W> {
    pub fn new(out: W) -> Self {
        TableSink { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> RecordSink for TableSink<W> {
    fn begin(&mut self) -> io::Result<()> {
        writeln!(self.out, "{}", REPORT_HEADER)?;
        self.out.flush()
    }

    fn record(&mut self, result: &SizeResult) -> io::Result<()> {
        writeln!(self.out, "{}\t\t{}", result.size, result.bandwidth_gbps)?;
        self.out.flush()
    }
}

/// Keeps per-size one-way latency in the debug log and prints nothing.
#[derive(Debug, Default)]
pub struct LatencyLog;

impl RecordSink for LatencyLog {
    fn record(&mut self, result: &SizeResult) -> io::Result<()> {
        tracing::debug!(
            size = result.size,
            latency_us = result.one_way_latency_us,
            "one-way latency"
        );
        Ok(())
    }
}

/// The listener prints the table on stdout; the connector only keeps latency in the log.
pub fn report_for(role: &Role) -> Box<dyn RecordSink> {
    match role {
        Role::Listener { .. } => Box::new(TableSink::new(io::stdout())),
        Role::Connector { .. } => Box::new(LatencyLog),
    }
}

/// Runs the whole size schedule over one endpoint with a single send/receive region pair.
pub struct BandwidthSweep<'c> {
    schedule: SizeSchedule,
    memory: MemoryKind,
    iterations: usize,
    window_depth: usize,
    transfer_loop: TransferLoop<'c>,
}

impl<'c> BandwidthSweep<'c> {
    pub fn new(config: &BenchConfig, clock: &'c Clock) -> Self {
        BandwidthSweep {
            schedule: config.schedule(),
            memory: config.memory_kind(),
            iterations: config.iterations,
            window_depth: config.window_depth,
            transfer_loop: TransferLoop::new(clock, config),
        }
    }

    /// Allocate the regions, sweep every size, release the regions.
    ///
    /// Returns how many sizes were reported. The regions are released on every path.
    pub fn run<T: Transport>(
        &self,
        transport: &mut T,
        endpoint: &mut T::Endpoint,
        sink: &mut dyn RecordSink,
    ) -> Result<usize> {
        let capacity = self.schedule.max_size();

        let send = transport.allocate(self.memory, capacity)?;
        let mut recv = match transport.allocate(self.memory, capacity) {
            Ok(recv) => recv,
            Err(e) => {
                release_logged(transport, send);
                return Err(e);
            }
        };

        let outcome = self.sweep(endpoint, &send, &mut recv, sink);

        match outcome {
            Ok(reported) => {
                let send_released = transport.release(send);
                let recv_released = transport.release(recv);
                send_released.and(recv_released).map(|()| reported)
            }
            Err(e) => {
                release_logged(transport, send);
                release_logged(transport, recv);
                Err(e)
            }
        }
    }

    fn sweep<E: Endpoint>(
        &self,
        endpoint: &mut E,
        send: &MemoryRegion,
        recv: &mut MemoryRegion,
        sink: &mut dyn RecordSink,
    ) -> Result<usize> {
        sink.begin()?;

        let mut reported = 0;

        for size in self.schedule.sizes() {
            self.transfer_loop.warmup(endpoint, send, recv, size)?;
            let elapsed = self.transfer_loop.measure(endpoint, send, recv, size)?;

            let result = SizeResult::new(size, self.iterations, self.window_depth, elapsed);

            tracing::debug!(
                size,
                elapsed_us = elapsed.as_micros() as u64,
                bandwidth_gbps = result.bandwidth_gbps,
                "size finished"
            );

            sink.record(&result)?;
            reported += 1;
        }

        Ok(reported)
    }
}

fn release_logged<T: Transport>(transport: &mut T, region: MemoryRegion) {
    if let Err(e) = transport.release(region) {
        tracing::warn!(error = %e, "failed to release memory region");
    }
}
