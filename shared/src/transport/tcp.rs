//! Stream-socket transport.
//!
//! Both peers issue the same sequence of message sizes, so message boundaries on the byte
//! stream are implied: the n-th receive consumes exactly as many bytes as the peer's n-th send.

use std::{
    collections::VecDeque,
    io::{self, ErrorKind, Read, Write},
    net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream},
    thread,
    time::Duration,
};

use super::{Endpoint, Opcode, TransferOperation, Transport, WorkCompletion};
use crate::{
    error::{BenchError, Result},
    memory_region::RegionSlice,
};

#[derive(Debug, Clone)]
pub struct TcpTransport {
    bind_addr: IpAddr,
    connect_retries: u32,
    retry_interval: Duration,
}

impl Default for TcpTransport {
    fn default() -> Self {
        TcpTransport {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            connect_retries: 0,
            retry_interval: Duration::from_millis(100),
        }
    }
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Retry a refused connect up to `retries` more times, `interval` apart.
    pub fn connect_retries(mut self, retries: u32, interval: Duration) -> Self {
        self.connect_retries = retries;
        self.retry_interval = interval;
        self
    }
}

impl Transport for TcpTransport {
    type Endpoint = TcpEndpoint;

    fn accept(&mut self, port: u16) -> Result<TcpEndpoint> {
        let socket_addr = SocketAddr::new(self.bind_addr, port);

        let listener =
            TcpListener::bind(socket_addr).map_err(|e| BenchError::connection(socket_addr, e))?;

        tracing::info!(%socket_addr, "listening for a peer");

        let (stream, peer) = listener
            .accept()
            .map_err(|e| BenchError::connection(socket_addr, e))?;

        // single-shot: the listening socket closes here
        drop(listener);

        TcpEndpoint::new(stream, peer)
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<TcpEndpoint> {
        let mut attempt = 0;

        let stream = loop {
            match TcpStream::connect(addr) {
                Ok(stream) => break stream,
                Err(e) if attempt < self.connect_retries => {
                    attempt += 1;
                    tracing::debug!(%addr, attempt, error = %e, "connect failed, retrying");
                    thread::sleep(self.retry_interval);
                }
                Err(e) => return Err(BenchError::connection(addr, e)),
            }
        };

        TcpEndpoint::new(stream, addr)
    }
}

enum Payload {
    Region(RegionSlice),
    Staged(Vec<u8>),
}

struct PendingSend {
    wr_id: u64,
    payload: Payload,
    written: usize,
}

impl PendingSend {
    fn bytes(&self) -> &[u8] {
        match &self.payload {
            Payload::Region(slice) => unsafe { slice.host_bytes() },
            Payload::Staged(data) => data,
        }
    }
}

struct PendingRecv {
    wr_id: u64,
    target: RegionSlice,
    staging: Option<Vec<u8>>,
    filled: usize,
}

impl PendingRecv {
    fn unfilled(&mut self) -> &mut [u8] {
        let filled = self.filled;
        match &mut self.staging {
            Some(staging) => &mut staging[filled..],
            None => unsafe { &mut self.target.host_bytes_mut()[filled..] },
        }
    }

    fn finish(self) -> WorkCompletion {
        if let Some(staging) = &self.staging {
            if let Err(e) = unsafe { self.target.write_from(staging) } {
                return WorkCompletion::failed(self.wr_id, Opcode::Recv, e.to_string());
            }
        }
        WorkCompletion::success(self.wr_id, Opcode::Recv, self.target.len())
    }
}

pub struct TcpEndpoint {
    stream: TcpStream,
    peer: SocketAddr,
    next_wr_id: u64,
    sends: VecDeque<PendingSend>,
    recvs: VecDeque<PendingRecv>,
    failure: Option<String>,
}

impl TcpEndpoint {
    fn new(stream: TcpStream, peer: SocketAddr) -> Result<Self> {
        stream
            .set_nodelay(true)
            .and_then(|()| stream.set_nonblocking(true))
            .map_err(|e| BenchError::connection(peer, e))?;

        tracing::info!(%peer, "tcp endpoint connected");

        Ok(TcpEndpoint {
            stream,
            peer,
            next_wr_id: 0,
            sends: VecDeque::new(),
            recvs: VecDeque::new(),
            failure: None,
        })
    }

    fn issue(&mut self, len: usize) -> Result<u64> {
        if let Some(reason) = &self.failure {
            return Err(BenchError::Transfer {
                size: len,
                reason: reason.clone(),
            });
        }

        let wr_id = self.next_wr_id;
        self.next_wr_id += 1;
        Ok(wr_id)
    }

    fn progress_sends(&mut self, completions: &mut Vec<WorkCompletion>) -> io::Result<()> {
        while let Some(send) = self.sends.front_mut() {
            let remaining = &send.bytes()[send.written..];

            if !remaining.is_empty() {
                match self.stream.write(remaining) {
                    Ok(0) => return Err(ErrorKind::WriteZero.into()),
                    Ok(n) => send.written += n,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }

            if send.written == send.bytes().len() {
                if let Some(send) = self.sends.pop_front() {
                    completions.push(WorkCompletion::success(
                        send.wr_id,
                        Opcode::Send,
                        send.written,
                    ));
                }
            }
        }

        Ok(())
    }

    fn progress_recvs(&mut self, completions: &mut Vec<WorkCompletion>) -> io::Result<()> {
        while let Some(recv) = self.recvs.front_mut() {
            if recv.filled < recv.target.len() {
                match self.stream.read(recv.unfilled()) {
                    Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
                    Ok(n) => recv.filled += n,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }

            if recv.filled == recv.target.len() {
                if let Some(recv) = self.recvs.pop_front() {
                    completions.push(recv.finish());
                }
            }
        }

        Ok(())
    }

    fn fail_all(&mut self, reason: String, completions: &mut Vec<WorkCompletion>) {
        tracing::warn!(peer = %self.peer, %reason, "tcp endpoint failed");

        completions.extend(
            self.sends
                .drain(..)
                .map(|send| WorkCompletion::failed(send.wr_id, Opcode::Send, reason.as_str())),
        );
        completions.extend(
            self.recvs
                .drain(..)
                .map(|recv| WorkCompletion::failed(recv.wr_id, Opcode::Recv, reason.as_str())),
        );

        self.failure = Some(reason);
    }
}

impl Endpoint for TcpEndpoint {
    unsafe fn post_send(&mut self, region: RegionSlice) -> Result<TransferOperation> {
        let wr_id = self.issue(region.len())?;

        let payload = if region.is_host() {
            Payload::Region(region)
        } else {
            Payload::Staged(region.to_vec()?)
        };

        self.sends.push_back(PendingSend {
            wr_id,
            payload,
            written: 0,
        });

        Ok(TransferOperation {
            wr_id,
            opcode: Opcode::Send,
            len: region.len(),
        })
    }

    unsafe fn post_recv(&mut self, region: RegionSlice) -> Result<TransferOperation> {
        let wr_id = self.issue(region.len())?;

        let staging = (!region.is_host()).then(|| vec![0u8; region.len()]);

        self.recvs.push_back(PendingRecv {
            wr_id,
            target: region,
            staging,
            filled: 0,
        });

        Ok(TransferOperation {
            wr_id,
            opcode: Opcode::Recv,
            len: region.len(),
        })
    }

    fn poll(&mut self, completions: &mut Vec<WorkCompletion>) -> io::Result<()> {
        let progress = self
            .progress_sends(completions)
            .and_then(|()| self.progress_recvs(completions));

        if let Err(e) = progress {
            self.fail_all(e.to_string(), completions);
        }

        Ok(())
    }

    fn outstanding(&self) -> usize {
        self.sends.len() + self.recvs.len()
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }

    fn close(self) -> Result<()> {
        if self.outstanding() > 0 {
            tracing::warn!(outstanding = self.outstanding(), "closing with operations in flight");
        }

        tracing::info!(peer = %self.peer, "closing tcp endpoint");

        match self.stream.shutdown(Shutdown::Write) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(BenchError::connection(self.peer, e)),
        }
    }
}
