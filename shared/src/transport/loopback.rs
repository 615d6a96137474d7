//! In-process transport: two endpoints joined by channels.

use std::{collections::VecDeque, io, net::SocketAddr};

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};

use super::{Endpoint, Opcode, TransferOperation, Transport, WorkCompletion};
use crate::{
    error::{BenchError, Result},
    memory_region::RegionSlice,
};

const PEER_NAME: &str = "loopback";

struct Link {
    hello_tx: Sender<()>,
    hello_rx: Receiver<()>,
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

/// One half of an in-process link. Each half yields exactly one endpoint, either by
/// accepting or by connecting.
pub struct LoopbackTransport {
    link: Option<Link>,
}

impl LoopbackTransport {
    pub fn pair() -> (Self, Self) {
        let (a_hello, b_hello_rx) = channel::bounded(1);
        let (b_hello, a_hello_rx) = channel::bounded(1);
        let (a_tx, b_rx) = channel::unbounded();
        let (b_tx, a_rx) = channel::unbounded();

        let a = Link {
            hello_tx: a_hello,
            hello_rx: a_hello_rx,
            tx: a_tx,
            rx: a_rx,
        };
        let b = Link {
            hello_tx: b_hello,
            hello_rx: b_hello_rx,
            tx: b_tx,
            rx: b_rx,
        };

        (
            LoopbackTransport { link: Some(a) },
            LoopbackTransport { link: Some(b) },
        )
    }

    fn take_link(&mut self) -> Result<Link> {
        self.link
            .take()
            .ok_or_else(|| BenchError::connection(PEER_NAME, "link already has an endpoint"))
    }
}

impl Transport for LoopbackTransport {
    type Endpoint = LoopbackEndpoint;

    fn accept(&mut self, _port: u16) -> Result<LoopbackEndpoint> {
        let link = self.take_link()?;

        tracing::info!("waiting for the loopback peer");

        link.hello_rx
            .recv()
            .map_err(|_| BenchError::connection(PEER_NAME, "peer dropped before connecting"))?;

        Ok(LoopbackEndpoint::new(link))
    }

    fn connect(&mut self, _addr: SocketAddr) -> Result<LoopbackEndpoint> {
        let link = self.take_link()?;

        link.hello_tx
            .send(())
            .map_err(|_| BenchError::connection(PEER_NAME, "peer is gone"))?;

        Ok(LoopbackEndpoint::new(link))
    }
}

struct PendingRecv {
    wr_id: u64,
    target: RegionSlice,
}

pub struct LoopbackEndpoint {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    next_wr_id: u64,
    sends: VecDeque<(u64, Vec<u8>)>,
    recvs: VecDeque<PendingRecv>,
}

impl LoopbackEndpoint {
    fn new(link: Link) -> Self {
        LoopbackEndpoint {
            tx: link.tx,
            rx: link.rx,
            next_wr_id: 0,
            sends: VecDeque::new(),
            recvs: VecDeque::new(),
        }
    }

    fn next_wr_id(&mut self) -> u64 {
        let wr_id = self.next_wr_id;
        self.next_wr_id += 1;
        wr_id
    }

    fn deliver(recv: PendingRecv, message: Vec<u8>) -> WorkCompletion {
        if message.len() != recv.target.len() {
            return WorkCompletion::failed(
                recv.wr_id,
                Opcode::Recv,
                format!(
                    "expected a {} byte message, got {} bytes",
                    recv.target.len(),
                    message.len()
                ),
            );
        }

        match unsafe { recv.target.write_from(&message) } {
            Ok(()) => WorkCompletion::success(recv.wr_id, Opcode::Recv, message.len()),
            Err(e) => WorkCompletion::failed(recv.wr_id, Opcode::Recv, e.to_string()),
        }
    }
}

impl Endpoint for LoopbackEndpoint {
    unsafe fn post_send(&mut self, region: RegionSlice) -> Result<TransferOperation> {
        let data = region.to_vec()?;
        let wr_id = self.next_wr_id();

        self.sends.push_back((wr_id, data));

        Ok(TransferOperation {
            wr_id,
            opcode: Opcode::Send,
            len: region.len(),
        })
    }

    unsafe fn post_recv(&mut self, region: RegionSlice) -> Result<TransferOperation> {
        let wr_id = self.next_wr_id();

        self.recvs.push_back(PendingRecv {
            wr_id,
            target: region,
        });

        Ok(TransferOperation {
            wr_id,
            opcode: Opcode::Recv,
            len: region.len(),
        })
    }

    fn poll(&mut self, completions: &mut Vec<WorkCompletion>) -> io::Result<()> {
        for (wr_id, data) in self.sends.drain(..) {
            let len = data.len();
            completions.push(match self.tx.send(data) {
                Ok(()) => WorkCompletion::success(wr_id, Opcode::Send, len),
                Err(_) => WorkCompletion::failed(wr_id, Opcode::Send, "peer hung up"),
            });
        }

        while !self.recvs.is_empty() {
            match self.rx.try_recv() {
                Ok(message) => {
                    if let Some(recv) = self.recvs.pop_front() {
                        completions.push(Self::deliver(recv, message));
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    completions.extend(self.recvs.drain(..).map(|recv| {
                        WorkCompletion::failed(recv.wr_id, Opcode::Recv, "peer hung up")
                    }));
                }
            }
        }

        Ok(())
    }

    fn outstanding(&self) -> usize {
        self.sends.len() + self.recvs.len()
    }

    fn peer(&self) -> String {
        PEER_NAME.to_owned()
    }

    fn close(self) -> Result<()> {
        if self.outstanding() > 0 {
            tracing::warn!(outstanding = self.outstanding(), "closing with operations in flight");
        }
        tracing::info!("closing loopback endpoint");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use super::*;
    use crate::memory_region::{MemoryKind, MemoryRegion};

    fn any_addr() -> SocketAddr {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0).into()
    }

    fn poll_until(endpoint: &mut LoopbackEndpoint, count: usize) -> Vec<WorkCompletion> {
        let mut completions = Vec::new();
        while completions.len() < count {
            endpoint.poll(&mut completions).unwrap();
        }
        completions
    }

    #[test]
    fn messages_cross_the_link() {
        let (mut left, mut right) = LoopbackTransport::pair();
        let mut connector = right.connect(any_addr()).unwrap();
        let mut listener = left.accept(0).unwrap();

        let mut source = MemoryRegion::allocate(MemoryKind::Host, 16).unwrap();
        let mut sink = MemoryRegion::allocate(MemoryKind::Host, 16).unwrap();
        unsafe { source.slice_mut(16).unwrap().write_from(&[3; 16]).unwrap() };

        let send = unsafe { connector.post_send(source.slice(4).unwrap()).unwrap() };
        let recv = unsafe { listener.post_recv(sink.slice_mut(4).unwrap()).unwrap() };

        let sent = poll_until(&mut connector, 1);
        let received = poll_until(&mut listener, 1);

        assert_eq!(sent, vec![WorkCompletion::success(send.wr_id, Opcode::Send, 4)]);
        assert_eq!(received, vec![WorkCompletion::success(recv.wr_id, Opcode::Recv, 4)]);

        let bytes = unsafe { sink.slice(16).unwrap().to_vec().unwrap() };
        assert_eq!(&bytes[..4], &[3; 4]);
        assert_eq!(&bytes[4..], &[0; 12]);
    }

    #[test]
    fn a_link_has_a_single_endpoint() {
        let (mut left, _right) = LoopbackTransport::pair();
        let _connector = left.connect(any_addr()).unwrap();

        assert!(matches!(
            left.connect(any_addr()),
            Err(BenchError::Connection { .. })
        ));
    }

    #[test]
    fn hung_up_peer_fails_receives() {
        let (mut left, mut right) = LoopbackTransport::pair();
        let connector = right.connect(any_addr()).unwrap();
        let mut listener = left.accept(0).unwrap();
        drop(connector);

        let mut region = MemoryRegion::allocate(MemoryKind::Host, 8).unwrap();
        unsafe { listener.post_recv(region.slice_mut(8).unwrap()).unwrap() };

        let completions = poll_until(&mut listener, 1);
        assert!(!completions[0].is_success());
        assert_eq!(listener.outstanding(), 0);
    }

    #[test]
    fn accept_fails_when_peer_never_connects() {
        let (mut left, right) = LoopbackTransport::pair();
        drop(right);

        assert!(matches!(left.accept(0), Err(BenchError::Connection { .. })));
    }
}
