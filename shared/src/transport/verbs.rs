//! RDMA verbs transport: one RC queue pair per endpoint, connected through a TCP side
//! channel that carries the queue pair coordinates.

use std::{
    cell::RefCell,
    collections::HashMap,
    ffi::{c_void, CStr},
    io::{self, Read, Write},
    mem::{zeroed, MaybeUninit},
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream},
    ptr::null_mut,
    rc::Rc,
    slice,
};

use rdma_sys::*;

use self::{config::VerbsConfig, qp_info::QpInfo};
use super::{Endpoint, Opcode, TransferOperation, Transport, WorkCompletion};
use crate::{
    error::{BenchError, Result},
    memory_region::{MemoryKind, MemoryRegion, RegionSlice},
};

pub mod config;
mod qp_info;

const POLL_BATCH: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum VerbsError {
    #[error("no RDMA devices found")]
    NoDevice,
    #[error("RDMA device {0} not found")]
    DeviceNotFound(String),
    #[error("failed to open RDMA device {0}")]
    OpenDevice(String),
    #[error("failed to allocate protection domain")]
    AllocPd,
    #[error("failed to query port with return value {0}")]
    QueryPort(i32),
    #[error("port {0} is not active")]
    PortDown(u8),
    #[error("failed to query device with return value {0}")]
    QueryDevice(i32),
    #[error("could not get local gid for gid index {0}")]
    QueryGid(i32),
    #[error("failed to create completion queue: {0}")]
    CreateCq(io::Error),
    #[error("failed to create queue pair: {0}")]
    CreateQp(io::Error),
    #[error("failed to modify QP from {from_state} to {to_state}: {source}")]
    ModifyQp {
        from_state: &'static str,
        to_state: &'static str,
        source: io::Error,
    },
    #[error("failed to register memory region: {0}")]
    RegMr(io::Error),
    #[error("side channel: {0}")]
    SideChannel(#[from] io::Error),
}

struct Device {
    name: String,
    ctx: *mut ibv_context,
    pd: *mut ibv_pd,
    port_attr: ibv_port_attr,
    max_qp_wr: u32,
    registrations: RefCell<HashMap<u64, *mut ibv_mr>>,
}

impl Device {
    fn open(config: &VerbsConfig) -> std::result::Result<Self, VerbsError> {
        unsafe {
            let mut num_devices = 0;
            let devices = ibv_get_device_list(&mut num_devices);

            if devices.is_null() {
                return Err(VerbsError::NoDevice);
            }

            let found = slice::from_raw_parts(devices, num_devices.max(0) as usize)
                .iter()
                .copied()
                .find(|device| {
                    CStr::from_ptr(ibv_get_device_name(*device)).to_bytes()
                        == config.dev_name.as_bytes()
                });

            let ctx = found.map_or(null_mut(), |device| ibv_open_device(device));

            ibv_free_device_list(devices);

            if found.is_none() {
                return Err(if num_devices > 0 {
                    VerbsError::DeviceNotFound(config.dev_name.clone())
                } else {
                    VerbsError::NoDevice
                });
            }

            if ctx.is_null() {
                return Err(VerbsError::OpenDevice(config.dev_name.clone()));
            }

            let pd = ibv_alloc_pd(ctx);

            if pd.is_null() {
                ibv_close_device(ctx);
                return Err(VerbsError::AllocPd);
            }

            // from here on Drop releases pd and ctx
            let mut device = Device {
                name: config.dev_name.clone(),
                ctx,
                pd,
                port_attr: zeroed(),
                max_qp_wr: 0,
                registrations: RefCell::default(),
            };

            let ret = ibv_query_port(
                ctx,
                config.ib_port,
                (&mut device.port_attr as *mut ibv_port_attr).cast(),
            );

            if ret != 0 {
                return Err(VerbsError::QueryPort(ret));
            }

            if device.port_attr.state != ibv_port_state::IBV_PORT_ACTIVE {
                return Err(VerbsError::PortDown(config.ib_port));
            }

            let mut dev_attr: ibv_device_attr = zeroed();
            let ret = ibv_query_device(ctx, &mut dev_attr);

            if ret != 0 {
                return Err(VerbsError::QueryDevice(ret));
            }

            device.max_qp_wr = u32::try_from(dev_attr.max_qp_wr).unwrap_or(0);

            tracing::info!(
                device = %device.name,
                max_qp_wr = dev_attr.max_qp_wr,
                max_cqe = dev_attr.max_cqe,
                "opened RDMA device"
            );

            Ok(device)
        }
    }

    fn register(&self, region: &MemoryRegion) -> std::result::Result<(), VerbsError> {
        let mr = unsafe {
            ibv_reg_mr(
                self.pd,
                region.addr() as *mut c_void,
                region.capacity(),
                (ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
                    | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
                    | ibv_access_flags::IBV_ACCESS_REMOTE_READ)
                    .0 as i32,
            )
        };

        if mr.is_null() {
            return Err(VerbsError::RegMr(io::Error::last_os_error()));
        }

        tracing::debug!(
            id = region.id(),
            addr = format_args!("{:#x}", region.addr()),
            len = region.capacity(),
            "registered memory region"
        );

        self.registrations.borrow_mut().insert(region.id(), mr);
        Ok(())
    }

    fn deregister(&self, region_id: u64) {
        if let Some(mr) = self.registrations.borrow_mut().remove(&region_id) {
            unsafe {
                ibv_dereg_mr(mr);
            }
        }
    }

    fn lkey(&self, region_id: u64) -> Option<u32> {
        self.registrations
            .borrow()
            .get(&region_id)
            .map(|mr| unsafe { (**mr).lkey })
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            for (_, mr) in self.registrations.get_mut().drain() {
                ibv_dereg_mr(mr);
            }
            ibv_dealloc_pd(self.pd);
            ibv_close_device(self.ctx);
        }
    }
}

pub struct VerbsTransport {
    device: Rc<Device>,
    config: VerbsConfig,
}

impl VerbsTransport {
    pub fn open(config: VerbsConfig) -> Result<Self> {
        let device =
            Device::open(&config).map_err(|e| BenchError::connection(&config.dev_name, e))?;

        if config.queue_depth > device.max_qp_wr {
            return Err(BenchError::InvalidArgument(format!(
                "queue depth {} exceeds the {} work requests {} supports",
                config.queue_depth, device.max_qp_wr, device.name
            )));
        }

        Ok(VerbsTransport {
            device: Rc::new(device),
            config,
        })
    }

    fn establish(
        &self,
        peer: SocketAddr,
        exchange: impl FnOnce(&mut TcpStream, &QpInfo) -> io::Result<QpInfo>,
        mut stream: TcpStream,
    ) -> std::result::Result<VerbsEndpoint, VerbsError> {
        let mut endpoint = VerbsEndpoint::create(self.device.clone(), &self.config, peer)?;

        let local = endpoint.local_info(&self.config)?;
        let remote = exchange(&mut stream, &local)?;

        tracing::debug!(?local, ?remote, "exchanged queue pair info");

        endpoint.connect_to(&self.config, &local, &remote)?;

        // both sides reach RTS before either posts
        stream.write_all(&[1])?;
        stream.read_exact(&mut [0u8; 1])?;

        Ok(endpoint)
    }
}

impl Transport for VerbsTransport {
    type Endpoint = VerbsEndpoint;

    fn allocate(&mut self, kind: MemoryKind, capacity: usize) -> Result<MemoryRegion> {
        let region = MemoryRegion::allocate(kind, capacity)?;

        self.device
            .register(&region)
            .map_err(|e| BenchError::Allocation {
                kind,
                capacity,
                reason: e.to_string(),
            })?;

        Ok(region)
    }

    fn release(&mut self, region: MemoryRegion) -> Result<()> {
        self.device.deregister(region.id());
        region.release()
    }

    fn accept(&mut self, port: u16) -> Result<VerbsEndpoint> {
        let socket_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);

        let listener =
            TcpListener::bind(socket_addr).map_err(|e| BenchError::connection(socket_addr, e))?;

        tracing::info!(%socket_addr, "waiting for queue pair info");

        let (stream, peer) = listener
            .accept()
            .map_err(|e| BenchError::connection(socket_addr, e))?;

        drop(listener);

        self.establish(
            peer,
            |stream, local| {
                let remote = QpInfo::read_from(stream)?;
                local.write_to(stream)?;
                Ok(remote)
            },
            stream,
        )
        .map_err(|e| BenchError::connection(peer, e))
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<VerbsEndpoint> {
        let stream = TcpStream::connect(addr).map_err(|e| BenchError::connection(addr, e))?;

        self.establish(
            addr,
            |stream, local| {
                local.write_to(stream)?;
                QpInfo::read_from(stream)
            },
            stream,
        )
        .map_err(|e| BenchError::connection(addr, e))
    }
}

pub struct VerbsEndpoint {
    device: Rc<Device>,
    cq: *mut ibv_cq,
    qp: *mut ibv_qp,
    peer: SocketAddr,
    next_wr_id: u64,
    outstanding: usize,
}

impl VerbsEndpoint {
    fn create(
        device: Rc<Device>,
        config: &VerbsConfig,
        peer: SocketAddr,
    ) -> std::result::Result<Self, VerbsError> {
        let mut endpoint = VerbsEndpoint {
            device,
            cq: null_mut(),
            qp: null_mut(),
            peer,
            next_wr_id: 0,
            outstanding: 0,
        };

        unsafe {
            endpoint.cq = ibv_create_cq(
                endpoint.device.ctx,
                i32::try_from(config.queue_depth.saturating_mul(2)).unwrap_or(i32::MAX),
                null_mut(),
                null_mut(),
                0,
            );

            if endpoint.cq.is_null() {
                return Err(VerbsError::CreateCq(io::Error::last_os_error()));
            }

            let mut qp_init_attr = ibv_qp_init_attr {
                qp_type: ibv_qp_type::IBV_QPT_RC,
                send_cq: endpoint.cq,
                recv_cq: endpoint.cq,
                cap: ibv_qp_cap {
                    max_send_wr: config.queue_depth,
                    max_recv_wr: config.queue_depth,
                    max_send_sge: 1,
                    max_recv_sge: 1,
                    ..zeroed()
                },
                ..zeroed()
            };

            endpoint.qp = ibv_create_qp(endpoint.device.pd, &mut qp_init_attr);

            if endpoint.qp.is_null() {
                return Err(VerbsError::CreateQp(io::Error::last_os_error()));
            }
        }

        Ok(endpoint)
    }

    fn local_info(&self, config: &VerbsConfig) -> std::result::Result<QpInfo, VerbsError> {
        unsafe {
            let mut gid: ibv_gid = zeroed();

            if let Some(gid_index) = config.gid_index {
                let ret = ibv_query_gid(self.device.ctx, config.ib_port, gid_index.get(), &mut gid);
                if ret != 0 {
                    return Err(VerbsError::QueryGid(gid_index.get()));
                }
            }

            Ok(QpInfo::new(
                self.device.port_attr.lid,
                (*self.qp).qp_num,
                rand::random::<u32>() & 0x00ff_ffff,
                gid.raw,
            ))
        }
    }

    fn modify(
        &mut self,
        attr: &mut ibv_qp_attr,
        mask: ibv_qp_attr_mask,
        from_state: &'static str,
        to_state: &'static str,
    ) -> std::result::Result<(), VerbsError> {
        let ret = unsafe { ibv_modify_qp(self.qp, attr, mask.0 as i32) };

        if ret != 0 {
            return Err(VerbsError::ModifyQp {
                from_state,
                to_state,
                source: io::Error::from_raw_os_error(ret),
            });
        }

        Ok(())
    }

    fn connect_to(
        &mut self,
        config: &VerbsConfig,
        local: &QpInfo,
        remote: &QpInfo,
    ) -> std::result::Result<(), VerbsError> {
        unsafe {
            let mut qp_attr = ibv_qp_attr {
                qp_state: ibv_qp_state::IBV_QPS_INIT,
                pkey_index: 0,
                port_num: config.ib_port,
                qp_access_flags: (ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
                    | ibv_access_flags::IBV_ACCESS_REMOTE_READ
                    | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE)
                    .0,
                ..zeroed()
            };

            self.modify(
                &mut qp_attr,
                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
                    | ibv_qp_attr_mask::IBV_QP_PORT
                    | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS,
                "RESET",
                "INIT",
            )?;

            let mut qp_attr = ibv_qp_attr {
                qp_state: ibv_qp_state::IBV_QPS_RTR,
                path_mtu: ibv_mtu::IBV_MTU_4096,
                dest_qp_num: remote.qpn,
                rq_psn: remote.psn,
                max_dest_rd_atomic: 1,
                min_rnr_timer: 12,
                ah_attr: ibv_ah_attr {
                    is_global: 0,
                    dlid: remote.lid,
                    sl: 0,
                    src_path_bits: 0,
                    port_num: config.ib_port,
                    ..zeroed()
                },
                ..zeroed()
            };

            if remote.has_gid() {
                qp_attr.ah_attr.is_global = 1;
                qp_attr.ah_attr.grh.dgid = ibv_gid { raw: remote.gid };
                qp_attr.ah_attr.grh.sgid_index =
                    config.gid_index.map_or(0, |index| index.get() as u8);
                qp_attr.ah_attr.grh.hop_limit = 1;
                qp_attr.ah_attr.grh.traffic_class = 0;
            }

            self.modify(
                &mut qp_attr,
                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_AV
                    | ibv_qp_attr_mask::IBV_QP_PATH_MTU
                    | ibv_qp_attr_mask::IBV_QP_DEST_QPN
                    | ibv_qp_attr_mask::IBV_QP_RQ_PSN
                    | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
                    | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER,
                "INIT",
                "RTR",
            )?;

            qp_attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
            qp_attr.timeout = 14;
            qp_attr.retry_cnt = 7;
            qp_attr.rnr_retry = 7;
            qp_attr.sq_psn = local.psn;
            qp_attr.max_rd_atomic = 1;

            self.modify(
                &mut qp_attr,
                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_TIMEOUT
                    | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
                    | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
                    | ibv_qp_attr_mask::IBV_QP_SQ_PSN
                    | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC,
                "RTR",
                "RTS",
            )?;
        }

        tracing::info!(peer = %self.peer, device = %self.device.name, "queue pair connected");

        Ok(())
    }

    fn sge(&mut self, region: &RegionSlice) -> Result<(u64, ibv_sge)> {
        let lkey = self.device.lkey(region.region_id()).ok_or_else(|| {
            BenchError::InvalidArgument("region is not registered with this device".to_owned())
        })?;

        let length = u32::try_from(region.len()).map_err(|_| {
            BenchError::InvalidArgument(format!("{} bytes exceed one work request", region.len()))
        })?;

        let wr_id = self.next_wr_id;
        self.next_wr_id += 1;

        Ok((
            wr_id,
            ibv_sge {
                addr: region.addr(),
                length,
                lkey,
            },
        ))
    }

    fn destroy(&mut self) -> io::Result<()> {
        unsafe {
            if !self.qp.is_null() {
                let ret = ibv_destroy_qp(self.qp);
                self.qp = null_mut();
                if ret != 0 {
                    return Err(io::Error::from_raw_os_error(ret));
                }
            }

            if !self.cq.is_null() {
                let ret = ibv_destroy_cq(self.cq);
                self.cq = null_mut();
                if ret != 0 {
                    return Err(io::Error::from_raw_os_error(ret));
                }
            }
        }

        Ok(())
    }
}

impl Drop for VerbsEndpoint {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            tracing::warn!(error = %e, "failed to destroy queue pair");
        }
    }
}

impl Endpoint for VerbsEndpoint {
    unsafe fn post_send(&mut self, region: RegionSlice) -> Result<TransferOperation> {
        let (wr_id, mut sge) = self.sge(&region)?;

        let mut send_wr = ibv_send_wr {
            wr_id,
            sg_list: &mut sge,
            num_sge: 1,
            opcode: ibv_wr_opcode::IBV_WR_SEND,
            send_flags: ibv_send_flags::IBV_SEND_SIGNALED.0,
            ..zeroed()
        };
        let mut bad_send_wr = null_mut();

        let errno = ibv_post_send(self.qp, &mut send_wr, &mut bad_send_wr);

        if errno != 0 {
            return Err(BenchError::Transfer {
                size: region.len(),
                reason: format!("ibv_post_send: {}", io::Error::from_raw_os_error(errno)),
            });
        }

        self.outstanding += 1;

        Ok(TransferOperation {
            wr_id,
            opcode: Opcode::Send,
            len: region.len(),
        })
    }

    unsafe fn post_recv(&mut self, region: RegionSlice) -> Result<TransferOperation> {
        let (wr_id, mut sge) = self.sge(&region)?;

        let mut recv_wr = ibv_recv_wr {
            wr_id,
            sg_list: &mut sge,
            num_sge: 1,
            ..zeroed()
        };
        let mut bad_recv_wr = null_mut();

        let errno = ibv_post_recv(self.qp, &mut recv_wr, &mut bad_recv_wr);

        if errno != 0 {
            return Err(BenchError::Transfer {
                size: region.len(),
                reason: format!("ibv_post_recv: {}", io::Error::from_raw_os_error(errno)),
            });
        }

        self.outstanding += 1;

        Ok(TransferOperation {
            wr_id,
            opcode: Opcode::Recv,
            len: region.len(),
        })
    }

    fn poll(&mut self, completions: &mut Vec<WorkCompletion>) -> io::Result<()> {
        const WC_INIT: MaybeUninit<ibv_wc> = MaybeUninit::zeroed();

        let mut wc_buffer = [WC_INIT; POLL_BATCH];

        let num_polled =
            unsafe { ibv_poll_cq(self.cq, POLL_BATCH as i32, wc_buffer.as_mut_ptr().cast()) };

        if num_polled < 0 {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("ibv_poll_cq returned {num_polled}"),
            ));
        }

        let num_polled = num_polled as usize;
        self.outstanding = self.outstanding.saturating_sub(num_polled);

        completions.extend(
            wc_buffer
                .into_iter()
                .take(num_polled)
                .map(|wc| WorkCompletion::from(unsafe { wc.assume_init() })),
        );

        Ok(())
    }

    fn outstanding(&self) -> usize {
        self.outstanding
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }

    fn close(mut self) -> Result<()> {
        if self.outstanding > 0 {
            tracing::warn!(outstanding = self.outstanding, "closing with operations in flight");
        }

        tracing::info!(peer = %self.peer, "destroying queue pair");

        let peer = self.peer;
        self.destroy().map_err(|e| BenchError::connection(peer, e))
    }
}
