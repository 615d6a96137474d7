use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Send,
    Recv,
}

impl Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Opcode::Send => write!(f, "send"),
            Opcode::Recv => write!(f, "recv"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub opcode: Opcode,
    pub byte_len: usize,
    pub status: CompletionStatus,
}

impl WorkCompletion {
    pub fn success(wr_id: u64, opcode: Opcode, byte_len: usize) -> Self {
        WorkCompletion {
            wr_id,
            opcode,
            byte_len,
            status: CompletionStatus::Success,
        }
    }

    pub fn failed(wr_id: u64, opcode: Opcode, reason: impl Into<String>) -> Self {
        WorkCompletion {
            wr_id,
            opcode,
            byte_len: 0,
            status: CompletionStatus::Failed(reason.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CompletionStatus::Success
    }
}

#[cfg(feature = "verbs")]
impl From<rdma_sys::ibv_wc> for WorkCompletion {
    fn from(wc: rdma_sys::ibv_wc) -> Self {
        use rdma_sys::{ibv_wc_opcode, ibv_wc_status, ibv_wc_status_str};

        let opcode = if wc.opcode & ibv_wc_opcode::IBV_WC_RECV != 0 {
            Opcode::Recv
        } else {
            Opcode::Send
        };

        if wc.status == ibv_wc_status::IBV_WC_SUCCESS {
            return WorkCompletion::success(wc.wr_id, opcode, wc.byte_len as usize);
        }

        let reason = unsafe { std::ffi::CStr::from_ptr(ibv_wc_status_str(wc.status)) };

        WorkCompletion::failed(
            wc.wr_id,
            opcode,
            format!("wc status {} ({})", wc.status, reason.to_string_lossy()),
        )
    }
}
