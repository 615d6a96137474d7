use std::io::{self, Read, Write};

use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Queue pair coordinates exchanged over the side channel before the QP is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct QpInfo {
    pub lid: u16,
    reserved: u16,
    pub qpn: u32,
    pub psn: u32,
    pub gid: [u8; 16],
}

impl QpInfo {
    pub fn new(lid: u16, qpn: u32, psn: u32, gid: [u8; 16]) -> Self {
        QpInfo {
            lid,
            reserved: 0,
            qpn,
            psn,
            gid,
        }
    }

    pub fn has_gid(&self) -> bool {
        self.gid.iter().any(|b| *b != 0)
    }

    pub fn write_to(&self, stream: &mut impl Write) -> io::Result<()> {
        stream.write_all(self.as_bytes())
    }

    pub fn read_from(stream: &mut impl Read) -> io::Result<Self> {
        let mut info = QpInfo::new_zeroed();
        stream.read_exact(info.as_bytes_mut())?;
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qp_info_crosses_a_byte_stream() {
        let info = QpInfo::new(7, 0x1234, 0xabcdef, [1; 16]);

        let mut wire = Vec::new();
        info.write_to(&mut wire).unwrap();
        assert_eq!(wire.len(), std::mem::size_of::<QpInfo>());

        let decoded = QpInfo::read_from(&mut wire.as_slice()).unwrap();
        assert_eq!(decoded, info);
        assert!(decoded.has_gid());
        assert!(!QpInfo::new(1, 2, 3, [0; 16]).has_gid());
    }
}
