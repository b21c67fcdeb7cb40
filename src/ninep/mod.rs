//! 9P2000 protocol types, wire codec and the request server.

pub mod server;
pub mod wire;

pub use server::Server;
pub use wire::{Rmessage, Tmessage};

pub const VERSION_9P2000: &str = "9P2000";
pub const NOTAG: u16 = 0xffff;
pub const NOFID: u32 = 0xffff_ffff;
/// Bytes of framing in a Tread/Rwrite-style message: size, type, tag, fid, offset, count.
pub const IOHDRSZ: u32 = 24;
pub const MAX_WALK_ELEMENTS: usize = 16;

// Qid.qtype bits.
pub const QTDIR: u8 = 0x80;
pub const QTAPPEND: u8 = 0x40;
pub const QTEXCL: u8 = 0x20;
pub const QTAUTH: u8 = 0x08;
pub const QTTMP: u8 = 0x04;
pub const QTFILE: u8 = 0x00;

// Stat.mode bits.
pub const DMDIR: u32 = 0x8000_0000;
pub const DMAPPEND: u32 = 0x4000_0000;
pub const DMEXCL: u32 = 0x2000_0000;
pub const DMTMP: u32 = 0x0400_0000;
pub const DMPERM: u32 = 0o777;

// Open modes.
pub const OREAD: u8 = 0;
pub const OWRITE: u8 = 1;
pub const ORDWR: u8 = 2;
pub const OEXEC: u8 = 3;
pub const OTRUNC: u8 = 0x10;
pub const ORCLOSE: u8 = 0x40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Qid {
    pub qtype: u8,
    pub version: u32,
    pub path: u64,
}

impl Qid {
    pub fn is_dir(&self) -> bool {
        self.qtype & QTDIR != 0
    }
}

/// A 9P directory entry, the unit of `stat`, `wstat` and directory reads.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Stat {
    pub dev_type: u16,
    pub dev: u32,
    pub qid: Qid,
    pub mode: u32,
    pub atime: u32,
    pub mtime: u32,
    pub length: u64,
    pub name: String,
    pub uid: String,
    pub gid: String,
    pub muid: String,
}

impl Stat {
    /// A wstat template in which every field means "leave unchanged".
    pub fn dont_touch() -> Self {
        Self {
            dev_type: u16::MAX,
            dev: u32::MAX,
            qid: Qid {
                qtype: u8::MAX,
                version: u32::MAX,
                path: u64::MAX,
            },
            mode: u32::MAX,
            atime: u32::MAX,
            mtime: u32::MAX,
            length: u64::MAX,
            ..Default::default()
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & DMDIR != 0
    }
}

/// Access part of a 9P open mode, without the OTRUNC/ORCLOSE flags.
pub fn open_access(mode: u8) -> u8 {
    mode & 3
}

pub fn open_wants_write(mode: u8) -> bool {
    matches!(open_access(mode), OWRITE | ORDWR) || mode & OTRUNC != 0
}
