//! Little-endian 9P2000 framing: `size[4] type[1] tag[2] body`.

use std::io::{self, Read};

use super::{Qid, Stat};
use crate::{Error, Result};

pub const TVERSION: u8 = 100;
pub const RVERSION: u8 = 101;
pub const TAUTH: u8 = 102;
pub const TATTACH: u8 = 104;
pub const RATTACH: u8 = 105;
pub const RERROR: u8 = 107;
pub const TFLUSH: u8 = 108;
pub const RFLUSH: u8 = 109;
pub const TWALK: u8 = 110;
pub const RWALK: u8 = 111;
pub const TOPEN: u8 = 112;
pub const ROPEN: u8 = 113;
pub const TCREATE: u8 = 114;
pub const RCREATE: u8 = 115;
pub const TREAD: u8 = 116;
pub const RREAD: u8 = 117;
pub const TWRITE: u8 = 118;
pub const RWRITE: u8 = 119;
pub const TCLUNK: u8 = 120;
pub const RCLUNK: u8 = 121;
pub const TREMOVE: u8 = 122;
pub const RREMOVE: u8 = 123;
pub const TSTAT: u8 = 124;
pub const RSTAT: u8 = 125;
pub const TWSTAT: u8 = 126;
pub const RWSTAT: u8 = 127;

const HEADER_LEN: usize = 7;
const QID_LEN: usize = 13;
/// Stat bytes after the leading size field, excluding string contents.
const STAT_FIXED_LEN: usize = 2 + 4 + QID_LEN + 4 + 4 + 4 + 8 + 4 * 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tmessage {
    Version { msize: u32, version: String },
    Auth { afid: u32, uname: String, aname: String },
    Attach { fid: u32, afid: u32, uname: String, aname: String },
    Flush { oldtag: u16 },
    Walk { fid: u32, newfid: u32, names: Vec<String> },
    Open { fid: u32, mode: u8 },
    Create { fid: u32, name: String, perm: u32, mode: u8 },
    Read { fid: u32, offset: u64, count: u32 },
    Write { fid: u32, offset: u64, data: Vec<u8> },
    Clunk { fid: u32 },
    Remove { fid: u32 },
    Stat { fid: u32 },
    Wstat { fid: u32, stat: Stat },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rmessage {
    Version { msize: u32, version: String },
    Error { ename: String },
    Attach { qid: Qid },
    Flush,
    Walk { qids: Vec<Qid> },
    Open { qid: Qid, iounit: u32 },
    Create { qid: Qid, iounit: u32 },
    Read { data: Vec<u8> },
    Write { count: u32 },
    Clunk,
    Remove,
    Stat { stat: Stat },
    Wstat,
}

/// Read one whole message. Returns `None` on a clean end of stream.
pub fn read_frame<R: Read>(reader: &mut R, max_size: u32) -> io::Result<Option<Vec<u8>>> {
    let mut size = [0u8; 4];
    match reader.read_exact(&mut size) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(size);
    if (len as usize) < HEADER_LEN || len > max_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad 9P message size {len}"),
        ));
    }
    let mut frame = vec![0u8; len as usize];
    frame[..4].copy_from_slice(&size);
    reader.read_exact(&mut frame[4..])?;
    Ok(Some(frame))
}

impl Tmessage {
    pub fn decode(frame: &[u8]) -> Result<(u16, Self)> {
        let mut d = Decoder::new(frame);
        d.u32()?;
        let kind = d.u8()?;
        let tag = d.u16()?;
        let msg = match kind {
            TVERSION => Self::Version {
                msize: d.u32()?,
                version: d.string()?,
            },
            TAUTH => Self::Auth {
                afid: d.u32()?,
                uname: d.string()?,
                aname: d.string()?,
            },
            TATTACH => Self::Attach {
                fid: d.u32()?,
                afid: d.u32()?,
                uname: d.string()?,
                aname: d.string()?,
            },
            TFLUSH => Self::Flush { oldtag: d.u16()? },
            TWALK => {
                let fid = d.u32()?;
                let newfid = d.u32()?;
                let n = d.u16()?;
                let names = (0..n).map(|_| d.string()).collect::<Result<Vec<_>>>()?;
                Self::Walk { fid, newfid, names }
            }
            TOPEN => Self::Open {
                fid: d.u32()?,
                mode: d.u8()?,
            },
            TCREATE => Self::Create {
                fid: d.u32()?,
                name: d.string()?,
                perm: d.u32()?,
                mode: d.u8()?,
            },
            TREAD => Self::Read {
                fid: d.u32()?,
                offset: d.u64()?,
                count: d.u32()?,
            },
            TWRITE => Self::Write {
                fid: d.u32()?,
                offset: d.u64()?,
                data: d.data()?,
            },
            TCLUNK => Self::Clunk { fid: d.u32()? },
            TREMOVE => Self::Remove { fid: d.u32()? },
            TSTAT => Self::Stat { fid: d.u32()? },
            TWSTAT => {
                let fid = d.u32()?;
                d.u16()?;
                Self::Wstat {
                    fid,
                    stat: d.stat()?,
                }
            }
            other => return Err(Error::Protocol(format!("unknown message type {other}")).into()),
        };
        Ok((tag, msg))
    }

    pub fn encode(&self, tag: u16) -> Vec<u8> {
        let mut e;
        match self {
            Self::Version { msize, version } => {
                e = Encoder::new(TVERSION, tag);
                e.u32(*msize);
                e.string(version);
            }
            Self::Auth { afid, uname, aname } => {
                e = Encoder::new(TAUTH, tag);
                e.u32(*afid);
                e.string(uname);
                e.string(aname);
            }
            Self::Attach {
                fid,
                afid,
                uname,
                aname,
            } => {
                e = Encoder::new(TATTACH, tag);
                e.u32(*fid);
                e.u32(*afid);
                e.string(uname);
                e.string(aname);
            }
            Self::Flush { oldtag } => {
                e = Encoder::new(TFLUSH, tag);
                e.u16(*oldtag);
            }
            Self::Walk { fid, newfid, names } => {
                e = Encoder::new(TWALK, tag);
                e.u32(*fid);
                e.u32(*newfid);
                e.u16(names.len() as u16);
                for name in names {
                    e.string(name);
                }
            }
            Self::Open { fid, mode } => {
                e = Encoder::new(TOPEN, tag);
                e.u32(*fid);
                e.u8(*mode);
            }
            Self::Create {
                fid,
                name,
                perm,
                mode,
            } => {
                e = Encoder::new(TCREATE, tag);
                e.u32(*fid);
                e.string(name);
                e.u32(*perm);
                e.u8(*mode);
            }
            Self::Read { fid, offset, count } => {
                e = Encoder::new(TREAD, tag);
                e.u32(*fid);
                e.u64(*offset);
                e.u32(*count);
            }
            Self::Write { fid, offset, data } => {
                e = Encoder::new(TWRITE, tag);
                e.u32(*fid);
                e.u64(*offset);
                e.data(data);
            }
            Self::Clunk { fid } => {
                e = Encoder::new(TCLUNK, tag);
                e.u32(*fid);
            }
            Self::Remove { fid } => {
                e = Encoder::new(TREMOVE, tag);
                e.u32(*fid);
            }
            Self::Stat { fid } => {
                e = Encoder::new(TSTAT, tag);
                e.u32(*fid);
            }
            Self::Wstat { fid, stat } => {
                e = Encoder::new(TWSTAT, tag);
                e.u32(*fid);
                e.u16(stat.wire_len() as u16);
                e.stat(stat);
            }
        }
        e.finish()
    }
}

impl Rmessage {
    pub fn decode(frame: &[u8]) -> Result<(u16, Self)> {
        let mut d = Decoder::new(frame);
        d.u32()?;
        let kind = d.u8()?;
        let tag = d.u16()?;
        let msg = match kind {
            RVERSION => Self::Version {
                msize: d.u32()?,
                version: d.string()?,
            },
            RERROR => Self::Error { ename: d.string()? },
            RATTACH => Self::Attach { qid: d.qid()? },
            RFLUSH => Self::Flush,
            RWALK => {
                let n = d.u16()?;
                let qids = (0..n).map(|_| d.qid()).collect::<Result<Vec<_>>>()?;
                Self::Walk { qids }
            }
            ROPEN => Self::Open {
                qid: d.qid()?,
                iounit: d.u32()?,
            },
            RCREATE => Self::Create {
                qid: d.qid()?,
                iounit: d.u32()?,
            },
            RREAD => Self::Read { data: d.data()? },
            RWRITE => Self::Write { count: d.u32()? },
            RCLUNK => Self::Clunk,
            RREMOVE => Self::Remove,
            RSTAT => {
                d.u16()?;
                Self::Stat { stat: d.stat()? }
            }
            RWSTAT => Self::Wstat,
            other => return Err(Error::Protocol(format!("unknown message type {other}")).into()),
        };
        Ok((tag, msg))
    }

    pub fn encode(&self, tag: u16) -> Vec<u8> {
        let mut e;
        match self {
            Self::Version { msize, version } => {
                e = Encoder::new(RVERSION, tag);
                e.u32(*msize);
                e.string(version);
            }
            Self::Error { ename } => {
                e = Encoder::new(RERROR, tag);
                e.string(ename);
            }
            Self::Attach { qid } => {
                e = Encoder::new(RATTACH, tag);
                e.qid(qid);
            }
            Self::Flush => e = Encoder::new(RFLUSH, tag),
            Self::Walk { qids } => {
                e = Encoder::new(RWALK, tag);
                e.u16(qids.len() as u16);
                for qid in qids {
                    e.qid(qid);
                }
            }
            Self::Open { qid, iounit } => {
                e = Encoder::new(ROPEN, tag);
                e.qid(qid);
                e.u32(*iounit);
            }
            Self::Create { qid, iounit } => {
                e = Encoder::new(RCREATE, tag);
                e.qid(qid);
                e.u32(*iounit);
            }
            Self::Read { data } => {
                e = Encoder::new(RREAD, tag);
                e.data(data);
            }
            Self::Write { count } => {
                e = Encoder::new(RWRITE, tag);
                e.u32(*count);
            }
            Self::Clunk => e = Encoder::new(RCLUNK, tag),
            Self::Remove => e = Encoder::new(RREMOVE, tag),
            Self::Stat { stat } => {
                e = Encoder::new(RSTAT, tag);
                e.u16(stat.wire_len() as u16);
                e.stat(stat);
            }
            Self::Wstat => e = Encoder::new(RWSTAT, tag),
        }
        e.finish()
    }
}

impl Stat {
    /// Encoded size including the leading two-byte size field.
    pub fn wire_len(&self) -> usize {
        2 + STAT_FIXED_LEN
            + self.name.len()
            + self.uid.len()
            + self.gid.len()
            + self.muid.len()
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let mut e = Encoder { buf: std::mem::take(buf) };
        e.stat(self);
        *buf = e.buf;
    }

    /// Decode a sequence of packed stat records, as returned by a directory read.
    pub fn decode_all(mut buf: &[u8]) -> Result<Vec<Stat>> {
        let mut out = Vec::new();
        while !buf.is_empty() {
            let mut d = Decoder::new(buf);
            out.push(d.stat()?);
            buf = d.buf;
        }
        Ok(out)
    }
}

struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    fn new(kind: u8, tag: u16) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&[0; 4]);
        buf.push(kind);
        buf.extend_from_slice(&tag.to_le_bytes());
        Self { buf }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn string(&mut self, s: &str) {
        self.u16(s.len() as u16);
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn data(&mut self, data: &[u8]) {
        self.u32(data.len() as u32);
        self.buf.extend_from_slice(data);
    }

    fn qid(&mut self, qid: &Qid) {
        self.u8(qid.qtype);
        self.u32(qid.version);
        self.u64(qid.path);
    }

    fn stat(&mut self, stat: &Stat) {
        self.u16((stat.wire_len() - 2) as u16);
        self.u16(stat.dev_type);
        self.u32(stat.dev);
        self.qid(&stat.qid);
        self.u32(stat.mode);
        self.u32(stat.atime);
        self.u32(stat.mtime);
        self.u64(stat.length);
        self.string(&stat.name);
        self.string(&stat.uid);
        self.string(&stat.gid);
        self.string(&stat.muid);
    }

    fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[..4].copy_from_slice(&len.to_le_bytes());
        self.buf
    }
}

struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(Error::Protocol("short 9P message".into()).into());
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn string(&mut self) -> Result<String> {
        let n = self.u16()? as usize;
        let raw = self.take(n)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| Error::Protocol("string is not valid UTF-8".into()).into())
    }

    fn data(&mut self) -> Result<Vec<u8>> {
        let n = self.u32()? as usize;
        Ok(self.take(n)?.to_vec())
    }

    fn qid(&mut self) -> Result<Qid> {
        Ok(Qid {
            qtype: self.u8()?,
            version: self.u32()?,
            path: self.u64()?,
        })
    }

    fn stat(&mut self) -> Result<Stat> {
        let size = self.u16()? as usize;
        let mut d = Decoder::new(self.take(size)?);
        Ok(Stat {
            dev_type: d.u16()?,
            dev: d.u32()?,
            qid: d.qid()?,
            mode: d.u32()?,
            atime: d.u32()?,
            mtime: d.u32()?,
            length: d.u64()?,
            name: d.string()?,
            uid: d.string()?,
            gid: d.string()?,
            muid: d.string()?,
        })
    }
}
