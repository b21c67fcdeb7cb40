//! 9P request loop.
//!
//! One reader decodes requests from the connection; every request except
//! `Tversion` runs on a scoped worker thread so slow branch I/O on one fid
//! does not hold up the others. At most [`Server::max_workers`] workers run
//! per connection; the reader stops reading while all of them are busy.
//! Requests on the same fid are serialised by that fid's mutex. Replies go
//! out through a shared writer lock.

use std::{
    collections::HashSet,
    io::{self, Read, Write},
    os::unix::net::UnixListener,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    thread,
};

use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info_span, warn};
use uuid::Uuid;

use super::{
    wire::{read_frame, Rmessage, Tmessage},
    IOHDRSZ, NOFID, VERSION_9P2000,
};
use crate::fs::{
    fid::Fid,
    handlers::{UnionFs, DEFAULT_IOUNIT},
};
use crate::logging::{log_session_metrics, SessionSnapshot};
use crate::{Error, Result};

pub const MAX_MSIZE: u32 = DEFAULT_IOUNIT + IOHDRSZ;
const MIN_MSIZE: u32 = 256;
pub const DEFAULT_MAX_WORKERS: usize = 32;

#[derive(Debug, Clone)]
pub struct Server {
    fs: Arc<UnionFs>,
    chatty: bool,
    max_workers: usize,
}

impl Server {
    pub fn new(fs: Arc<UnionFs>) -> Self {
        Self {
            fs,
            chatty: false,
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }

    /// Cap on concurrently running requests per connection. At least one.
    pub fn max_workers(mut self, limit: usize) -> Self {
        self.max_workers = limit.max(1);
        self
    }

    /// Log every request and reply at debug level.
    pub fn chatty(mut self, on: bool) -> Self {
        self.chatty = on;
        self
    }

    pub fn fs(&self) -> &Arc<UnionFs> {
        &self.fs
    }

    /// Serve one connection until the peer closes it.
    pub fn serve<R: Read, W: Write + Send>(&self, mut reader: R, writer: W) -> Result<()> {
        let session = Session::new(&self.fs, writer, self.chatty);
        let slots = WorkerSlots::new(self.max_workers);
        let span = info_span!("session", id = %session.id);
        let _enter = span.enter();
        debug!("session started");

        let result = thread::scope(|scope| -> Result<()> {
            while let Some(frame) = read_frame(&mut reader, session.msize())? {
                let (tag, msg) = match Tmessage::decode(&frame) {
                    Ok(decoded) => decoded,
                    Err(err) => {
                        let tag = u16::from_le_bytes([frame[5], frame[6]]);
                        warn!(tag, %err, "undecodable request");
                        session.send(tag, &Rmessage::Error { ename: err.to_string() });
                        continue;
                    }
                };
                session.begin(tag);
                if matches!(msg, Tmessage::Version { .. }) {
                    session.handle(tag, msg);
                    continue;
                }
                let slot = slots.acquire();
                let session = &session;
                let span = span.clone();
                scope.spawn(move || {
                    let _enter = span.enter();
                    session.handle(tag, msg);
                    drop(slot);
                });
            }
            Ok(())
        });

        debug!(peak_workers = slots.peak(), "session finished");
        log_session_metrics(&session.id.to_string(), session.snapshot());
        result
    }

    /// Accept connections forever, one thread per connection.
    pub fn serve_unix(&self, listener: UnixListener) -> Result<()> {
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(%err, "accept failed");
                    continue;
                }
            };
            let server = self.clone();
            thread::spawn(move || {
                let reader = match stream.try_clone() {
                    Ok(reader) => reader,
                    Err(err) => {
                        warn!(%err, "cannot clone connection");
                        return;
                    }
                };
                if let Err(err) = server.serve(reader, stream) {
                    warn!(%err, "connection ended with error");
                }
            });
        }
        Ok(())
    }
}

/// Counting limiter for request workers.
struct WorkerSlots {
    limit: usize,
    busy: Mutex<(usize, usize)>,
    freed: Condvar,
}

impl WorkerSlots {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            busy: Mutex::new((0, 0)),
            freed: Condvar::new(),
        }
    }

    /// Block until a worker may start.
    fn acquire(&self) -> WorkerSlot<'_> {
        let mut busy = self.busy.lock();
        while busy.0 >= self.limit {
            self.freed.wait(&mut busy);
        }
        busy.0 += 1;
        busy.1 = busy.1.max(busy.0);
        WorkerSlot { slots: self }
    }

    fn peak(&self) -> usize {
        self.busy.lock().1
    }
}

struct WorkerSlot<'a> {
    slots: &'a WorkerSlots,
}

impl Drop for WorkerSlot<'_> {
    fn drop(&mut self) {
        self.slots.busy.lock().0 -= 1;
        self.slots.freed.notify_one();
    }
}

struct Session<'a, W> {
    id: Uuid,
    fs: &'a UnionFs,
    chatty: bool,
    msize: AtomicU32,
    fids: DashMap<u32, Arc<Mutex<Fid>>>,
    writer: Mutex<W>,
    inflight: Mutex<HashSet<u16>>,
    finished: Condvar,
    requests: AtomicU64,
    errors: AtomicU64,
}

impl<'a, W: Write + Send> Session<'a, W> {
    fn new(fs: &'a UnionFs, writer: W, chatty: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            fs,
            chatty,
            msize: AtomicU32::new(MAX_MSIZE),
            fids: DashMap::new(),
            writer: Mutex::new(writer),
            inflight: Mutex::new(HashSet::new()),
            finished: Condvar::new(),
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    fn msize(&self) -> u32 {
        self.msize.load(Ordering::Relaxed)
    }

    fn iounit(&self) -> u32 {
        (self.msize() - IOHDRSZ).min(self.fs.iounit())
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            fids_open: self.fids.len(),
        }
    }

    fn begin(&self, tag: u16) {
        self.inflight.lock().insert(tag);
    }

    fn finish(&self, tag: u16) {
        self.inflight.lock().remove(&tag);
        self.finished.notify_all();
    }

    fn handle(&self, tag: u16, msg: Tmessage) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if self.chatty {
            debug!(tag, ?msg, "<-");
        }
        let reply = match self.dispatch(tag, msg) {
            Ok(reply) => reply,
            Err(err) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                Rmessage::Error { ename: ename(&err) }
            }
        };
        if self.chatty {
            debug!(tag, ?reply, "->");
        }
        self.send(tag, &reply);
        self.finish(tag);
    }

    fn send(&self, tag: u16, reply: &Rmessage) {
        let frame = reply.encode(tag);
        let mut writer = self.writer.lock();
        if let Err(err) = writer.write_all(&frame).and_then(|_| writer.flush()) {
            warn!(tag, %err, "reply lost");
        }
    }

    fn fid(&self, fid: u32) -> Result<Arc<Mutex<Fid>>> {
        self.fids
            .get(&fid)
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| Error::UnknownFid(fid).into())
    }

    fn insert_fid(&self, fid: u32, state: Fid) -> Result<()> {
        match self.fids.entry(fid) {
            Entry::Occupied(_) => Err(Error::FidInUse(fid).into()),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(state)));
                Ok(())
            }
        }
    }

    fn dispatch(&self, tag: u16, msg: Tmessage) -> Result<Rmessage> {
        let fs = self.fs;
        match msg {
            Tmessage::Version { msize, version } => {
                if msize < MIN_MSIZE {
                    return Err(Error::Protocol(format!("msize {msize} too small")).into());
                }
                let msize = msize.min(MAX_MSIZE);
                self.msize.store(msize, Ordering::Relaxed);
                self.fids.clear();
                let version = if version.starts_with(VERSION_9P2000) {
                    VERSION_9P2000
                } else {
                    "unknown"
                };
                Ok(Rmessage::Version {
                    msize,
                    version: version.into(),
                })
            }
            Tmessage::Auth { .. } => Err(Error::NoAuth.into()),
            Tmessage::Attach {
                fid, afid, uname, ..
            } => {
                if afid != NOFID {
                    return Err(Error::NoAuth.into());
                }
                let state = fs.attach(&uname);
                let qid = state.qid();
                self.insert_fid(fid, state)?;
                Ok(Rmessage::Attach { qid })
            }
            Tmessage::Flush { oldtag } => {
                let mut inflight = self.inflight.lock();
                while oldtag != tag && inflight.contains(&oldtag) {
                    self.finished.wait(&mut inflight);
                }
                Ok(Rmessage::Flush)
            }
            Tmessage::Walk { fid, newfid, names } => {
                let src = self.fid(fid)?;
                if newfid != fid && self.fids.contains_key(&newfid) {
                    return Err(Error::FidInUse(newfid).into());
                }
                let walked = fs.walk(&src.lock(), &names)?;
                if let Some(state) = walked.fid {
                    if newfid == fid {
                        *src.lock() = state;
                    } else {
                        self.insert_fid(newfid, state)?;
                    }
                }
                Ok(Rmessage::Walk { qids: walked.qids })
            }
            Tmessage::Open { fid, mode } => {
                let f = self.fid(fid)?;
                let mut state = f.lock();
                let iounit = fs.open(&mut state, mode)?.min(self.iounit());
                Ok(Rmessage::Open {
                    qid: state.qid(),
                    iounit,
                })
            }
            Tmessage::Create {
                fid,
                name,
                perm,
                mode,
            } => {
                let f = self.fid(fid)?;
                let mut state = f.lock();
                let (qid, iounit) = fs.create(&mut state, &name, perm, mode)?;
                Ok(Rmessage::Create {
                    qid,
                    iounit: iounit.min(self.iounit()),
                })
            }
            Tmessage::Read { fid, offset, count } => {
                let f = self.fid(fid)?;
                let mut state = f.lock();
                let data = fs.read(&mut state, offset, count.min(self.iounit()))?;
                Ok(Rmessage::Read {
                    data: data.into_bytes(),
                })
            }
            Tmessage::Write { fid, offset, data } => {
                let f = self.fid(fid)?;
                let mut state = f.lock();
                let count = fs.write(&mut state, offset, &data)?;
                Ok(Rmessage::Write { count })
            }
            Tmessage::Clunk { fid } => {
                let (_, f) = self
                    .fids
                    .remove(&fid)
                    .ok_or_else(|| Error::UnknownFid(fid))?;
                drop(f);
                Ok(Rmessage::Clunk)
            }
            Tmessage::Remove { fid } => {
                let (_, f) = self
                    .fids
                    .remove(&fid)
                    .ok_or_else(|| Error::UnknownFid(fid))?;
                let result = fs.remove(&f.lock());
                drop(f);
                result?;
                Ok(Rmessage::Remove)
            }
            Tmessage::Stat { fid } => {
                let f = self.fid(fid)?;
                let stat = fs.stat(&f.lock());
                Ok(Rmessage::Stat { stat })
            }
            Tmessage::Wstat { fid, stat } => {
                let f = self.fid(fid)?;
                let mut state = f.lock();
                fs.wstat(&mut state, &stat)?;
                Ok(Rmessage::Wstat)
            }
        }
    }
}

/// Error text for an Rerror. Native errors keep the OS message without the
/// "(os error N)" suffix so clients can map it back to an errno.
pub fn ename(err: &anyhow::Error) -> String {
    let io_err = err
        .downcast_ref::<io::Error>()
        .or_else(|| match err.downcast_ref::<Error>() {
            Some(Error::Io(e)) => Some(e),
            _ => None,
        });
    if let Some(io_err) = io_err {
        if let Some(code) = io_err.raw_os_error() {
            let text = io_err.to_string();
            let suffix = format!(" (os error {code})");
            return text.strip_suffix(&suffix).unwrap_or(&text).to_string();
        }
    }
    err.to_string()
}
