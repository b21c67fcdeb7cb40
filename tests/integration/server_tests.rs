use std::{
    fs,
    io::Write,
    os::unix::net::UnixStream,
    sync::Arc,
    thread::{self, JoinHandle},
};

use tempfile::{tempdir, TempDir};
use unionfs::config::Config;
use unionfs::fs::{Branch, UnionFs};
use unionfs::ninep::{
    server::MAX_MSIZE, wire::read_frame, Rmessage, Server, Stat, Tmessage, DMDIR, NOFID, OREAD,
    ORDWR,
};

struct Client {
    stream: UnixStream,
    next_tag: u16,
}

impl Client {
    fn rpc(&mut self, msg: Tmessage) -> Rmessage {
        let tag = self.next_tag;
        self.next_tag += 1;
        self.stream.write_all(&msg.encode(tag)).unwrap();
        let frame = read_frame(&mut self.stream, MAX_MSIZE)
            .unwrap()
            .expect("server closed the connection");
        let (rtag, reply) = Rmessage::decode(&frame).unwrap();
        assert_eq!(rtag, tag);
        reply
    }

    fn ok(&mut self, msg: Tmessage) -> Rmessage {
        match self.rpc(msg) {
            Rmessage::Error { ename } => panic!("unexpected Rerror: {ename}"),
            reply => reply,
        }
    }

    fn error(&mut self, msg: Tmessage) -> String {
        match self.rpc(msg) {
            Rmessage::Error { ename } => ename,
            reply => panic!("expected Rerror, got {reply:?}"),
        }
    }

    fn handshake(&mut self) {
        self.ok(Tmessage::Version {
            msize: 65536,
            version: "9P2000".into(),
        });
        self.ok(Tmessage::Attach {
            fid: 0,
            afid: NOFID,
            uname: "tester".into(),
            aname: String::new(),
        });
    }

    fn walk(&mut self, fid: u32, newfid: u32, names: &[&str]) -> Rmessage {
        self.rpc(Tmessage::Walk {
            fid,
            newfid,
            names: names.iter().map(|n| n.to_string()).collect(),
        })
    }
}

struct Harness {
    upper: TempDir,
    lower: TempDir,
    client: Client,
    server: JoinHandle<unionfs::Result<()>>,
}

fn start() -> unionfs::Result<Harness> {
    start_with(|server| server)
}

fn start_with(configure: impl FnOnce(Server) -> Server) -> unionfs::Result<Harness> {
    let upper = tempdir()?;
    let lower = tempdir()?;
    let fs = UnionFs::new(Config::new(vec![
        Branch::new(upper.path()),
        Branch::new(lower.path()),
    ]))?;
    let server = configure(Server::new(Arc::new(fs)).chatty(true));

    let (client_side, server_side) = UnixStream::pair()?;
    let reader = server_side.try_clone()?;
    let handle = thread::spawn(move || server.serve(reader, server_side));
    Ok(Harness {
        upper,
        lower,
        client: Client {
            stream: client_side,
            next_tag: 1,
        },
        server: handle,
    })
}

impl Harness {
    fn finish(self) -> unionfs::Result<()> {
        drop(self.client);
        self.server.join().expect("server thread panicked")
    }
}

#[test]
fn version_negotiation_clamps_msize() -> unionfs::Result<()> {
    let mut h = start()?;
    let reply = h.client.ok(Tmessage::Version {
        msize: 1 << 20,
        version: "9P2000.L".into(),
    });
    assert_eq!(
        reply,
        Rmessage::Version {
            msize: MAX_MSIZE,
            version: "9P2000".into()
        }
    );

    let reply = h.client.ok(Tmessage::Version {
        msize: 4096,
        version: "9P1".into(),
    });
    assert_eq!(
        reply,
        Rmessage::Version {
            msize: 4096,
            version: "unknown".into()
        }
    );
    h.finish()
}

#[test]
fn attach_walk_open_read_stat_clunk() -> unionfs::Result<()> {
    let mut h = start()?;
    fs::create_dir(h.lower.path().join("etc"))?;
    fs::write(h.lower.path().join("etc/motd"), b"welcome")?;
    fs::create_dir(h.upper.path().join("etc"))?;
    fs::write(h.upper.path().join("etc/motd"), b"upper wins")?;
    h.client.handshake();

    let Rmessage::Walk { qids } = h.client.walk(0, 1, &["etc", "motd"]) else {
        panic!("walk failed");
    };
    assert_eq!(qids.len(), 2);
    assert!(qids[0].is_dir());

    let Rmessage::Open { qid, iounit } = h.client.ok(Tmessage::Open { fid: 1, mode: OREAD })
    else {
        panic!("open failed");
    };
    assert_eq!(qid, qids[1]);
    assert!(iounit > 0 && iounit <= MAX_MSIZE - 24);

    let reply = h.client.ok(Tmessage::Read {
        fid: 1,
        offset: 0,
        count: 100,
    });
    assert_eq!(
        reply,
        Rmessage::Read {
            data: b"upper wins".to_vec()
        }
    );

    let Rmessage::Stat { stat } = h.client.ok(Tmessage::Stat { fid: 1 }) else {
        panic!("stat failed");
    };
    assert_eq!(stat.name, "motd");
    assert_eq!(stat.length, 10);
    assert_eq!(stat.qid, qid);

    assert_eq!(h.client.ok(Tmessage::Clunk { fid: 1 }), Rmessage::Clunk);
    assert_eq!(h.client.error(Tmessage::Clunk { fid: 1 }), "unknown fid 1");
    h.finish()
}

#[test]
fn directory_read_returns_packed_stats() -> unionfs::Result<()> {
    let mut h = start()?;
    fs::write(h.upper.path().join("a"), b"")?;
    fs::write(h.lower.path().join("a"), b"")?;
    fs::write(h.lower.path().join("b"), b"")?;
    fs::create_dir(h.lower.path().join("c"))?;
    h.client.handshake();

    h.client.walk(0, 1, &[]);
    h.client.ok(Tmessage::Open { fid: 1, mode: OREAD });
    let Rmessage::Read { data } = h.client.ok(Tmessage::Read {
        fid: 1,
        offset: 0,
        count: 8192,
    }) else {
        panic!("read failed");
    };
    let mut names: Vec<String> = Stat::decode_all(&data)?
        .into_iter()
        .map(|s| {
            assert_eq!(s.is_dir(), s.name == "c");
            s.name
        })
        .collect();
    names.sort();
    assert_eq!(names, vec!["a", "b", "c"]);

    let ename = h.client.error(Tmessage::Read {
        fid: 1,
        offset: 1,
        count: 8192,
    });
    assert!(ename.contains("bad offset"), "{ename}");
    h.finish()
}

#[test]
fn walk_errors_and_partial_walks() -> unionfs::Result<()> {
    let mut h = start()?;
    fs::create_dir(h.upper.path().join("d"))?;
    h.client.handshake();

    assert_eq!(
        h.client.walk(0, 1, &["nope"]),
        Rmessage::Error {
            ename: "file does not exist".into()
        }
    );

    let Rmessage::Walk { qids } = h.client.walk(0, 1, &["d", "nope"]) else {
        panic!("partial walk should succeed");
    };
    assert_eq!(qids.len(), 1);
    // newfid is not bound after a partial walk.
    assert_eq!(h.client.error(Tmessage::Stat { fid: 1 }), "unknown fid 1");

    h.client.walk(0, 1, &["d"]);
    assert_eq!(
        h.client.walk(0, 1, &["d"]),
        Rmessage::Error {
            ename: "fid 1 already in use".into()
        }
    );

    // Walking in place rebinds the fid itself.
    let Rmessage::Walk { qids } = h.client.walk(1, 1, &[".."]) else {
        panic!("in-place walk failed");
    };
    let Rmessage::Stat { stat } = h.client.ok(Tmessage::Stat { fid: 1 }) else {
        panic!("stat failed");
    };
    assert_eq!(stat.qid, qids[0]);
    assert_eq!(stat.name, "/");
    h.finish()
}

#[test]
fn create_write_remove_round_trip() -> unionfs::Result<()> {
    let mut h = start()?;
    fs::create_dir(h.lower.path().join("deep"))?;
    h.client.handshake();

    h.client.walk(0, 1, &["deep"]);
    let Rmessage::Create { qid, .. } = h.client.ok(Tmessage::Create {
        fid: 1,
        name: "note".into(),
        perm: 0o644,
        mode: ORDWR,
    }) else {
        panic!("create failed");
    };
    assert!(!qid.is_dir());
    assert_eq!(
        h.client.ok(Tmessage::Write {
            fid: 1,
            offset: 0,
            data: b"kept".to_vec()
        }),
        Rmessage::Write { count: 4 }
    );
    assert_eq!(fs::read(h.upper.path().join("deep/note"))?, b"kept");

    let Rmessage::Walk { qids } = h.client.walk(0, 2, &["deep", "note"]) else {
        panic!("walk to new file failed");
    };
    assert_eq!(qids[1], qid);

    assert_eq!(h.client.ok(Tmessage::Remove { fid: 2 }), Rmessage::Remove);
    assert!(!h.upper.path().join("deep/note").exists());
    assert_eq!(h.client.error(Tmessage::Stat { fid: 2 }), "unknown fid 2");
    h.finish()
}

#[test]
fn failed_remove_still_clunks_and_reports_native_error() -> unionfs::Result<()> {
    let mut h = start()?;
    fs::create_dir(h.upper.path().join("full"))?;
    fs::write(h.upper.path().join("full/child"), b"")?;
    h.client.handshake();

    h.client.walk(0, 1, &["full"]);
    let ename = h.client.error(Tmessage::Remove { fid: 1 });
    assert_eq!(ename, "Directory not empty");
    assert_eq!(h.client.error(Tmessage::Clunk { fid: 1 }), "unknown fid 1");

    h.client.walk(0, 2, &[]);
    let ename = h.client.error(Tmessage::Remove { fid: 2 });
    assert!(ename.contains("not supported"), "{ename}");
    h.finish()
}

#[test]
fn auth_is_refused_and_flush_is_answered() -> unionfs::Result<()> {
    let mut h = start()?;
    h.client.ok(Tmessage::Version {
        msize: 8192,
        version: "9P2000".into(),
    });
    assert_eq!(
        h.client.error(Tmessage::Auth {
            afid: 5,
            uname: "tester".into(),
            aname: String::new(),
        }),
        "authentication not required"
    );
    assert_eq!(h.client.ok(Tmessage::Flush { oldtag: 999 }), Rmessage::Flush);
    h.finish()
}

#[test]
fn create_directory_and_wstat_rename() -> unionfs::Result<()> {
    let mut h = start()?;
    h.client.handshake();

    h.client.walk(0, 1, &[]);
    let Rmessage::Create { qid, .. } = h.client.ok(Tmessage::Create {
        fid: 1,
        name: "dir".into(),
        perm: DMDIR | 0o755,
        mode: OREAD,
    }) else {
        panic!("create failed");
    };
    assert!(qid.is_dir());
    h.client.ok(Tmessage::Clunk { fid: 1 });

    h.client.walk(0, 2, &["dir"]);
    let mut rename = Stat::dont_touch();
    rename.name = "renamed".into();
    assert_eq!(
        h.client.ok(Tmessage::Wstat { fid: 2, stat: rename }),
        Rmessage::Wstat
    );
    assert!(h.upper.path().join("renamed").is_dir());
    let Rmessage::Stat { stat } = h.client.ok(Tmessage::Stat { fid: 2 }) else {
        panic!("stat failed");
    };
    assert_eq!(stat.name, "renamed");
    h.finish()
}

#[test]
fn pipelined_requests_all_answer_with_one_worker() -> unionfs::Result<()> {
    let mut h = start_with(|server| server.max_workers(1))?;
    fs::write(h.lower.path().join("f"), b"data")?;
    h.client.handshake();

    let mut batch = Vec::new();
    let tags: Vec<u16> = (100..140).collect();
    for (i, &tag) in tags.iter().enumerate() {
        let msg = match i % 3 {
            0 => Tmessage::Stat { fid: 0 },
            1 => Tmessage::Walk {
                fid: 0,
                newfid: 1000 + i as u32,
                names: vec!["f".into()],
            },
            _ => Tmessage::Clunk {
                fid: 1000 + i as u32 - 1,
            },
        };
        batch.extend(msg.encode(tag));
    }
    h.client.stream.write_all(&batch)?;

    let mut answered = Vec::new();
    for _ in &tags {
        let frame = read_frame(&mut h.client.stream, MAX_MSIZE)?.expect("reply");
        let (tag, reply) = Rmessage::decode(&frame)?;
        assert!(
            !matches!(reply, Rmessage::Error { .. }),
            "tag {tag}: {reply:?}"
        );
        answered.push(tag);
    }
    // One worker runs requests strictly in arrival order.
    assert_eq!(answered, tags);
    h.finish()
}
