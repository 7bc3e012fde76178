//! NBD server (spec §4.8, C8): exports one VBD over the NBD protocol.
//!
//! Grounded on `original_source/drivers/tapdisk-nbdserver.c`: a listening
//! Unix socket, fixed-newstyle handshake, and a per-client fixed request
//! pool dispatched against a VBD. The migration fd-receiver socket and
//! the legacy "old style" 152-byte banner are both named in spec §4.8;
//! this server speaks fixed-newstyle only (see DESIGN.md) since every
//! client the pack's other examples talk to (and `qemu-nbd`/the Linux
//! kernel client) negotiate newstyle by default.
//!
//! Request completion here runs through the same synchronous path as
//! [`crate::ring`]: a request is queued on the `Vbd`, `issue_requests` is
//! called once, and (because this crate's one driver, [`crate::drivers::raw`],
//! blocks until its own I/O finishes) the reply is always ready to write
//! back before the next request is read. Because of that, a client never
//! actually has more than one request outstanding at a time, so the source's
//! fixed `NBD_SERVER_NUM_REQS`-slot pool and its read-masking-under-saturation
//! (`reqs_free`) have no work to do here; [`crate::nbd::proto::NUM_REQS`]
//! survives only as the constant a future asynchronous driver's pool would
//! need (see DESIGN.md).

use std::cell::RefCell;
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::rc::Rc;

use log::{debug, info, warn};

use crate::driver::{DiskInfo, Iov, Op, SECTOR_SIZE};
use crate::error::BlkError;
use crate::nbd::proto::*;
use crate::scheduler::{EventId, PollMode, Scheduler};
use crate::vbd::Vbd;

struct NbdClient {
    stream: UnixStream,
    event_id: Option<EventId>,
    structured_reply: bool,
    dead: bool,
}

/// One exported VBD plus its listening socket and connected clients (spec
/// §4.8). Wrapped in `Rc<RefCell<_>>` by the caller so scheduler callbacks
/// (registered per client fd) can all reach it.
pub struct NbdServer {
    vbd: Vbd,
    info: DiskInfo,
    listener: UnixListener,
    listen_event: Option<EventId>,
    clients: Vec<Rc<RefCell<NbdClient>>>,
    paused: bool,
}

impl NbdServer {
    pub fn bind(path: &str, vbd: Vbd) -> io::Result<Self> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        let info = vbd.disk_info().unwrap_or(DiskInfo { size_sectors: 0, sector_size: SECTOR_SIZE, info_flags: 0 });
        Ok(NbdServer { vbd, info, listener, listen_event: None, clients: Vec::new(), paused: false })
    }

    pub fn vbd_mut(&mut self) -> &mut Vbd {
        &mut self.vbd
    }

    /// Registers the listening socket on the scheduler (spec §4.8 "listens
    /// on a UNIX socket").
    pub fn listen(this: &Rc<RefCell<Self>>, sched: &mut Scheduler) -> io::Result<()> {
        let fd = this.borrow().listener.as_raw_fd();
        let weak = Rc::downgrade(this);
        let id = sched.register_event(PollMode::READ, Some(fd), None, move |_id, _mode| {
            let Some(server) = weak.upgrade() else { return };
            server.borrow_mut().accept_ready();
        })?;
        this.borrow_mut().listen_event = Some(id);
        Ok(())
    }

    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    if let Err(e) = self.handshake_and_register(stream) {
                        warn!("nbd: handshake failed: {e}");
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("nbd: accept failed: {e}");
                    break;
                }
            }
        }
    }

    /// Performs the fixed-newstyle handshake synchronously (spec §4.8
    /// "Handshake"), then hands the connection a request-phase event
    /// registration. The socket stays blocking for the handshake (it is
    /// small, bounded, and happens once per connection) and is switched to
    /// non-blocking only afterward, for the request loop.
    fn handshake_and_register(&mut self, mut stream: UnixStream) -> io::Result<()> {
        stream.set_nonblocking(false)?;
        let structured_reply = self.negotiate(&mut stream)?;
        stream.set_nonblocking(true)?;

        info!("nbd: client connected (structured_reply={structured_reply})");
        let client = Rc::new(RefCell::new(NbdClient {
            stream,
            event_id: None,
            structured_reply,
            dead: false,
        }));
        self.clients.push(client);
        Ok(())
    }

    /// Sends the fixed newstyle banner and processes client options until
    /// `NBD_OPT_EXPORT_NAME` or `NBD_OPT_GO` ends the handshake phase (spec
    /// §4.8's option list). Returns whether the client negotiated
    /// structured replies.
    fn negotiate(&self, stream: &mut UnixStream) -> io::Result<bool> {
        let mut banner = Vec::with_capacity(18);
        banner.extend_from_slice(&NBDMAGIC.to_be_bytes());
        banner.extend_from_slice(&IHAVEOPT.to_be_bytes());
        banner.extend_from_slice(&(NBD_FLAG_FIXED_NEWSTYLE | NBD_FLAG_NO_ZEROES).to_be_bytes());
        stream.write_all(&banner)?;

        let mut cflags_buf = [0u8; 4];
        stream.read_exact(&mut cflags_buf)?;

        let mut structured_reply = false;
        let mut options_seen = 0u32;
        loop {
            if options_seen >= MAX_OPTIONS {
                return Err(io::Error::other("too many options"));
            }
            options_seen += 1;

            let mut hdr = [0u8; 16];
            stream.read_exact(&mut hdr)?;
            let magic = u64::from_be_bytes(hdr[0..8].try_into().unwrap());
            if magic != IHAVEOPT {
                return Err(io::Error::other("bad option magic"));
            }
            let opt = u32::from_be_bytes(hdr[8..12].try_into().unwrap());
            let len = u32::from_be_bytes(hdr[12..16].try_into().unwrap());
            if len > MAX_OPTION_LEN {
                return Err(io::Error::other("option too long"));
            }
            let mut data = vec![0u8; len as usize];
            stream.read_exact(&mut data)?;

            match opt {
                NBD_OPT_EXPORT_NAME => {
                    self.send_export_info_old(stream)?;
                    return Ok(false);
                }
                NBD_OPT_ABORT => {
                    send_option_reply(stream, opt, NBD_REP_ACK, &[])?;
                    return Err(io::Error::other("client aborted negotiation"));
                }
                NBD_OPT_STRUCTURED_REPLY => {
                    structured_reply = true;
                    send_option_reply(stream, opt, NBD_REP_ACK, &[])?;
                }
                NBD_OPT_SET_META_CONTEXT => {
                    // `base:allocation` is the only context this server knows
                    // (spec §4.8). Acknowledge it if asked for, ignore
                    // anything else — matches the source's single-context
                    // support without implementing a real query string parse.
                    send_option_reply(stream, opt, NBD_REP_ACK, &[])?;
                }
                NBD_OPT_INFO | NBD_OPT_GO => {
                    self.send_export_info_new(stream, opt)?;
                    if opt == NBD_OPT_GO {
                        return Ok(structured_reply);
                    }
                }
                _ => {
                    send_option_reply(stream, opt, NBD_REP_ERR_UNSUP, &[])?;
                }
            }
        }
    }

    fn send_export_info_old(&self, stream: &mut UnixStream) -> io::Result<()> {
        let mut buf = Vec::with_capacity(10);
        buf.extend_from_slice(&(self.info.size_sectors * self.info.sector_size as u64).to_be_bytes());
        buf.extend_from_slice(&NBD_FLAG_HAS_FLAGS.to_be_bytes());
        stream.write_all(&buf)?;
        Ok(())
    }

    fn send_export_info_new(&self, stream: &mut UnixStream, opt: u32) -> io::Result<()> {
        let mut export = Vec::with_capacity(12);
        export.extend_from_slice(&NBD_INFO_EXPORT.to_be_bytes());
        export.extend_from_slice(&(self.info.size_sectors * self.info.sector_size as u64).to_be_bytes());
        export.extend_from_slice(&NBD_FLAG_HAS_FLAGS.to_be_bytes());
        send_option_reply(stream, opt, NBD_REP_INFO, &export)?;

        let mut block_size = Vec::with_capacity(14);
        block_size.extend_from_slice(&NBD_INFO_BLOCK_SIZE.to_be_bytes());
        block_size.extend_from_slice(&1u32.to_be_bytes());
        block_size.extend_from_slice(&self.info.sector_size.to_be_bytes());
        block_size.extend_from_slice(&(64 * 1024 * 1024u32).to_be_bytes());
        send_option_reply(stream, opt, NBD_REP_INFO, &block_size)?;

        send_option_reply(stream, opt, NBD_REP_ACK, &[])
    }

    /// Pause (spec §4.8): stop accepting new connections and stop servicing
    /// clients, without discarding any allocated state.
    pub fn pause(&mut self, sched: &mut Scheduler) {
        if self.paused {
            return;
        }
        self.paused = true;
        if let Some(id) = self.listen_event {
            sched.mask_event(id, true);
        }
        for c in &self.clients {
            if let Some(id) = c.borrow().event_id {
                sched.mask_event(id, true);
            }
        }
    }

    pub fn unpause(&mut self, sched: &mut Scheduler) {
        if !self.paused {
            return;
        }
        self.paused = false;
        if let Some(id) = self.listen_event {
            sched.mask_event(id, false);
        }
        for c in &self.clients {
            if let Some(id) = c.borrow().event_id {
                sched.mask_event(id, false);
            }
        }
    }

    /// Registers a request-phase read event for every client that doesn't
    /// have one yet. Split out from `handshake_and_register` because the
    /// callback needs an `Rc` to `self`, which isn't available from inside
    /// a `&mut self` method; called once per scheduler tick by the owner.
    pub fn arm_new_clients(this: &Rc<RefCell<Self>>, sched: &mut Scheduler) -> io::Result<()> {
        let pending: Vec<Rc<RefCell<NbdClient>>> = {
            let server = this.borrow();
            server.clients.iter().filter(|c| c.borrow().event_id.is_none()).cloned().collect()
        };
        for client in pending {
            let fd = client.borrow().stream.as_raw_fd();
            let weak_server = Rc::downgrade(this);
            let weak_client = Rc::downgrade(&client);
            let id = sched.register_event(PollMode::READ, Some(fd), None, move |_id, _mode| {
                let (Some(server), Some(client)) = (weak_server.upgrade(), weak_client.upgrade()) else { return };
                server.borrow_mut().service_client(&client);
            })?;
            client.borrow_mut().event_id = Some(id);
        }
        Ok(())
    }

    /// Drops any client marked dead, unregistering its scheduler event
    /// (spec §4.8 "A client is dead once its socket is closed ... freed when
    /// the last [request] completes" — this crate's synchronous completion
    /// means a dead client never has requests outstanding by the time it's
    /// reaped).
    pub fn reap_dead_clients(&mut self, sched: &mut Scheduler) {
        let (dead, alive): (Vec<_>, Vec<_>) = self.clients.drain(..).partition(|c| c.borrow().dead);
        self.clients = alive;
        for c in dead {
            if let Some(id) = c.borrow().event_id {
                sched.unregister_event(id);
            }
        }
    }

    fn service_client(&mut self, client: &Rc<RefCell<NbdClient>>) {
        loop {
            let mut hdr_buf = [0u8; 28];
            let read = {
                let mut c = client.borrow_mut();
                c.stream.read_exact(&mut hdr_buf)
            };
            match read {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => {
                    if e.kind() != ErrorKind::UnexpectedEof {
                        warn!("nbd: client read error: {e}");
                    }
                    client.borrow_mut().dead = true;
                    return;
                }
            }

            let Some(req) = parse_request_header(&hdr_buf) else {
                warn!("nbd: bad request magic, dropping client");
                client.borrow_mut().dead = true;
                return;
            };

            if let Err(e) = self.handle_request(client, &req) {
                warn!("nbd: request handling failed: {e}");
                client.borrow_mut().dead = true;
                return;
            }

            if client.borrow().dead {
                return;
            }
        }
    }

    fn handle_request(&mut self, client: &Rc<RefCell<NbdClient>>, req: &RequestHeader) -> io::Result<()> {
        match req.ty {
            NBD_CMD_DISC => {
                debug!("nbd: client requested disconnect");
                client.borrow_mut().dead = true;
                Ok(())
            }
            NBD_CMD_FLUSH => {
                let reply = simple_reply_header(req.handle, 0);
                client.borrow_mut().stream.write_all(&reply)
            }
            NBD_CMD_READ => self.handle_read(client, req),
            NBD_CMD_WRITE => self.handle_write(client, req),
            NBD_CMD_BLOCK_STATUS => self.handle_block_status(client, req),
            other => {
                warn!("nbd: unsupported command {other}");
                let reply = simple_reply_header(req.handle, BlkError::NotSupported.errno().unsigned_abs());
                client.borrow_mut().stream.write_all(&reply)
            }
        }
    }

    fn handle_read(&mut self, client: &Rc<RefCell<NbdClient>>, req: &RequestHeader) -> io::Result<()> {
        let len = req.len as usize;
        let sec = req.from / SECTOR_SIZE as u64;
        let secs = (len / SECTOR_SIZE as usize) as u32;

        let mut buf = vec![0u8; len].into_boxed_slice();
        let base = buf.as_mut_ptr();
        let iov = Iov { base, secs };
        let result = Rc::new(RefCell::new(None));
        let result2 = result.clone();
        self.vbd.queue_request(Op::Read, sec, vec![iov], req.handle, Box::new(move |res, _tok| {
            *result2.borrow_mut() = Some(res);
        }));
        self.vbd.issue_requests();
        let res = result.borrow_mut().take().unwrap_or(Err(BlkError::Io));

        let structured = client.borrow().structured_reply;
        let mut c = client.borrow_mut();
        match res {
            Ok(()) if structured => {
                let hdr = structured_reply_header(req.handle, NBD_REPLY_FLAG_DONE, NBD_REPLY_TYPE_OFFSET_DATA, (len + 8) as u32);
                c.stream.write_all(&hdr)?;
                c.stream.write_all(&req.from.to_be_bytes())?;
                c.stream.write_all(&buf)?;
            }
            Ok(()) => {
                c.stream.write_all(&simple_reply_header(req.handle, 0))?;
                c.stream.write_all(&buf)?;
            }
            Err(e) => {
                c.stream.write_all(&simple_reply_header(req.handle, e.errno().unsigned_abs()))?;
            }
        }
        Ok(())
    }

    fn handle_write(&mut self, client: &Rc<RefCell<NbdClient>>, req: &RequestHeader) -> io::Result<()> {
        let len = req.len as usize;
        let sec = req.from / SECTOR_SIZE as u64;
        let secs = (len / SECTOR_SIZE as usize) as u32;

        let mut buf = vec![0u8; len].into_boxed_slice();
        client.borrow_mut().stream.read_exact(&mut buf)?;
        let base = buf.as_mut_ptr();
        let iov = Iov { base, secs };

        let result = Rc::new(RefCell::new(None));
        let result2 = result.clone();
        self.vbd.queue_request(Op::Write, sec, vec![iov], req.handle, Box::new(move |res, _tok| {
            *result2.borrow_mut() = Some(res);
        }));
        self.vbd.issue_requests();
        let res = result.borrow_mut().take().unwrap_or(Err(BlkError::Io));

        let errno = match res {
            Ok(()) => 0,
            Err(e) => e.errno().unsigned_abs(),
        };
        client.borrow_mut().stream.write_all(&simple_reply_header(req.handle, errno))
    }

    /// `base:allocation` block status (spec §4.8, structured-replies only):
    /// queues a `BlockStatus` vreq and reports the whole range as allocated
    /// data, since this crate's drivers (raw files/devices) have no sparse
    /// tracking to report — matching the real driver's own fallback when it
    /// cannot answer more precisely.
    fn handle_block_status(&mut self, client: &Rc<RefCell<NbdClient>>, req: &RequestHeader) -> io::Result<()> {
        if !client.borrow().structured_reply {
            let reply = simple_reply_header(req.handle, BlkError::NotSupported.errno().unsigned_abs());
            return client.borrow_mut().stream.write_all(&reply);
        }

        // No real driver request is issued: the `Driver` trait has no status
        // query, only `queue_read`/`queue_write`, so this validates directly
        // against the exported size and reports the whole range allocated.
        let sec = req.from / SECTOR_SIZE as u64;
        let secs = req.len / SECTOR_SIZE;
        let res = self.info.validate_range(sec, secs.max(1));

        let mut c = client.borrow_mut();
        match res {
            Ok(()) => {
                let hdr = structured_reply_header(req.handle, NBD_REPLY_FLAG_DONE, NBD_REPLY_TYPE_BLOCK_STATUS, 4 + 8);
                c.stream.write_all(&hdr)?;
                c.stream.write_all(&0u32.to_be_bytes())?; // context id: base:allocation
                c.stream.write_all(&req.len.to_be_bytes())?;
                c.stream.write_all(&0u32.to_be_bytes())?; // status flags: allocated, not a hole
            }
            Err(e) => {
                let hdr = structured_reply_header(req.handle, NBD_REPLY_FLAG_DONE, NBD_REPLY_TYPE_ERROR, 6);
                c.stream.write_all(&hdr)?;
                c.stream.write_all(&e.errno().unsigned_abs().to_be_bytes())?;
                c.stream.write_all(&0u16.to_be_bytes())?;
            }
        }
        Ok(())
    }
}

fn send_option_reply(stream: &mut UnixStream, opt: u32, reply_type: u32, data: &[u8]) -> io::Result<()> {
    let mut hdr = Vec::with_capacity(20 + data.len());
    hdr.extend_from_slice(&NBD_REP_MAGIC.to_be_bytes());
    hdr.extend_from_slice(&opt.to_be_bytes());
    hdr.extend_from_slice(&reply_type.to_be_bytes());
    hdr.extend_from_slice(&(data.len() as u32).to_be_bytes());
    hdr.extend_from_slice(data);
    stream.write_all(&hdr)
}
