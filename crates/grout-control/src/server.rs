//! API dispatch server.
//!
//! A single-threaded reactor owns the listening socket, a signalfd, an
//! eventfd stop handle and every client connection. All request handlers
//! and event callbacks run on this thread to completion, which is what
//! makes them atomic with respect to each other.
//!
//! Read path per request: fixed header, then the payload, both with
//! `MSG_DONTWAIT`. A partial header or payload is a protocol error and
//! closes the connection; handlers never see a truncated request.
//!
//! Write path: responses are sent with `MSG_DONTWAIT | MSG_NOSIGNAL`. On
//! `EAGAIN` the remainder moves to a per-connection pending queue (the
//! write side switches DRAINED → PENDING) and write readiness is armed;
//! the queue owns the buffers until drained or the connection dies. A
//! client that stops draining is closed once the queue hits its bound —
//! responses are never silently dropped and the daemon never blocks.

use std::collections::{HashMap, VecDeque};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::Arc;

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::socket::{
    accept4, bind, listen, recv, send, socket, AddressFamily, Backlog, MsgFlags, SockFlag,
    SockType, UnixAddr,
};

use grout_core::errno::{errno_to_status, Errno, Result};
use grout_core::{log_debug, log_err, log_info, log_notice};

use grout_api::frame::{RequestHeader, ResponseHeader, HEADER_LEN};

use crate::api::lookup_api_handler;
use crate::config::Config;
use crate::Control;

pub const API_BACKLOG: i32 = 16;

/// Responses queued on a blocked connection before it is closed.
const MAX_PENDING_RESPONSES: usize = 16;

const EVENT_BATCH: usize = 64;

struct PendingWrite {
    buf: Vec<u8>,
    off: usize,
}

enum Drain {
    Drained,
    Blocked,
    Error(Errno),
}

fn drain_write(fd: RawFd, write: &mut PendingWrite) -> Drain {
    while write.off < write.buf.len() {
        match send(
            fd,
            &write.buf[write.off..],
            MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_NOSIGNAL,
        ) {
            Ok(n) => write.off += n,
            Err(Errno::EAGAIN) => return Drain::Blocked,
            Err(err) => return Drain::Error(err),
        }
    }
    Drain::Drained
}

struct Conn {
    fd: OwnedFd,
    pending: VecDeque<PendingWrite>,
}

/// Wakes the reactor out of its wait and breaks the loop. Coalesces like
/// the eventfd it writes: stopping twice is one wakeup.
#[derive(Clone)]
pub struct StopHandle {
    fd: Arc<OwnedFd>,
}

impl StopHandle {
    pub fn stop(&self) {
        let val: u64 = 1;
        // Safety: valid fd and buffer; EAGAIN only means a stop is already
        // pending, which is just as good.
        unsafe { libc::write(self.fd.as_raw_fd(), &val as *const u64 as *const libc::c_void, 8) };
    }
}

fn new_eventfd() -> Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(Errno::last());
    }
    // Safety: fd is a fresh, owned descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn listen_api_socket(path: &Path) -> Result<OwnedFd> {
    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    let addr = UnixAddr::new(path)?;
    if let Err(err) = bind(fd.as_raw_fd(), &addr) {
        log_err!("bind: {}: {}", path.display(), err.desc());
        return Err(err);
    }
    if let Err(err) = listen(&fd, Backlog::new(API_BACKLOG)?) {
        log_err!("listen: {}: {}", path.display(), err.desc());
        return Err(err);
    }
    log_info!("listening on API socket {}", path.display());
    Ok(fd)
}

pub struct Server {
    epoll: Epoll,
    listener: OwnedFd,
    sigfd: Option<SignalFd>,
    stop_fd: Arc<OwnedFd>,
    conns: HashMap<u64, Conn>,
    loopbreak: bool,
    max_msg_len: u32,
}

impl Server {
    pub fn new(cfg: &Config) -> Result<Self> {
        let listener = listen_api_socket(&cfg.api_sock_path)?;
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        let stop_fd = new_eventfd()?;

        epoll.add(
            &listener,
            EpollEvent::new(EpollFlags::EPOLLIN, listener.as_raw_fd() as u64),
        )?;
        epoll.add(
            &stop_fd,
            EpollEvent::new(EpollFlags::EPOLLIN, stop_fd.as_raw_fd() as u64),
        )?;

        Ok(Self {
            epoll,
            listener,
            sigfd: None,
            stop_fd: Arc::new(stop_fd),
            conns: HashMap::new(),
            loopbreak: false,
            max_msg_len: cfg.max_msg_len,
        })
    }

    /// Route SIGINT/SIGTERM/SIGQUIT into the reactor as loop breaks.
    pub fn register_signals(&mut self) -> Result<()> {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGINT);
        mask.add(Signal::SIGTERM);
        mask.add(Signal::SIGQUIT);
        mask.thread_block()?;

        let sigfd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)?;
        self.epoll.add(
            &sigfd,
            EpollEvent::new(EpollFlags::EPOLLIN, sigfd.as_raw_fd() as u64),
        )?;
        self.sigfd = Some(sigfd);
        Ok(())
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle { fd: self.stop_fd.clone() }
    }

    /// Dispatch until a signal or a stop handle breaks the loop.
    pub fn run(&mut self, ctl: &mut Control) -> Result<()> {
        let mut events = [EpollEvent::empty(); EVENT_BATCH];
        while !self.loopbreak {
            let n = match self.epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    log_err!("epoll_wait: {}", err.desc());
                    return Err(err);
                }
            };
            for event in &events[..n] {
                let token = event.data();
                if token == self.listener.as_raw_fd() as u64 {
                    self.accept_cb();
                } else if Some(token) == self.sigfd.as_ref().map(|s| s.as_raw_fd() as u64) {
                    self.signal_cb();
                } else if token == self.stop_fd.as_raw_fd() as u64 {
                    self.stop_cb();
                } else {
                    self.conn_cb(ctl, token, event.events());
                }
            }
        }
        Ok(())
    }

    /// Finalize every connection (discarding pending responses), the
    /// signalfd and its mask. The listener closes when the server drops.
    pub fn shutdown(&mut self) {
        if let Some(sigfd) = self.sigfd.take() {
            let _ = self.epoll.delete(&sigfd);
            let mut mask = SigSet::empty();
            mask.add(Signal::SIGINT);
            mask.add(Signal::SIGTERM);
            mask.add(Signal::SIGQUIT);
            let _ = mask.thread_unblock();
        }
        for (_, conn) in self.conns.drain() {
            let _ = self.epoll.delete(&conn.fd);
        }
    }

    fn accept_cb(&mut self) {
        match accept4(
            self.listener.as_raw_fd(),
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        ) {
            Ok(fd) => {
                // Safety: accept4 returned a fresh, owned descriptor.
                let fd = unsafe { OwnedFd::from_raw_fd(fd) };
                let token = fd.as_raw_fd() as u64;
                log_debug!("new connection");
                let ev = EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP, token);
                if let Err(err) = self.epoll.add(&fd, ev) {
                    log_err!("failed to add connection to loop: {}", err.desc());
                    return;
                }
                self.conns.insert(token, Conn { fd, pending: VecDeque::new() });
            }
            Err(Errno::EAGAIN) => {}
            Err(err) => log_err!("accept: {}", err.desc()),
        }
    }

    fn signal_cb(&mut self) {
        if let Some(sigfd) = &mut self.sigfd {
            while let Ok(Some(info)) = sigfd.read_signal() {
                log_notice!("received signal {}", info.ssi_signo);
                self.loopbreak = true;
            }
        }
    }

    fn stop_cb(&mut self) {
        let mut val = 0u64;
        // Safety: valid fd and buffer.
        unsafe {
            libc::read(self.stop_fd.as_raw_fd(), &mut val as *mut u64 as *mut libc::c_void, 8)
        };
        self.loopbreak = true;
    }

    fn conn_cb(&mut self, ctl: &mut Control, token: u64, flags: EpollFlags) {
        if !self.conns.contains_key(&token) {
            // closed earlier in this batch
            return;
        }
        if flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR) {
            self.close_conn(token);
            return;
        }
        if flags.contains(EpollFlags::EPOLLOUT) && !self.write_cb(token) {
            return;
        }
        if flags.contains(EpollFlags::EPOLLIN) {
            self.read_cb(ctl, token);
        } else if flags.contains(EpollFlags::EPOLLRDHUP) {
            log_debug!("client disconnected");
            self.close_conn(token);
        }
    }

    fn read_cb(&mut self, ctl: &mut Control, token: u64) {
        let fd = token as RawFd;

        let mut hdr = [0u8; HEADER_LEN];
        match recv(fd, &mut hdr, MsgFlags::MSG_DONTWAIT) {
            Ok(0) => {
                log_debug!("client disconnected");
                self.close_conn(token);
                return;
            }
            Ok(n) if n < HEADER_LEN => {
                log_err!("truncated request header: {} bytes", n);
                self.close_conn(token);
                return;
            }
            Ok(_) => {}
            Err(Errno::EAGAIN) => return,
            Err(err) => {
                log_err!("recv: {}", err.desc());
                self.close_conn(token);
                return;
            }
        }
        let Ok(req) = RequestHeader::from_bytes(&hdr) else {
            self.close_conn(token);
            return;
        };

        if req.payload_len > self.max_msg_len {
            log_err!("request payload too large: {} bytes", req.payload_len);
            self.close_conn(token);
            return;
        }

        let mut payload = vec![0u8; req.payload_len as usize];
        if req.payload_len > 0 {
            match recv(fd, &mut payload, MsgFlags::MSG_DONTWAIT) {
                Ok(n) if n == payload.len() => {}
                Ok(_) => {
                    // disconnect or dribble between header and payload
                    // drops the request
                    log_debug!("client disconnected mid-request");
                    self.close_conn(token);
                    return;
                }
                Err(Errno::EAGAIN) => {
                    log_err!("request payload not following header");
                    self.close_conn(token);
                    return;
                }
                Err(err) => {
                    log_err!("recv: {}", err.desc());
                    self.close_conn(token);
                    return;
                }
            }
        }

        let (status, resp_payload) = match lookup_api_handler(ctl, req.req_type).copied() {
            None => (errno_to_status(Errno::ENOTSUP), Vec::new()),
            Some(handler) => {
                log_debug!(
                    "request: id={} type=0x{:08x} '{}' len={}",
                    req.id,
                    req.req_type,
                    handler.name,
                    req.payload_len
                );
                match (handler.callback)(ctl, &payload) {
                    Ok(out) => (0, out),
                    Err(err) => (errno_to_status(err), Vec::new()),
                }
            }
        };

        let header = ResponseHeader::new(req.id, status, resp_payload.len() as u32);
        log_debug!(
            "response: for_id={} status={} len={}",
            header.for_id,
            header.status,
            header.payload_len
        );
        let mut buf = Vec::with_capacity(HEADER_LEN + resp_payload.len());
        buf.extend_from_slice(&header.to_bytes());
        buf.extend_from_slice(&resp_payload);
        self.send_response(token, buf);
    }

    fn send_response(&mut self, token: u64, buf: Vec<u8>) {
        let queued = match self.conns.get(&token) {
            Some(conn) => conn.pending.len(),
            None => return,
        };
        if queued > 0 {
            // earlier response still blocked: keep strict order
            if queued >= MAX_PENDING_RESPONSES {
                log_err!("client not draining responses, closing");
                self.close_conn(token);
                return;
            }
            if let Some(conn) = self.conns.get_mut(&token) {
                conn.pending.push_back(PendingWrite { buf, off: 0 });
            }
            return;
        }

        let mut write = PendingWrite { buf, off: 0 };
        match drain_write(token as RawFd, &mut write) {
            Drain::Drained => {}
            Drain::Blocked => {
                if let Some(conn) = self.conns.get_mut(&token) {
                    conn.pending.push_back(write);
                }
                self.arm_write(token, true);
            }
            Drain::Error(err) => {
                log_err!("send: {}", err.desc());
                self.close_conn(token);
            }
        }
    }

    /// Drain the pending queue. Returns false if the connection was closed.
    fn write_cb(&mut self, token: u64) -> bool {
        loop {
            let Some(conn) = self.conns.get_mut(&token) else {
                return false;
            };
            let Some(mut write) = conn.pending.pop_front() else {
                break;
            };
            match drain_write(token as RawFd, &mut write) {
                Drain::Drained => continue,
                Drain::Blocked => {
                    conn.pending.push_front(write);
                    return true;
                }
                Drain::Error(err) => {
                    log_err!("send: {}", err.desc());
                    self.close_conn(token);
                    return false;
                }
            }
        }
        self.arm_write(token, false);
        true
    }

    fn arm_write(&mut self, token: u64, enabled: bool) {
        let Some(conn) = self.conns.get(&token) else {
            return;
        };
        let mut flags = EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP;
        if enabled {
            flags |= EpollFlags::EPOLLOUT;
        }
        let mut ev = EpollEvent::new(flags, token);
        if let Err(err) = self.epoll.modify(&conn.fd, &mut ev) {
            log_err!("failed to update connection events: {}", err.desc());
        }
    }

    fn close_conn(&mut self, token: u64) {
        if let Some(conn) = self.conns.remove(&token) {
            // pending response buffers die with the connection
            let _ = self.epoll.delete(&conn.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::modules_fini;
    use grout_api::client::ApiClient;
    use grout_api::frame::MAX_MSG_LEN;
    use grout_api::infra::{
        ApiIface, ApiIfaceAddReq, ApiIfaceAddResp, ApiIfaceBase, ApiIfaceGetReq, ApiIfaceListReq,
        ApiIfaceListResp, IFACE_ADD, IFACE_GET, IFACE_LIST, IFACE_TYPE_PORT, IFACE_TYPE_UNDEF,
        VRF_ID_ALL,
    };
    use grout_api::wire::{from_bytes, pod_bytes};
    use grout_core::string::put_name;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::path::PathBuf;
    use std::time::Duration;

    fn temp_sock_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("grout-test-{}-{}.sock", tag, std::process::id()))
    }

    struct Daemon {
        stop: StopHandle,
        thread: Option<std::thread::JoinHandle<()>>,
        path: PathBuf,
    }

    impl Daemon {
        fn start(tag: &str) -> Self {
            let path = temp_sock_path(tag);
            let _ = std::fs::remove_file(&path);
            let cfg = Config::with_sock_path(&path);
            let mut ctl = crate::boot(cfg.clone());
            let mut server = Server::new(&cfg).unwrap();
            let stop = server.stop_handle();
            let thread = std::thread::spawn(move || {
                server.run(&mut ctl).unwrap();
                server.shutdown();
                modules_fini(&mut ctl);
            });
            Self { stop, thread: Some(thread), path }
        }

        fn client(&self) -> ApiClient {
            ApiClient::connect(&self.path).unwrap()
        }

        fn raw(&self) -> UnixStream {
            UnixStream::connect(&self.path).unwrap()
        }
    }

    impl Drop for Daemon {
        fn drop(&mut self) {
            self.stop.stop();
            if let Some(thread) = self.thread.take() {
                thread.join().unwrap();
            }
            let _ = std::fs::remove_file(&self.path);
        }
    }

    fn add_port(client: &mut ApiClient, name: &str) -> u16 {
        let mut req = ApiIfaceAddReq {
            iface: ApiIfaceBase { type_id: IFACE_TYPE_PORT, ..ApiIfaceBase::default() },
            info: [0; grout_api::infra::IFACE_INFO_MAX],
        };
        put_name(&mut req.iface.name, name).unwrap();
        let resp: ApiIfaceAddResp = client.request(IFACE_ADD, &req).unwrap();
        resp.iface_id
    }

    #[test]
    fn test_dispatch_unknown_type() {
        let daemon = Daemon::start("unknown");
        let mut client = daemon.client();
        let err = client.send_recv(0xdead0001, &[]).unwrap_err();
        assert_eq!(err, Errno::ENOTSUP);
        // connection still usable afterwards
        let req = ApiIfaceListReq { type_id: IFACE_TYPE_UNDEF, vrf_id: VRF_ID_ALL };
        assert!(client.send_recv(IFACE_LIST, pod_bytes(&req)).is_ok());
    }

    #[test]
    fn test_iface_add_get_list() {
        let daemon = Daemon::start("addget");
        let mut client = daemon.client();

        let id = add_port(&mut client, "p0");
        assert_ne!(id, 0);

        let got: ApiIface = client.request(IFACE_GET, &ApiIfaceGetReq { iface_id: id }).unwrap();
        assert_eq!(got.base.id, id);
        assert_eq!(got.base.type_id, IFACE_TYPE_PORT);
        assert_eq!(&got.base.name[..3], b"p0\0");

        let req = ApiIfaceListReq { type_id: IFACE_TYPE_UNDEF, vrf_id: VRF_ID_ALL };
        let out = client.send_recv(IFACE_LIST, pod_bytes(&req)).unwrap();
        let resp: ApiIfaceListResp = from_bytes(&out).unwrap();
        assert_eq!(resp.n_ifaces, 1);
    }

    #[test]
    fn test_pipelined_requests_in_order() {
        let daemon = Daemon::start("pipeline");
        let mut sock = daemon.raw();

        // queue a burst of requests before reading anything back
        let n = 32u32;
        let mut bytes = Vec::new();
        for id in 1..=n {
            bytes.extend_from_slice(&RequestHeader::new(id, 0xdead0001, 0).to_bytes());
        }
        sock.write_all(&bytes).unwrap();

        // every request gets its response, in request order
        for id in 1..=n {
            let mut hdr = [0u8; HEADER_LEN];
            sock.read_exact(&mut hdr).unwrap();
            let resp = ResponseHeader::from_bytes(&hdr).unwrap();
            assert_eq!(resp.for_id, id);
            assert_eq!(resp.status, Errno::ENOTSUP as i32 as u32);
            assert_eq!(resp.payload_len, 0);
        }
    }

    #[test]
    fn test_oversized_payload_closes_connection() {
        let daemon = Daemon::start("oversize");
        let mut sock = daemon.raw();

        let hdr = RequestHeader::new(1, 0xdead0001, MAX_MSG_LEN + 1);
        sock.write_all(&hdr.to_bytes()).unwrap();

        let mut buf = [0u8; 1];
        sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(sock.read(&mut buf).unwrap(), 0, "expected EOF");

        // the daemon itself is unaffected
        let mut client = daemon.client();
        assert_eq!(client.send_recv(0xdead0001, &[]).unwrap_err(), Errno::ENOTSUP);
    }

    #[test]
    fn test_backpressure_never_hangs_daemon() {
        let daemon = Daemon::start("backpressure");
        let mut client = daemon.client();
        for i in 0..20 {
            add_port(&mut client, &format!("bp{}", i));
        }

        // a client that never reads: the daemon queues responses behind a
        // blocked send and closes the connection at the queue bound
        let mut greedy = daemon.raw();
        let list = ApiIfaceListReq { type_id: IFACE_TYPE_UNDEF, vrf_id: VRF_ID_ALL };
        let mut frame = Vec::new();
        frame.extend_from_slice(&RequestHeader::new(1, IFACE_LIST, 4).to_bytes());
        frame.extend_from_slice(pod_bytes(&list));

        let mut closed = false;
        for _ in 0..100_000 {
            if greedy.write_all(&frame).is_err() {
                closed = true;
                break;
            }
        }
        assert!(closed, "daemon kept buffering responses without bound");

        // other clients are still served
        let got: ApiIfaceListResp =
            from_bytes(&client.send_recv(IFACE_LIST, pod_bytes(&list)).unwrap()).unwrap();
        assert_eq!(got.n_ifaces, 20);
    }

    #[test]
    fn test_stop_handle_breaks_loop() {
        let path = temp_sock_path("stop");
        let _ = std::fs::remove_file(&path);
        let cfg = Config::with_sock_path(&path);
        let mut ctl = crate::boot(cfg.clone());
        let mut server = Server::new(&cfg).unwrap();
        let stop = server.stop_handle();

        let thread = std::thread::spawn(move || {
            server.run(&mut ctl).unwrap();
            server.shutdown();
            modules_fini(&mut ctl);
        });
        stop.stop();
        thread.join().unwrap();
        let _ = std::fs::remove_file(&path);
    }
}
