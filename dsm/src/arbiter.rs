//! The host-local arbiter. Forked by `init` as a detached grandchild, it
//! owns the host's copy of the shared region, relays traffic between the
//! local processes and the session server, applies broadcast writes, and
//! turns server decisions into process signals.

use crate::session::Config;
use osmium::net::endpoint::{ChannelId, Endpoint, EndpointEvent};
use osmium::net::error::NetResult;
use osmium::proto::{self, Message, Name};
use osmium::ptab::ProcessTable;
use osmium::region::{Protection, SharedRegion};
use osmium::signal;
use osmium::{ARBITER_PORT, LOOPBACK, REGION_NAME};
use plasma::logging;
use std::net::{SocketAddr, TcpStream};
use std::process;

/// Arbiter entry point; never returns. Exits quietly if a sibling arbiter
/// already owns the well-known port.
pub(crate) fn run(cfg: &Config) -> ! {
    let log = logging::init("arbiter");

    // The region must exist before the listener opens: a client that
    // manages to connect may attach immediately.
    let (region, created) = SharedRegion::create_or_attach(REGION_NAME, cfg.size)
        .unwrap_or_else(|err| fatal!("couldn't create shared region: {}", err));

    let addr: SocketAddr = format!("{}:{}", LOOPBACK, ARBITER_PORT)
        .parse()
        .expect("Broken arbiter address literal");

    let mut endpoint = match Endpoint::bind(addr, &log) {
        Ok(endpoint) => endpoint,
        // Port taken: this host already has its arbiter.
        Err(_) => process::exit(0),
    };

    logging::info!(log, "arbiter up";
                   "session" => %cfg.session,
                   "region_size" => region.size(),
                   "created_region" => created);

    if let Err(err) = region.protect(Protection::ReadOnly) {
        fatal!("couldn't protect arbiter region: {}", err);
    }

    let server = locate_server(&mut endpoint, cfg, &log);

    let mut relay = Relay {
        ptab: ProcessTable::new(),
        region,
        server,
        started: false,
        running: true,
        log,
    };

    let mut events = Vec::new();

    while relay.running {
        if let Err(err) = endpoint.poll(&mut events) {
            fatal!("arbiter poll failed: {}", err);
        }

        for event in events.drain(..) {
            match event {
                EndpointEvent::Opened(_) => {
                    // A fresh connection after start is a second session
                    // racing on the well-known port.
                    if relay.started {
                        fatal!("connection attempt after session start");
                    }
                }
                EndpointEvent::Frame(conn, msg) => relay.handle(conn, msg, &mut endpoint),
                EndpointEvent::Closed(conn) => {
                    if conn == relay.server {
                        fatal!("lost session server");
                    }
                    if relay.ptab.remove_conn(conn) > 0 {
                        fatal!("local process vanished without exiting");
                    }
                }
            }
        }
    }

    // All local processes have left; say goodbye to the server.
    send(&mut endpoint, relay.server, &Message::Exit);

    logging::info!(relay.log, "arbiter done"; "session" => %cfg.session);
    process::exit(0);
}

/// Resolves the session through the daemon and opens the server
/// connection. Blocks while the daemon spawns and the server comes up.
fn locate_server(endpoint: &mut Endpoint, cfg: &Config, log: &logging::Logger) -> ChannelId {
    let mut daemon = TcpStream::connect((cfg.daemon_addr.as_str(), cfg.daemon_port))
        .unwrap_or_else(|err| {
            fatal!("couldn't reach session daemon at {}:{}: {}",
                   cfg.daemon_addr, cfg.daemon_port, err)
        });

    let request =
        Message::GetSid { name: Name::new(&cfg.session), nproc: cfg.tproc as i32 };
    if let Err(err) = proto::write_msg(&mut daemon, &request) {
        fatal!("couldn't query session daemon: {}", err);
    }

    let port = match proto::read_msg(&mut daemon) {
        Ok(Message::SetSid { port, .. }) => port,
        Ok(Message::DelSid { .. }) => fatal!("session {} rejected by daemon", cfg.session),
        Ok(other) => fatal!("unexpected daemon reply: {:?}", other),
        Err(err) => fatal!("lost daemon connection: {}", err),
    };
    drop(daemon);

    logging::info!(log, "session resolved"; "session" => %cfg.session, "port" => port);

    let server_addr: SocketAddr = format!("{}:{}", cfg.daemon_addr, port)
        .parse()
        .unwrap_or_else(|err| fatal!("bad server address: {}", err));

    endpoint
        .connect(server_addr)
        .unwrap_or_else(|err| fatal!("couldn't reach session server: {}", err))
}

struct Relay {
    ptab: ProcessTable,
    region: SharedRegion,
    server: ChannelId,
    started: bool,
    running: bool,
    log: logging::Logger,
}

impl Relay {
    fn handle(&mut self, conn: ChannelId, msg: Message, endpoint: &mut Endpoint) {
        if conn == self.server {
            self.from_server(msg, endpoint);
        } else {
            self.from_process(conn, msg, endpoint);
        }
    }

    fn from_server(&mut self, msg: Message, endpoint: &mut Endpoint) {
        match msg {
            // Session start: the region name has served its purpose, and
            // every process receives its identifier as the start signal.
            Message::CntAll => {
                assert!(!self.started, "duplicate session start");
                self.started = true;

                if let Err(err) = SharedRegion::unlink(REGION_NAME) {
                    logging::warn!(self.log, "couldn't unlink region"; "error" => %err);
                }

                let mut deliveries = Vec::new();
                self.ptab.for_each_mut(|conn, proc| {
                    proc.stopped = false;
                    deliveries.push((conn, proc.pid, proc.gid));
                });

                for (conn, pid, gid) in deliveries {
                    send(endpoint, conn, &Message::SetGid { pid, gid });
                }

                logging::info!(self.log, "session started"; "nproc" => self.ptab.len());
            }
            Message::SetGid { pid, gid } => {
                assert!(!self.started, "identifier assignment after start");

                match self.ptab.find_pid(pid) {
                    Some((_, proc)) => proc.gid = gid,
                    None => fatal!("identifier for unknown process {}", pid),
                }
            }
            Message::RelBar => {
                assert!(self.started, "barrier release before start");

                let mut waiters = Vec::new();
                self.ptab.for_each_mut(|_, proc| {
                    // A barrier is a barrier: nobody is mid-write here.
                    assert!(!proc.stopped && !proc.queued, "barrier release with active writer");
                    proc.blocked = false;
                    waiters.push(proc.pid);
                });

                for pid in waiters {
                    if let Err(err) = signal::resume(pid) {
                        fatal!("couldn't resume process {}: {}", pid, err);
                    }
                }
            }
            Message::WrtNow { pid } => {
                assert!(self.started, "write grant before start");

                let conn = match self.ptab.find_pid(pid) {
                    Some((conn, proc)) => {
                        proc.queued = false;
                        conn
                    }
                    None => fatal!("write grant for unknown process {}", pid),
                };

                send(endpoint, conn, &Message::WrtNow { pid });
            }
            Message::WrtData { offset, bytes } => {
                assert!(self.started, "write data before start");
                self.apply(offset, &bytes);
            }
            Message::WrtEnd => {
                assert!(self.started, "write end before start");
                let count = self.ptab.len() as i32;
                send(endpoint, self.server, &Message::GotData { nproc: count });
            }
            Message::PostSem { name, pid } => {
                assert!(self.started, "semaphore wake before start");

                let conn = match self.ptab.find_pid(pid) {
                    Some((conn, proc)) => {
                        assert!(proc.blocked, "semaphore wake for a process that never blocked");
                        proc.blocked = false;
                        conn
                    }
                    None => fatal!("semaphore wake for unknown process {}", pid),
                };

                send(endpoint, conn, &Message::PostSem { name, pid });
            }
            other => fatal!("unexpected server message: {:?}", other),
        }
    }

    fn from_process(&mut self, conn: ChannelId, msg: Message, endpoint: &mut Endpoint) {
        match msg {
            Message::AddPid { pid } => {
                assert!(!self.started, "process checked in after session start");

                let proc = self.ptab.register(conn, pid);
                // The server owns identifier assignment; until the start
                // signal the process counts as stopped.
                proc.gid = -1;
                proc.stopped = true;

                send(endpoint, self.server, &Message::AddPid { pid });
            }
            Message::ReqWrt { pid } => {
                assert!(self.started, "write request before start");
                self.known_proc(conn, pid).queued = true;
                send(endpoint, self.server, &Message::ReqWrt { pid });
            }
            Message::HitBar { pid } => {
                assert!(self.started, "barrier before start");
                self.known_proc(conn, pid).blocked = true;
                send(endpoint, self.server, &Message::HitBar { pid });
            }
            Message::WrtData { offset, bytes } => {
                assert!(self.started, "write data before start");
                send(endpoint, self.server, &Message::WrtData { offset, bytes });
            }
            Message::WrtEnd => {
                assert!(self.started, "write end before start");
                send(endpoint, self.server, &Message::WrtEnd);

                // Our own copy is already current: the writer mutated the
                // shared mapping directly. Acknowledge for the whole host.
                let count = self.ptab.len() as i32;
                send(endpoint, self.server, &Message::GotData { nproc: count });
            }
            Message::PostSem { name, pid } => {
                assert!(self.started, "semaphore post before start");
                self.known_proc(conn, pid);
                send(endpoint, self.server, &Message::PostSem { name, pid });
            }
            Message::WaitSem { name, pid } => {
                assert!(self.started, "semaphore wait before start");
                self.known_proc(conn, pid).blocked = true;
                send(endpoint, self.server, &Message::WaitSem { name, pid });
            }
            Message::Exit => {
                assert!(self.started, "exit before start");

                endpoint.close(conn);
                self.ptab.remove_conn(conn);

                if self.ptab.is_empty() {
                    self.running = false;
                }
            }
            other => fatal!("unexpected process message: {:?}", other),
        }
    }

    /// Applies a broadcast write under a brief read-write window, clamped
    /// so it can never run off the mapping.
    fn apply(&mut self, offset: i64, bytes: &[u8]) {
        if let Err(err) = self.region.protect(Protection::ReadWrite) {
            fatal!("couldn't unlock region for apply: {}", err);
        }

        let applied = self.region.apply(offset as usize, bytes);
        if applied < bytes.len() {
            logging::warn!(self.log, "write clamped at region end";
                           "offset" => offset,
                           "given" => bytes.len(),
                           "applied" => applied);
        }

        if let Err(err) = self.region.protect(Protection::ReadOnly) {
            fatal!("couldn't re-lock region after apply: {}", err);
        }
    }

    fn known_proc(&mut self, conn: ChannelId, pid: i32) -> &mut osmium::ptab::Proc {
        match self.ptab.get_mut(conn, pid) {
            Some(proc) => proc,
            None => fatal!("message from unregistered process {}", pid),
        }
    }
}

/// Sends or dies: a peer that cannot be reached ends the session.
fn send(endpoint: &mut Endpoint, conn: ChannelId, msg: &Message) {
    let result: NetResult<()> = endpoint.send(conn, msg);
    if let Err(err) = result {
        fatal!("send to connection {} failed: {:?}", conn, err);
    }
}
