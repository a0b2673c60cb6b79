//! The session coordinator: the single global authority for one named
//! session. It assigns global identifiers during the join phase, then
//! serializes writes through the operation queue, releases barriers, and
//! arbitrates the named semaphores.
//!
//! The coordinator is pure state: handlers consume one message and emit
//! actions for the caller to put on the wire. The main loop owns the
//! endpoint; tests drive the handlers directly.

use osmium::net::endpoint::ChannelId;
use osmium::opqueue::{OpQueue, Step};
use osmium::proto::Message;
use osmium::ptab::ProcessTable;
use osmium::semtab::SemTable;
use plasma::logging;

/// Wire-side effect of one handled message.
#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    Send(ChannelId, Message),
    Broadcast { msg: Message, except: Option<ChannelId> },
    Close(ChannelId),
}

pub struct Coordinator {
    nproc: usize,
    started: bool,
    ptab: ProcessTable,
    ops: OpQueue,
    sems: SemTable,
    log: logging::Logger,
}

impl Coordinator {
    pub fn new(nproc: usize, log: &logging::Logger) -> Coordinator {
        assert!(nproc >= 2, "a session needs at least two processes");

        Coordinator {
            nproc,
            started: false,
            ptab: ProcessTable::new(),
            ops: OpQueue::new(),
            sems: SemTable::new(),
            log: log.new(logging::o!()),
        }
    }

    /// True once every expected process has checked in.
    #[inline]
    pub fn started(&self) -> bool {
        self.started
    }

    pub fn handle(&mut self, conn: ChannelId, msg: Message, out: &mut Vec<Action>) {
        match msg {
            Message::AddPid { pid } => self.on_add_pid(conn, pid, out),
            Message::ReqWrt { pid } => self.on_req_wrt(conn, pid, out),
            Message::HitBar { .. } => self.on_hit_bar(out),
            Message::WrtData { offset, bytes } => self.on_wrt_data(conn, offset, bytes, out),
            Message::WrtEnd => self.on_wrt_end(conn, out),
            Message::GotData { nproc } => self.on_got_data(nproc, out),
            Message::PostSem { name, .. } => self.on_post_sem(name, out),
            Message::WaitSem { name, pid } => self.on_wait_sem(conn, name, pid, out),
            Message::Exit => self.on_exit(conn, out),
            other => panic!("coordinator received unexpected message {:?}", other),
        }
    }

    /// A connection vanished without the exit handshake. Harmless after
    /// the arbiter already said goodbye; fatal otherwise.
    pub fn connection_closed(&mut self, conn: ChannelId) {
        let dropped = self.ptab.remove_conn(conn);
        assert!(dropped == 0, "lost arbiter holding {} registered processes", dropped);
    }

    fn on_add_pid(&mut self, conn: ChannelId, pid: i32, out: &mut Vec<Action>) {
        assert!(!self.started, "process checked in after session start");

        let gid = self.ptab.register(conn, pid).gid;
        out.push(Action::Send(conn, Message::SetGid { pid, gid }));

        logging::debug!(self.log, "process joined";
                        "context" => "add_pid",
                        "pid" => pid,
                        "gid" => gid);

        self.ptab.nready += 1;
        if self.ptab.nready >= self.nproc {
            logging::info!(self.log, "session started"; "nproc" => self.nproc);

            self.started = true;
            self.ptab.nready = 0;
            out.push(Action::Broadcast { msg: Message::CntAll, except: None });
        }
    }

    fn on_req_wrt(&mut self, conn: ChannelId, pid: i32, out: &mut Vec<Action>) {
        assert!(self.started, "write request before session start");

        let was_empty = self.ops.is_empty();
        self.ops.enqueue(conn, pid);

        // Nothing in flight: the new head gets the grant immediately.
        if was_empty {
            assert!(self.ops.step == Step::Ready, "queue empty in a non-ready step");
            self.grant_head(out);
            self.ops.step = Step::AwaitData;
        }
    }

    fn on_hit_bar(&mut self, out: &mut Vec<Action>) {
        assert!(self.started, "barrier before session start");

        self.ptab.nblocked += 1;
        if self.ptab.nblocked >= self.nproc {
            self.ptab.nblocked = 0;
            out.push(Action::Broadcast { msg: Message::RelBar, except: None });
        }
    }

    fn on_wrt_data(&mut self, conn: ChannelId, offset: i64, bytes: Vec<u8>, out: &mut Vec<Action>) {
        self.assert_writer(conn, Step::AwaitData);

        out.push(Action::Broadcast {
            msg: Message::WrtData { offset, bytes },
            except: Some(conn),
        });
    }

    fn on_wrt_end(&mut self, conn: ChannelId, out: &mut Vec<Action>) {
        self.assert_writer(conn, Step::AwaitData);

        out.push(Action::Broadcast { msg: Message::WrtEnd, except: Some(conn) });
        self.ops.step = Step::AwaitAck;
    }

    fn on_got_data(&mut self, acknowledged: i32, out: &mut Vec<Action>) {
        assert!(self.started, "acknowledgement before session start");
        assert!(self.ops.step == Step::AwaitAck, "acknowledgement outside a write");

        self.ptab.nready += acknowledged as usize;
        if self.ptab.nready < self.nproc {
            return;
        }

        // Every participant holds the data; the operation is complete.
        self.ops.dequeue();
        self.ptab.nready = 0;

        if self.ops.is_empty() {
            self.ops.step = Step::Ready;
        } else {
            self.ops.step = Step::AwaitData;
            self.grant_head(out);
        }
    }

    fn on_post_sem(&mut self, name: osmium::proto::Name, out: &mut Vec<Action>) {
        assert!(self.started, "semaphore post before session start");

        let sem_id = self.sems.get_or_create(name).id;

        let woken = match self.ptab.first_with_sem(sem_id) {
            Some((waiter_conn, waiter)) => {
                waiter.sem_id = None;
                Some((waiter_conn, waiter.pid))
            }
            None => None,
        };

        match woken {
            Some((waiter_conn, waiter_pid)) => {
                out.push(Action::Send(waiter_conn, Message::PostSem { name, pid: waiter_pid }));
            }
            // Nobody is waiting; the token is banked.
            None => self.sems.get_or_create(name).value += 1,
        }
    }

    fn on_wait_sem(
        &mut self,
        conn: ChannelId,
        name: osmium::proto::Name,
        pid: i32,
        out: &mut Vec<Action>,
    ) {
        assert!(self.started, "semaphore wait before session start");

        let sem = self.sems.get_or_create(name);

        if sem.value > 0 {
            sem.value -= 1;
            out.push(Action::Send(conn, Message::PostSem { name, pid }));
        } else {
            let sem_id = sem.id;
            let proc = self
                .ptab
                .get_mut(conn, pid)
                .unwrap_or_else(|| panic!("semaphore wait from unknown process {}", pid));
            proc.sem_id = Some(sem_id);
        }
    }

    fn on_exit(&mut self, conn: ChannelId, out: &mut Vec<Action>) {
        assert!(self.started, "exit before session start");

        let dropped = self.ptab.remove_conn(conn);
        out.push(Action::Close(conn));

        logging::debug!(self.log, "arbiter left";
                        "context" => "exit",
                        "conn" => conn,
                        "dropped" => dropped);
    }

    fn grant_head(&mut self, out: &mut Vec<Action>) {
        let (conn, pid) = self.ops.head().expect("grant without a queued writer");
        out.push(Action::Send(conn, Message::WrtNow { pid }));
    }

    fn assert_writer(&self, conn: ChannelId, step: Step) {
        assert!(self.started, "write traffic before session start");
        assert!(self.ops.step == step, "write traffic in step {:?}", self.ops.step);

        match self.ops.head() {
            Some((head_conn, _)) => {
                assert!(head_conn == conn, "write traffic from a connection without the grant")
            }
            None => panic!("write traffic with an empty operation queue"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osmium::proto::Name;

    fn started_coordinator(nproc: usize, conns: &[(ChannelId, &[i32])]) -> Coordinator {
        let mut coord = Coordinator::new(nproc, &logging::null());
        let mut out = Vec::new();

        for &(conn, pids) in conns {
            for &pid in pids {
                coord.handle(conn, Message::AddPid { pid }, &mut out);
            }
        }

        assert!(coord.started());
        coord
    }

    #[test]
    fn test_join_phase_assigns_bijective_gids() {
        let mut coord = Coordinator::new(4, &logging::null());
        let mut out = Vec::new();

        for pid in [11, 22, 33] {
            coord.handle(0, Message::AddPid { pid }, &mut out);
            assert!(!coord.started());
        }
        coord.handle(1, Message::AddPid { pid: 44 }, &mut out);
        assert!(coord.started());

        let mut gids = Vec::new();
        let mut saw_start = false;
        for action in &out {
            match action {
                Action::Send(_, Message::SetGid { gid, .. }) => gids.push(*gid),
                Action::Broadcast { msg: Message::CntAll, except: None } => saw_start = true,
                other => panic!("unexpected action {:?}", other),
            }
        }

        gids.sort_unstable();
        assert_eq!(gids, vec![0, 1, 2, 3]);
        assert!(saw_start);
    }

    #[test]
    fn test_write_grant_broadcast_ack_cycle() {
        let mut coord = started_coordinator(2, &[(0, &[10]), (1, &[20])]);
        let mut out = Vec::new();

        // First request gets the grant immediately.
        coord.handle(0, Message::ReqWrt { pid: 10 }, &mut out);
        assert_eq!(out, vec![Action::Send(0, Message::WrtNow { pid: 10 })]);
        out.clear();

        // A competing request queues behind it, silently.
        coord.handle(1, Message::ReqWrt { pid: 20 }, &mut out);
        assert!(out.is_empty());

        // Data and end-of-write are forwarded to everyone else.
        coord.handle(0, Message::WrtData { offset: 0, bytes: vec![1, 2] }, &mut out);
        assert_eq!(
            out,
            vec![Action::Broadcast {
                msg: Message::WrtData { offset: 0, bytes: vec![1, 2] },
                except: Some(0),
            }]
        );
        out.clear();

        coord.handle(0, Message::WrtEnd, &mut out);
        assert_eq!(out, vec![Action::Broadcast { msg: Message::WrtEnd, except: Some(0) }]);
        out.clear();

        // Quorum reached: the queued writer gets the next grant.
        coord.handle(0, Message::GotData { nproc: 1 }, &mut out);
        assert!(out.is_empty());
        coord.handle(1, Message::GotData { nproc: 1 }, &mut out);
        assert_eq!(out, vec![Action::Send(1, Message::WrtNow { pid: 20 })]);
    }

    #[test]
    fn test_write_completion_returns_to_ready() {
        let mut coord = started_coordinator(2, &[(0, &[10]), (1, &[20])]);
        let mut out = Vec::new();

        coord.handle(0, Message::ReqWrt { pid: 10 }, &mut out);
        coord.handle(0, Message::WrtEnd, &mut out);
        coord.handle(0, Message::GotData { nproc: 1 }, &mut out);
        coord.handle(1, Message::GotData { nproc: 1 }, &mut out);

        // Queue drained: a fresh request starts a new cycle.
        out.clear();
        coord.handle(1, Message::ReqWrt { pid: 20 }, &mut out);
        assert_eq!(out, vec![Action::Send(1, Message::WrtNow { pid: 20 })]);
    }

    #[test]
    #[should_panic(expected = "without the grant")]
    fn test_data_from_non_writer_is_fatal() {
        let mut coord = started_coordinator(2, &[(0, &[10]), (1, &[20])]);
        let mut out = Vec::new();

        coord.handle(0, Message::ReqWrt { pid: 10 }, &mut out);
        coord.handle(1, Message::WrtData { offset: 0, bytes: vec![0] }, &mut out);
    }

    #[test]
    fn test_barrier_releases_at_full_count() {
        let mut coord = started_coordinator(3, &[(0, &[10, 11]), (1, &[20])]);
        let mut out = Vec::new();

        coord.handle(0, Message::HitBar { pid: 10 }, &mut out);
        coord.handle(1, Message::HitBar { pid: 20 }, &mut out);
        assert!(out.is_empty());

        coord.handle(0, Message::HitBar { pid: 11 }, &mut out);
        assert_eq!(out, vec![Action::Broadcast { msg: Message::RelBar, except: None }]);

        // Counter reset: the next barrier needs all three again.
        out.clear();
        coord.handle(0, Message::HitBar { pid: 10 }, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_wait_on_fresh_semaphore_passes() {
        let mut coord = started_coordinator(2, &[(0, &[10]), (1, &[20])]);
        let mut out = Vec::new();

        // Created with value 1: the first wait passes straight through.
        coord.handle(0, Message::WaitSem { name: Name::new("sum"), pid: 10 }, &mut out);
        assert_eq!(out, vec![Action::Send(0, Message::PostSem { name: Name::new("sum"), pid: 10 })]);
    }

    #[test]
    fn test_wait_blocks_then_post_wakes() {
        let mut coord = started_coordinator(2, &[(0, &[10]), (1, &[20])]);
        let mut out = Vec::new();
        let name = Name::new("gate");

        // Drain the initial token, then block.
        coord.handle(0, Message::WaitSem { name, pid: 10 }, &mut out);
        out.clear();
        coord.handle(1, Message::WaitSem { name, pid: 20 }, &mut out);
        assert!(out.is_empty());

        // A post finds the blocked waiter and wakes exactly it.
        coord.handle(0, Message::PostSem { name, pid: 10 }, &mut out);
        assert_eq!(out, vec![Action::Send(1, Message::PostSem { name, pid: 20 })]);

        // No waiter left: a second post banks a token for a later wait.
        out.clear();
        coord.handle(0, Message::PostSem { name, pid: 10 }, &mut out);
        assert!(out.is_empty());
        coord.handle(0, Message::WaitSem { name, pid: 10 }, &mut out);
        assert_eq!(out, vec![Action::Send(0, Message::PostSem { name, pid: 10 })]);
    }

    #[test]
    fn test_exit_drops_connection_processes() {
        let mut coord = started_coordinator(2, &[(0, &[10]), (1, &[20])]);
        let mut out = Vec::new();

        coord.handle(0, Message::Exit, &mut out);
        assert_eq!(out, vec![Action::Close(0)]);

        // The closed-connection notification afterwards is harmless.
        coord.connection_closed(0);
    }

    #[test]
    #[should_panic(expected = "lost arbiter")]
    fn test_silent_peer_loss_is_fatal() {
        let mut coord = started_coordinator(2, &[(0, &[10]), (1, &[20])]);
        coord.connection_closed(1);
    }
}
