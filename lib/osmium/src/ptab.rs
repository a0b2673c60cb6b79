//! The process table kept by the server and by each arbiter: processes
//! keyed by the connection they arrived on plus their local pid, with the
//! counters that drive barrier release and write acknowledgement.

use crate::semtab::SemId;
use crate::{ConnId, Gid, Pid};
use hashbrown::HashMap;

/// One registered process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proc {
    pub pid: Pid,
    pub gid: Gid,
    /// Semaphore the process is blocked on, if any.
    pub sem_id: Option<SemId>,
    /// Stopped until the session starts.
    pub stopped: bool,
    /// Blocked on a barrier or a semaphore.
    pub blocked: bool,
    /// Queued for a write grant.
    pub queued: bool,
}

pub struct ProcessTable {
    conns: HashMap<ConnId, Vec<Proc>>,
    next_gid: Gid,
    nproc: usize,
    /// Processes accounted for in the current join phase or write
    /// acknowledgement round.
    pub nready: usize,
    /// Processes currently waiting at the barrier.
    pub nblocked: usize,
}

impl ProcessTable {
    pub fn new() -> ProcessTable {
        ProcessTable {
            conns: HashMap::new(),
            next_gid: 0,
            nproc: 0,
            nready: 0,
            nblocked: 0,
        }
    }

    /// Total number of registered processes.
    #[inline]
    pub fn len(&self) -> usize {
        self.nproc
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nproc == 0
    }

    /// Registers a process under the given connection and assigns it the
    /// next global identifier. Duplicate registration is a protocol
    /// violation.
    pub fn register(&mut self, conn: ConnId, pid: Pid) -> &mut Proc {
        let procs = self.conns.entry(conn).or_insert_with(Vec::new);

        assert!(
            procs.iter().all(|p| p.pid != pid),
            "process {} already registered on connection {}",
            pid,
            conn
        );

        procs.push(Proc {
            pid,
            gid: self.next_gid,
            sem_id: None,
            stopped: false,
            blocked: false,
            queued: false,
        });
        self.next_gid += 1;
        self.nproc += 1;

        procs.last_mut().expect("entry vanished right after insertion")
    }

    pub fn get(&self, conn: ConnId, pid: Pid) -> Option<&Proc> {
        self.conns.get(&conn).and_then(|procs| procs.iter().find(|p| p.pid == pid))
    }

    pub fn get_mut(&mut self, conn: ConnId, pid: Pid) -> Option<&mut Proc> {
        self.conns
            .get_mut(&conn)
            .and_then(|procs| procs.iter_mut().find(|p| p.pid == pid))
    }

    /// Removes one process. Returns true if it existed.
    pub fn remove(&mut self, conn: ConnId, pid: Pid) -> bool {
        let removed = match self.conns.get_mut(&conn) {
            Some(procs) => match procs.iter().position(|p| p.pid == pid) {
                Some(at) => {
                    procs.remove(at);
                    true
                }
                None => false,
            },
            None => false,
        };

        if removed {
            self.nproc -= 1;
        }

        removed
    }

    /// Drops every process registered under a connection. Returns how many
    /// were removed.
    pub fn remove_conn(&mut self, conn: ConnId) -> usize {
        let removed = self.conns.remove(&conn).map_or(0, |procs| procs.len());
        self.nproc -= removed;
        removed
    }

    /// Finds a process by pid alone, across connections. Local pids are
    /// unique within one host's table.
    pub fn find_pid(&mut self, pid: Pid) -> Option<(ConnId, &mut Proc)> {
        for (&conn, procs) in self.conns.iter_mut() {
            if let Some(proc_) = procs.iter_mut().find(|p| p.pid == pid) {
                return Some((conn, proc_));
            }
        }
        None
    }

    /// First process blocked on the given semaphore, in table iteration
    /// order.
    pub fn first_with_sem(&mut self, sem_id: SemId) -> Option<(ConnId, &mut Proc)> {
        for (&conn, procs) in self.conns.iter_mut() {
            if let Some(proc_) = procs.iter_mut().find(|p| p.sem_id == Some(sem_id)) {
                return Some((conn, proc_));
            }
        }
        None
    }

    /// Visits every process with its connection.
    pub fn for_each_mut<F: FnMut(ConnId, &mut Proc)>(&mut self, mut f: F) {
        for (&conn, procs) in self.conns.iter_mut() {
            for proc_ in procs.iter_mut() {
                f(conn, proc_);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_lookup_remove() {
        let mut ptab = ProcessTable::new();

        // Fifteen processes across five connections, three pids each.
        for conn in 0..5usize {
            for slot in 0..3 {
                ptab.register(conn, (3 * conn + slot) as Pid);
            }
        }
        assert_eq!(ptab.len(), 15);

        assert_eq!(ptab.get(1, 3).unwrap().pid, 3);
        assert_eq!(ptab.get(2, 8).unwrap().pid, 8);
        assert_eq!(ptab.get(4, 14).unwrap().pid, 14);
        assert!(ptab.get(0, 14).is_none());

        assert!(ptab.remove(0, 1));
        assert!(ptab.get(0, 1).is_none());
        assert!(ptab.remove(1, 5));
        assert!(ptab.get(1, 5).is_none());
        assert!(ptab.remove(3, 9));
        assert!(ptab.get(3, 9).is_none());
        assert!(!ptab.remove(3, 9));
        assert_eq!(ptab.len(), 12);
    }

    #[test]
    fn test_semaphore_waiter_scan() {
        let mut ptab = ProcessTable::new();
        for conn in 0..5usize {
            for slot in 0..3 {
                ptab.register(conn, (3 * conn + slot) as Pid);
            }
        }

        ptab.get_mut(0, 0).unwrap().sem_id = Some(42);
        ptab.get_mut(4, 13).unwrap().sem_id = Some(42);

        // Drain every waiter on 42; both must surface with the right
        // connection attached.
        let mut seen = Vec::new();
        while let Some((conn, proc_)) = ptab.first_with_sem(42) {
            let pid = proc_.pid;
            seen.push((conn, pid));
            assert!(ptab.remove(conn, pid));
        }

        seen.sort_unstable();
        assert_eq!(seen, vec![(0, 0), (4, 13)]);
        assert!(ptab.first_with_sem(42).is_none());
    }

    #[test]
    fn test_gid_assignment_is_bijective() {
        let mut ptab = ProcessTable::new();
        for pid in 0..8 {
            ptab.register(pid as ConnId % 2, pid);
        }

        let mut gids = Vec::new();
        ptab.for_each_mut(|_, proc_| gids.push(proc_.gid));
        gids.sort_unstable();
        assert_eq!(gids, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_remove_conn_drops_all() {
        let mut ptab = ProcessTable::new();
        ptab.register(7, 100);
        ptab.register(7, 101);
        ptab.register(8, 102);

        assert_eq!(ptab.remove_conn(7), 2);
        assert_eq!(ptab.len(), 1);
        assert_eq!(ptab.remove_conn(7), 0);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_duplicate_registration_panics() {
        let mut ptab = ProcessTable::new();
        ptab.register(0, 1);
        ptab.register(0, 1);
    }
}
