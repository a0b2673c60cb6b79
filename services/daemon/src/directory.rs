//! The session directory: maps session names to the port of their server.
//! The first request for an unknown name spawns a server; arbiters that
//! arrive before the server has reported its port are parked and released
//! in one sweep when the port comes in.
//!
//! Like the session coordinator, the directory is pure state; handlers emit
//! actions for the main loop to execute.

use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use osmium::net::endpoint::ChannelId;
use osmium::proto::{Message, Name};
use plasma::logging;

#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    Send(ChannelId, Message),
    /// Close the connection once pending sends are flushed.
    Drop(ChannelId),
    /// Launch a session server for the named session.
    Spawn { name: Name, nproc: i32 },
}

struct SessionRec {
    port: Option<i32>,
    waiters: Vec<ChannelId>,
}

pub struct Directory {
    sessions: HashMap<Name, SessionRec>,
    log: logging::Logger,
}

impl Directory {
    pub fn new(log: &logging::Logger) -> Directory {
        Directory { sessions: HashMap::new(), log: log.new(logging::o!()) }
    }

    #[inline]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn handle(&mut self, conn: ChannelId, msg: Message, out: &mut Vec<Action>) {
        match msg {
            Message::GetSid { name, nproc } => self.on_get_sid(conn, name, nproc, out),
            Message::SetSid { name, port } => self.on_set_sid(conn, name, port, out),
            Message::DelSid { name } => self.on_del_sid(conn, name, out),
            other => {
                logging::warn!(self.log, "unknown message, dropping sender";
                               "context" => "handle",
                               "message" => ?other);
                out.push(Action::Drop(conn));
            }
        }
    }

    /// Forgets a connection that disappeared on its own.
    pub fn connection_closed(&mut self, conn: ChannelId) {
        for rec in self.sessions.values_mut() {
            rec.waiters.retain(|&w| w != conn);
        }
    }

    fn on_get_sid(&mut self, conn: ChannelId, name: Name, nproc: i32, out: &mut Vec<Action>) {
        // A one-process session can never release its own barrier.
        if nproc < 2 {
            logging::warn!(self.log, "session request rejected";
                           "context" => "get_sid",
                           "session" => %name,
                           "nproc" => nproc);
            out.push(Action::Send(conn, Message::DelSid { name }));
            out.push(Action::Drop(conn));
            return;
        }

        match self.sessions.entry(name) {
            Entry::Vacant(slot) => {
                logging::info!(self.log, "spawning session server";
                               "context" => "get_sid",
                               "session" => %name,
                               "nproc" => nproc);

                slot.insert(SessionRec { port: None, waiters: vec![conn] });
                out.push(Action::Spawn { name, nproc });
            }
            Entry::Occupied(mut entry) => match entry.get().port {
                Some(port) => {
                    out.push(Action::Send(conn, Message::SetSid { name, port }));
                    out.push(Action::Drop(conn));
                }
                None => entry.get_mut().waiters.push(conn),
            },
        }
    }

    fn on_set_sid(&mut self, conn: ChannelId, name: Name, port: i32, out: &mut Vec<Action>) {
        assert!(port > 0, "session server reported an invalid port");

        let rec = self
            .sessions
            .get_mut(&name)
            .unwrap_or_else(|| panic!("port report for unknown session {}", name));

        logging::info!(self.log, "session registered";
                       "context" => "set_sid",
                       "session" => %name,
                       "port" => port,
                       "waiters" => rec.waiters.len());

        rec.port = Some(port);

        for waiter in rec.waiters.drain(..) {
            out.push(Action::Send(waiter, Message::SetSid { name, port }));
            out.push(Action::Drop(waiter));
        }

        out.push(Action::Drop(conn));
    }

    fn on_del_sid(&mut self, conn: ChannelId, name: Name, out: &mut Vec<Action>) {
        if let Some(rec) = self.sessions.remove(&name) {
            logging::info!(self.log, "session retracted";
                           "context" => "del_sid",
                           "session" => %name);

            for waiter in rec.waiters {
                out.push(Action::Drop(waiter));
            }
        }

        out.push(Action::Drop(conn));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> Directory {
        Directory::new(&logging::null())
    }

    #[test]
    fn test_first_request_spawns_server() {
        let mut dir = directory();
        let mut out = Vec::new();

        dir.handle(0, Message::GetSid { name: Name::new("alpha"), nproc: 4 }, &mut out);

        assert_eq!(out, vec![Action::Spawn { name: Name::new("alpha"), nproc: 4 }]);
        assert_eq!(dir.session_count(), 1);
    }

    #[test]
    fn test_waiters_flushed_on_port_report() {
        let mut dir = directory();
        let mut out = Vec::new();
        let name = Name::new("alpha");

        dir.handle(0, Message::GetSid { name, nproc: 4 }, &mut out);
        out.clear();

        // A second arbiter asks before the server is up: it parks.
        dir.handle(1, Message::GetSid { name, nproc: 4 }, &mut out);
        assert!(out.is_empty());

        // The server reports in; both waiters get the port and go away.
        dir.handle(2, Message::SetSid { name, port: 4801 }, &mut out);
        assert_eq!(
            out,
            vec![
                Action::Send(0, Message::SetSid { name, port: 4801 }),
                Action::Drop(0),
                Action::Send(1, Message::SetSid { name, port: 4801 }),
                Action::Drop(1),
                Action::Drop(2),
            ]
        );
    }

    #[test]
    fn test_known_session_answered_directly() {
        let mut dir = directory();
        let mut out = Vec::new();
        let name = Name::new("alpha");

        dir.handle(0, Message::GetSid { name, nproc: 4 }, &mut out);
        dir.handle(1, Message::SetSid { name, port: 4801 }, &mut out);
        out.clear();

        dir.handle(5, Message::GetSid { name, nproc: 4 }, &mut out);
        assert_eq!(
            out,
            vec![Action::Send(5, Message::SetSid { name, port: 4801 }), Action::Drop(5)]
        );
    }

    #[test]
    fn test_undersized_session_rejected() {
        let mut dir = directory();
        let mut out = Vec::new();
        let name = Name::new("solo");

        dir.handle(3, Message::GetSid { name, nproc: 1 }, &mut out);

        assert_eq!(out, vec![Action::Send(3, Message::DelSid { name }), Action::Drop(3)]);
        assert_eq!(dir.session_count(), 0);
    }

    #[test]
    fn test_retraction_erases_session() {
        let mut dir = directory();
        let mut out = Vec::new();
        let name = Name::new("alpha");

        dir.handle(0, Message::GetSid { name, nproc: 2 }, &mut out);
        out.clear();

        dir.handle(1, Message::DelSid { name }, &mut out);
        assert_eq!(dir.session_count(), 0);
        // The parked waiter is dropped along with the record.
        assert!(out.contains(&Action::Drop(0)));
        assert!(out.contains(&Action::Drop(1)));

        // The name is reusable afterwards.
        out.clear();
        dir.handle(4, Message::GetSid { name, nproc: 2 }, &mut out);
        assert_eq!(out, vec![Action::Spawn { name, nproc: 2 }]);
    }

    #[test]
    fn test_vanished_waiter_forgotten() {
        let mut dir = directory();
        let mut out = Vec::new();
        let name = Name::new("alpha");

        dir.handle(0, Message::GetSid { name, nproc: 2 }, &mut out);
        dir.connection_closed(0);
        out.clear();

        dir.handle(1, Message::SetSid { name, port: 4801 }, &mut out);
        assert_eq!(out, vec![Action::Drop(1)]);
    }

    #[test]
    fn test_unknown_message_drops_sender() {
        let mut dir = directory();
        let mut out = Vec::new();

        dir.handle(9, Message::HitBar { pid: 1 }, &mut out);
        assert_eq!(out, vec![Action::Drop(9)]);
    }
}
