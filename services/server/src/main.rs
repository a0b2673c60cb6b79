use clap::{App, Arg};
use dsm_server::session::{Action, Coordinator};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult};
use osmium::net::endpoint::{Endpoint, EndpointEvent};
use osmium::proto::{self, Message, Name};
use osmium::{DAEMON_PORT, LOOPBACK};
use plasma::logging;
use std::net::{SocketAddr, TcpStream};
use std::process;

fn main() {
    let matches = App::new("DSM Session Server")
        .version("1.0")
        .about("Coordinates one named shared-memory session.")
        .arg(Arg::with_name("SESSION").help("Session identifier").required(true))
        .arg(
            Arg::with_name("NPROC")
                .help("Total number of expected processes (>= 2)")
                .required(true),
        )
        .get_matches();

    let session = matches.value_of("SESSION").unwrap().to_string();
    let nproc: usize = matches
        .value_of("NPROC")
        .unwrap()
        .parse()
        .ok()
        .filter(|&n| n >= 2)
        .expect("NPROC must be an integer >= 2");

    // The parent lingers as the cleanup notifier: once the serving child
    // exits, it retracts the session from the daemon.
    match unsafe { fork() }.expect("Couldn't fork session server") {
        ForkResult::Parent { child } => {
            let _ = waitpid(child, None);
            retract_session(&session);
            process::exit(0);
        }
        ForkResult::Child => serve(&session, nproc),
    }
}

fn serve(session: &str, nproc: usize) -> ! {
    let log = logging::init("dsm-server");

    let addr: SocketAddr =
        format!("{}:0", LOOPBACK).parse().expect("Broken loopback address literal");
    let mut endpoint = Endpoint::bind(addr, &log).expect("Couldn't bind session port");
    let port = endpoint.local_addr().expect("Couldn't read bound port").port();

    logging::info!(log, "session ready"; "session" => session, "port" => port, "nproc" => nproc);

    advertise_session(session, port);

    let mut coordinator = Coordinator::new(nproc, &log);
    let mut events = Vec::new();
    let mut actions = Vec::new();

    loop {
        endpoint.poll(&mut events).expect("Session poll failed");

        for event in events.drain(..) {
            match event {
                EndpointEvent::Opened(_) => (),
                EndpointEvent::Frame(conn, msg) => coordinator.handle(conn, msg, &mut actions),
                EndpointEvent::Closed(conn) => coordinator.connection_closed(conn),
            }

            for action in actions.drain(..) {
                match action {
                    Action::Send(conn, msg) => endpoint
                        .send(conn, &msg)
                        .unwrap_or_else(|err| panic!("send to arbiter failed: {:?}", err)),
                    Action::Broadcast { msg, except } => endpoint
                        .broadcast(&msg, except)
                        .unwrap_or_else(|err| panic!("broadcast failed: {:?}", err)),
                    Action::Close(conn) => endpoint.close(conn),
                }
            }
        }

        // The last arbiter has said goodbye; the session is over.
        if coordinator.started() && endpoint.connection_count() == 0 {
            break;
        }
    }

    logging::info!(log, "session complete"; "session" => session);
    process::exit(0);
}

/// Reports the bound port to the daemon. The daemon releases every arbiter
/// waiting on this session.
fn advertise_session(session: &str, port: u16) {
    let mut daemon = TcpStream::connect((LOOPBACK, DAEMON_PORT))
        .expect("Couldn't reach the session daemon");

    let msg = Message::SetSid { name: Name::new(session), port: i32::from(port) };
    proto::write_msg(&mut daemon, &msg).expect("Couldn't advertise session");
}

/// Tells the daemon the session is gone. The daemon may already be down
/// during host teardown; that is fine.
fn retract_session(session: &str) {
    if let Ok(mut daemon) = TcpStream::connect((LOOPBACK, DAEMON_PORT)) {
        let msg = Message::DelSid { name: Name::new(session) };
        let _ = proto::write_msg(&mut daemon, &msg);
    }
}
