use clap::{App, Arg};
use dsm_daemon::directory::{Action, Directory};
use nix::sys::wait::waitpid;
use nix::unistd::{execvp, fork, setsid, ForkResult};
use osmium::net::endpoint::{Endpoint, EndpointEvent};
use osmium::proto::Name;
use osmium::{DAEMON_PORT, LOOPBACK};
use plasma::logging;
use std::env;
use std::ffi::CString;
use std::net::SocketAddr;

// Environment override for the session server binary; otherwise resolved
// through PATH.
const SERVER_ENV: &str = "DSM_SERVER";
const SERVER_BIN: &str = "dsm-server";

fn main() {
    let matches = App::new("DSM Session Daemon")
        .version("1.0")
        .about("Maps session names to their server, spawning servers on demand.")
        .arg(
            Arg::with_name("port")
                .long("port")
                .takes_value(true)
                .help("Listen port (default: the well-known daemon port)"),
        )
        .get_matches();

    let port: u16 = match matches.value_of("port") {
        Some(raw) => raw.parse().expect("--port must be a port number"),
        None => DAEMON_PORT,
    };

    let log = logging::init("dsmd");

    let addr: SocketAddr =
        format!("{}:{}", LOOPBACK, port).parse().expect("Broken listen address");
    let mut endpoint = Endpoint::bind(addr, &log)
        .unwrap_or_else(|err| panic!("Couldn't bind daemon port {}: {}", port, err));

    logging::info!(log, "daemon ready"; "port" => port);

    let mut directory = Directory::new(&log);
    let mut events = Vec::new();
    let mut actions = Vec::new();

    loop {
        endpoint.poll(&mut events).expect("Daemon poll failed");

        for event in events.drain(..) {
            match event {
                EndpointEvent::Opened(_) => (),
                EndpointEvent::Frame(conn, msg) => directory.handle(conn, msg, &mut actions),
                EndpointEvent::Closed(conn) => directory.connection_closed(conn),
            }

            for action in actions.drain(..) {
                match action {
                    Action::Send(conn, msg) => {
                        // A vanished requester is not the daemon's problem.
                        if let Err(err) = endpoint.send(conn, &msg) {
                            logging::warn!(log, "reply failed";
                                           "conn" => conn,
                                           "error" => ?err);
                            endpoint.close(conn);
                            directory.connection_closed(conn);
                        }
                    }
                    Action::Drop(conn) => endpoint.close(conn),
                    Action::Spawn { name, nproc } => spawn_server(&log, &name, nproc),
                }
            }
        }
    }
}

/// Launches a session server as a detached grandchild: fork twice, detach
/// the grandchild from our session, exec the server binary. The
/// intermediate child exits immediately and is reaped here, so the server
/// is never our zombie.
fn spawn_server(log: &logging::Logger, name: &Name, nproc: i32) {
    let binary = env::var(SERVER_ENV).unwrap_or_else(|_| SERVER_BIN.to_string());

    logging::debug!(log, "exec session server";
                    "context" => "spawn",
                    "binary" => %binary,
                    "session" => %name);

    match unsafe { fork() }.expect("Couldn't fork for session server") {
        ForkResult::Parent { child } => {
            let _ = waitpid(child, None);
        }
        ForkResult::Child => {
            match unsafe { fork() } {
                Ok(ForkResult::Child) => {
                    let _ = setsid();

                    let argv: Vec<CString> = vec![
                        CString::new(binary.as_str()).expect("binary path with NUL"),
                        CString::new(format!("{}", name)).expect("session name with NUL"),
                        CString::new(nproc.to_string()).expect("nproc with NUL"),
                    ];

                    match execvp(&argv[0], &argv) {
                        Ok(_) => unreachable!(),
                        Err(err) => {
                            eprintln!("exec {} failed: {}", binary, err);
                            unsafe { libc::_exit(1) }
                        }
                    }
                }
                // Intermediate child: orphan the grandchild and leave.
                _ => unsafe { libc::_exit(0) },
            }
        }
    }
}
