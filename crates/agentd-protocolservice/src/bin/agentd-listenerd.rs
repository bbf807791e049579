//! Listener process entry point (§6 "Socket topology"). Binds the
//! client-facing Unix domain socket, accepts connections, and hands each
//! accepted socket's fd off to the protocol service over a control datagram
//! socket via SCM_RIGHTS. Deliberately minimal: no framing, no crypto, no
//! event loop — accepting and handing off is blocking I/O on a dedicated
//! thread-free process, matching the "one small thing per process" model
//! the rest of agentd follows (§5).

use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixDatagram, UnixListener};
use std::path::PathBuf;

use clap::{App, Arg};
use slog::{error, info};
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

use agentd_protocolservice::fdpass;

fn init_logger() -> slog::Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(Severity::Debug);
    builder.destination(Destination::Stderr);
    builder.build().expect("failed to build terminal logger")
}

fn main() {
    let matches = App::new("agentd-listenerd")
        .version("0.1.0")
        .about("Accepts client connections and hands their fds off to the protocol service.")
        .arg(Arg::with_name("LISTEN_SOCKET_PATH").help("Client-facing Unix domain socket to bind").required(true))
        .arg(Arg::with_name("CONTROL_SOCKET_PATH").help("Protocol service's fd-handoff socket").required(true))
        .get_matches();

    let listen_path: PathBuf = matches.value_of("LISTEN_SOCKET_PATH").unwrap().into();
    let control_path: PathBuf = matches.value_of("CONTROL_SOCKET_PATH").unwrap().into();

    let logger = init_logger();
    info!(logger, "starting listener"; "listen" => listen_path.display().to_string(), "control" => control_path.display().to_string());

    if listen_path.exists() {
        let _ = std::fs::remove_file(&listen_path);
    }
    let listener = UnixListener::bind(&listen_path).expect("failed to bind client listener");

    let control = UnixDatagram::unbound().expect("failed to create control socket");
    control.connect(&control_path).expect("failed to connect to protocol service control socket");

    for incoming in listener.incoming() {
        match incoming {
            Ok(stream) => {
                if let Err(err) = fdpass::send_fd(control.as_raw_fd(), stream.as_raw_fd()) {
                    error!(logger, "failed to hand off accepted connection"; "error" => format!("{}", err));
                }
                // `stream` drops here; the protocol service now holds its own
                // duplicate of the underlying fd courtesy of SCM_RIGHTS.
            }
            Err(err) => {
                error!(logger, "accept failed"; "error" => format!("{}", err));
            }
        }
    }
}
