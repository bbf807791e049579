//! Random-service daemon entry point: a thin Unix-socket front end over
//! `RandomService`. Persistence, supervision and config-file parsing are out
//! of scope (§1, §6).

use std::path::PathBuf;
use std::time::Instant;

use clap::{App, Arg};
use slog::{error, info};
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

use agentd_ipc::frame;
use agentd_ipc::{ErrorUtils, EventLoop, SocketContext};
use agentd_randomservice::RandomService;
use mio::Token;
use mio_uds::UnixListener;

const CONN_BUF_SIZE: usize = 65536;

fn init_logger() -> slog::Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(Severity::Debug);
    builder.destination(Destination::Stderr);
    builder.build().expect("failed to build terminal logger")
}

fn main() {
    let matches = App::new("agentd-randomserviced")
        .version("0.1.0")
        .about("Random service: answers get_random_bytes requests over a Unix socket.")
        .arg(
            Arg::with_name("SOCKET_PATH")
                .help("Path of the Unix domain socket to listen on")
                .required(true),
        )
        .get_matches();

    let socket_path: PathBuf = matches.value_of("SOCKET_PATH").unwrap().into();

    let logger = init_logger();
    info!(logger, "starting random service"; "socket" => socket_path.display().to_string());

    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }
    let listener = UnixListener::bind(&socket_path).expect("failed to bind random-service socket");

    let mut event_loop = EventLoop::new().expect("failed to initialize event loop");
    event_loop
        .poll()
        .register(&listener, Token(0), mio::Ready::readable(), mio::PollOpt::edge())
        .expect("failed to register listener");

    let service = RandomService::new();
    let mut connections: Vec<Option<SocketContext>> = Vec::new();

    loop {
        if event_loop.force_exit.is_set() {
            info!(logger, "force exit requested, shutting down");
            break;
        }

        let now = Instant::now();
        let events = match event_loop.wait(now) {
            Ok(events) => events,
            Err(err) => {
                error!(logger, "poll failed"; "error" => format!("{}", err));
                break;
            }
        };

        let ready: Vec<(Token, mio::Ready)> = events.iter().map(|e| (e.token(), e.readiness())).collect();

        for (token, readiness) in ready {
            if token == Token(0) {
                if readiness.is_readable() {
                    accept_connections(&listener, &mut connections, &mut event_loop, &logger);
                }
                continue;
            }

            let index = token.0 - 1;
            let done = drive_connection(index, &mut connections, &mut event_loop, &service, &logger);
            if done {
                if let Some(slot) = connections.get_mut(index) {
                    if let Some(mut ctx) = slot.take() {
                        let _ = ctx.deregister(event_loop.poll());
                    }
                }
            }
        }
    }
}

fn accept_connections(
    listener: &UnixListener,
    connections: &mut Vec<Option<SocketContext>>,
    event_loop: &mut EventLoop,
    logger: &slog::Logger,
) {
    loop {
        match listener.accept() {
            Ok(Some((stream, _addr))) => {
                let index = connections.len();
                let token = Token(index + 1);
                let mut ctx = SocketContext::new(stream, token, CONN_BUF_SIZE, CONN_BUF_SIZE);
                if ctx.set_interest(event_loop.poll(), true, false).is_err() {
                    error!(logger, "failed to register connection"; "index" => index);
                    continue;
                }
                connections.push(Some(ctx));
            }
            Ok(None) => break,
            Err(err) => {
                error!(logger, "accept failed"; "error" => format!("{}", err));
                break;
            }
        }
    }
}

fn drive_connection(
    index: usize,
    connections: &mut Vec<Option<SocketContext>>,
    event_loop: &mut EventLoop,
    service: &RandomService,
    logger: &slog::Logger,
) -> bool {
    let ctx = match connections.get_mut(index).and_then(|slot| slot.as_mut()) {
        Some(ctx) => ctx,
        None => return true,
    };

    let ingress_result = ctx.ingress();
    if ingress_result.has_failed() {
        info!(logger, "connection closed"; "index" => index);
        return true;
    }

    loop {
        let buf = ctx.read_buf().read_slice();
        let (_, size) = match frame::peek_data_header(buf) {
            Ok(Some(header)) => header,
            Ok(None) => break,
            Err(_) => return true,
        };
        let total = frame::HEADER_SIZE + size;
        if buf.len() < total {
            break;
        }

        let payload = match frame::decode_data(buf) {
            Ok(payload) => payload.to_vec(),
            Err(_) => return true,
        };
        ctx.read_buf().drain(total);

        let response = service.handle(&payload);
        let encoded = frame::encode_data(&response.encode());
        ctx.write_buf().push(&encoded);
    }

    if !ctx.write_buf().is_empty() {
        let _ = ctx.set_interest(event_loop.poll(), true, true);
        if ctx.egress().is_err() {
            return true;
        }
    } else {
        let _ = ctx.set_interest(event_loop.poll(), true, false);
    }

    false
}
