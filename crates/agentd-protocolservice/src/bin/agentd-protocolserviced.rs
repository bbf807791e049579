//! Protocol-service daemon entry point. Receives already-accepted client
//! sockets as fds handed off by `agentd-listenerd` (§6 "Socket topology"),
//! dials out to the data service and random service, and drives every
//! connection's handshake/command state machine through one cooperative
//! event loop (§4.4, §5).
//!
//! Persisted entity directories, process supervision and config-file
//! parsing are out of scope (§1, §6); authorized entities are passed on the
//! command line for this entry point.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::PathBuf;
use std::time::Instant;

use clap::{App, Arg};
use slog::{error, info, warn};
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

use agentd_crypto::PublicKey;
use agentd_ipc::{EventLoop, SocketContext};
use agentd_protocolservice::{fdpass, ConnState, Connection, EntityDirectory, OutboundLink, ServerIdentity};
use agentd_types::{EntityId, Id};
use mio::Token;
use mio_uds::{UnixDatagram, UnixStream};

const CONN_BUF_SIZE: usize = 65536;
const LINK_BUF_SIZE: usize = 16 * 65536;

const TOKEN_CONTROL: usize = 0;
const TOKEN_DATA_LINK: usize = 1;
const TOKEN_RANDOM_LINK: usize = 2;
const TOKEN_BASE: usize = 3;

fn init_logger() -> slog::Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(Severity::Debug);
    builder.destination(Destination::Stderr);
    builder.build().expect("failed to build terminal logger")
}

/// Parses one `--authorize entity-id-hex:public-key-hex` entry.
fn parse_authorization(raw: &str) -> Option<(EntityId, PublicKey)> {
    let mut parts = raw.splitn(2, ':');
    let entity_hex = parts.next()?;
    let key_hex = parts.next()?;

    let entity_bytes = hex::decode(entity_hex).ok()?;
    let id = Id::from_slice(&entity_bytes)?;

    let key_bytes = hex::decode(key_hex).ok()?;
    if key_bytes.len() != agentd_crypto::PUBLIC_KEY_SIZE {
        return None;
    }
    let mut key = [0u8; agentd_crypto::PUBLIC_KEY_SIZE];
    key.copy_from_slice(&key_bytes);

    Some((EntityId(id), PublicKey(key)))
}

fn main() {
    let matches = App::new("agentd-protocolserviced")
        .version("0.1.0")
        .about("Protocol service: runs the client handshake and proxies authenticated commands.")
        .arg(Arg::with_name("CONTROL_SOCKET_PATH").help("Datagram socket fds are handed off on").required(true))
        .arg(Arg::with_name("DATA_SOCKET_PATH").help("Data-service Unix domain socket").required(true))
        .arg(Arg::with_name("RANDOM_SOCKET_PATH").help("Random-service Unix domain socket").required(true))
        .arg(
            Arg::with_name("authorize")
                .long("authorize")
                .value_name("ENTITY_ID_HEX:PUBLIC_KEY_HEX")
                .multiple(true)
                .number_of_values(1)
                .help("Registers an entity allowed to open a session; may be repeated"),
        )
        .get_matches();

    let control_path: PathBuf = matches.value_of("CONTROL_SOCKET_PATH").unwrap().into();
    let data_path: PathBuf = matches.value_of("DATA_SOCKET_PATH").unwrap().into();
    let random_path: PathBuf = matches.value_of("RANDOM_SOCKET_PATH").unwrap().into();

    let logger = init_logger();
    info!(logger, "starting protocol service"; "control" => control_path.display().to_string());

    let mut directory = EntityDirectory::new();
    for raw in matches.values_of("authorize").into_iter().flatten() {
        match parse_authorization(raw) {
            Some((id, key)) => directory.register(id, key),
            None => warn!(logger, "ignoring malformed --authorize entry"; "value" => raw),
        }
    }

    if control_path.exists() {
        let _ = std::fs::remove_file(&control_path);
    }
    let control = UnixDatagram::bind(&control_path).expect("failed to bind control socket");

    let data_stream = UnixStream::connect(&data_path).expect("failed to connect to data service");
    let mut data_link = OutboundLink::new(SocketContext::new(data_stream, Token(TOKEN_DATA_LINK), LINK_BUF_SIZE, LINK_BUF_SIZE));

    let random_stream = UnixStream::connect(&random_path).expect("failed to connect to random service");
    let mut random_link = OutboundLink::new(SocketContext::new(random_stream, Token(TOKEN_RANDOM_LINK), LINK_BUF_SIZE, LINK_BUF_SIZE));

    let mut event_loop = EventLoop::new().expect("failed to initialize event loop");
    event_loop
        .poll()
        .register(&control, Token(TOKEN_CONTROL), mio::Ready::readable(), mio::PollOpt::edge())
        .expect("failed to register control socket");
    data_link
        .socket
        .set_interest(event_loop.poll(), true, false)
        .expect("failed to register data-service link");
    random_link
        .socket
        .set_interest(event_loop.poll(), true, false)
        .expect("failed to register random-service link");

    let identity = ServerIdentity::generate(EntityId::random());
    let mut connections: Vec<Option<Connection>> = Vec::new();

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
            match token.0 {
                TOKEN_CONTROL => {
                    if readiness.is_readable() {
                        accept_handoffs(&control, &mut connections, &mut event_loop, &logger);
                    }
                }
                TOKEN_DATA_LINK => {
                    if readiness.is_readable() && !drain_data_link(&mut data_link, &mut connections, &mut event_loop) {
                        error!(logger, "data-service link failed, shutting down");
                        event_loop.force_exit.set();
                    }
                    if readiness.is_writable() {
                        let _ = data_link.socket.egress();
                    }
                }
                TOKEN_RANDOM_LINK => {
                    if readiness.is_readable()
                        && !drain_random_link(&mut random_link, &mut connections, &identity, &mut event_loop)
                    {
                        error!(logger, "random-service link failed, shutting down");
                        event_loop.force_exit.set();
                    }
                    if readiness.is_writable() {
                        let _ = random_link.socket.egress();
                    }
                }
                raw_token => {
                    let index = raw_token - TOKEN_BASE;
                    let remove = service_connection(
                        index,
                        &mut connections,
                        readiness,
                        &mut event_loop,
                        &directory,
                        &identity,
                        &mut random_link,
                        &mut data_link,
                    );
                    if remove {
                        teardown_connection(index, &mut connections, &mut event_loop, &mut data_link);
                        info!(logger, "connection closed"; "index" => index);
                    }
                }
            }
        }
    }
}

fn flush_socket(ctx: &mut SocketContext, event_loop: &EventLoop) {
    if !ctx.write_buf().is_empty() {
        let _ = ctx.set_interest(event_loop.poll(), true, true);
        let _ = ctx.egress();
    } else {
        let _ = ctx.set_interest(event_loop.poll(), true, false);
    }
}

fn accept_handoffs(
    control: &UnixDatagram,
    connections: &mut Vec<Option<Connection>>,
    event_loop: &mut EventLoop,
    logger: &slog::Logger,
) {
    loop {
        match fdpass::recv_fd(control.as_raw_fd()) {
            Ok(Some(fd)) => {
                let std_stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
                if std_stream.set_nonblocking(true).is_err() {
                    continue;
                }
                let stream = match UnixStream::from_stream(std_stream) {
                    Ok(stream) => stream,
                    Err(err) => {
                        error!(logger, "failed to adopt handed-off socket"; "error" => format!("{}", err));
                        continue;
                    }
                };

                let index = connections.len();
                let token = Token(index + TOKEN_BASE);
                let mut ctx = SocketContext::new(stream, token, CONN_BUF_SIZE, CONN_BUF_SIZE);
                if ctx.set_interest(event_loop.poll(), true, false).is_err() {
                    error!(logger, "failed to register handed-off connection"; "index" => index);
                    continue;
                }
                connections.push(Some(Connection::new(ctx, index)));
                info!(logger, "accepted handed-off connection"; "index" => index);
            }
            Ok(None) => continue,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) => {
                error!(logger, "fd handoff receive failed"; "error" => format!("{}", err));
                break;
            }
        }
    }
}

/// Returns `false` if the link itself died, which is a process-wide fault.
fn drain_data_link(data_link: &mut OutboundLink, connections: &mut Vec<Option<Connection>>, event_loop: &mut EventLoop) -> bool {
    let pairs = match data_link.drain_responses() {
        Some(pairs) => pairs,
        None => return false,
    };
    for (index, payload) in pairs {
        if let Some(Some(conn)) = connections.get_mut(index).map(|slot| slot.as_mut()) {
            conn.on_dataservice_response(&payload);
            flush_socket(&mut conn.socket, event_loop);
        }
    }
    true
}

fn drain_random_link(
    random_link: &mut OutboundLink,
    connections: &mut Vec<Option<Connection>>,
    identity: &ServerIdentity,
    event_loop: &mut EventLoop,
) -> bool {
    let pairs = match random_link.drain_responses() {
        Some(pairs) => pairs,
        None => return false,
    };
    for (index, payload) in pairs {
        if let Some(Some(conn)) = connections.get_mut(index).map(|slot| slot.as_mut()) {
            conn.on_random_response(&payload, identity);
            flush_socket(&mut conn.socket, event_loop);
        }
    }
    true
}

/// Drives one client connection's readable/writable readiness through its
/// state machine. Returns `true` if the connection should be torn down.
fn service_connection(
    index: usize,
    connections: &mut Vec<Option<Connection>>,
    readiness: mio::Ready,
    event_loop: &mut EventLoop,
    directory: &EntityDirectory,
    identity: &ServerIdentity,
    random_link: &mut OutboundLink,
    data_link: &mut OutboundLink,
) -> bool {
    let conn = match connections.get_mut(index).and_then(|slot| slot.as_mut()) {
        Some(conn) => conn,
        None => return false,
    };

    if readiness.is_readable() {
        if !conn.on_client_readable(directory, identity, random_link) {
            flush_socket(&mut random_link.socket, event_loop);
            return true;
        }
        flush_socket(&mut random_link.socket, event_loop);

        if conn.state() == ConnState::ReadCmd {
            if !conn.drive_command(data_link) {
                flush_socket(&mut data_link.socket, event_loop);
                return true;
            }
            flush_socket(&mut data_link.socket, event_loop);
        }
    }

    if readiness.is_writable() {
        conn.on_client_writable(data_link);
        flush_socket(&mut data_link.socket, event_loop);
    }

    flush_socket(&mut conn.socket, event_loop);
    conn.should_close()
}

fn teardown_connection(
    index: usize,
    connections: &mut Vec<Option<Connection>>,
    event_loop: &mut EventLoop,
    data_link: &mut OutboundLink,
) {
    if let Some(slot) = connections.get_mut(index) {
        if let Some(mut conn) = slot.take() {
            conn.close_child_context(data_link);
            flush_socket(&mut data_link.socket, event_loop);
            let _ = conn.socket.deregister(event_loop.poll());
        }
    }
}
