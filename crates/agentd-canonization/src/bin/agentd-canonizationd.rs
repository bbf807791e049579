//! Canonization-pipeline daemon entry point. Dials out to the data service
//! and random service and drives the block-build cycle on a timer (§4.5,
//! §6). Persisted configuration and process supervision are out of scope
//! (§1, §6); the redrive interval and max-transactions-per-block are passed
//! on the command line.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{App, Arg};
use slog::{error, info, warn};
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

use agentd_canonization::{Config, Identity, Link, Outcome, Pipeline};
use agentd_crypto::CryptoSuite;
use agentd_ipc::{EventLoop, SocketContext};
use agentd_types::{EntityId, Id};
use mio::Token;
use mio_uds::UnixStream;

const LINK_BUF_SIZE: usize = 65536;
const TOKEN_DATA: usize = 0;
const TOKEN_RANDOM: usize = 1;

const DEFAULT_BLOCK_MAX_MILLIS: u64 = 1000;
const DEFAULT_MAX_TRANSACTIONS: usize = 64;
const DEFAULT_CERT_VERSION: u32 = 1;

fn init_logger() -> slog::Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(Severity::Debug);
    builder.destination(Destination::Stderr);
    builder.build().expect("failed to build terminal logger")
}

fn main() {
    let matches = App::new("agentd-canonizationd")
        .version("0.1.0")
        .about("Canonization pipeline: assembles attested transactions into blocks on a timer.")
        .arg(Arg::with_name("DATA_SOCKET_PATH").help("Data-service Unix domain socket").required(true))
        .arg(Arg::with_name("RANDOM_SOCKET_PATH").help("Random-service Unix domain socket").required(true))
        .arg(
            Arg::with_name("entity-id")
                .long("entity-id")
                .value_name("ENTITY_ID_HEX")
                .help("Signer entity id this canonizer stamps into every block header; random if omitted"),
        )
        .arg(
            Arg::with_name("block-max-millis")
                .long("block-max-millis")
                .value_name("MILLIS")
                .help("Redrive interval when the last build did not fill a block"),
        )
        .arg(
            Arg::with_name("max-transactions")
                .long("max-transactions")
                .value_name("COUNT")
                .help("Maximum number of transactions to pack into one block"),
        )
        .get_matches();

    let data_path: PathBuf = matches.value_of("DATA_SOCKET_PATH").unwrap().into();
    let random_path: PathBuf = matches.value_of("RANDOM_SOCKET_PATH").unwrap().into();

    let logger = init_logger();
    info!(logger, "starting canonization pipeline"; "data" => data_path.display().to_string(), "random" => random_path.display().to_string());

    let entity_id = match matches.value_of("entity-id") {
        Some(raw) => match hex::decode(raw).ok().and_then(|bytes| Id::from_slice(&bytes)) {
            Some(id) => EntityId(id),
            None => {
                warn!(logger, "ignoring malformed --entity-id, generating a random one"; "value" => raw);
                EntityId::random()
            }
        },
        None => EntityId::random(),
    };

    let block_max_millis: u64 = matches
        .value_of("block-max-millis")
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_BLOCK_MAX_MILLIS);
    let max_transactions: usize = matches
        .value_of("max-transactions")
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_TRANSACTIONS);

    let data_stream = UnixStream::connect(&data_path).expect("failed to connect to data service");
    let mut data_link = Link::new(SocketContext::new(data_stream, Token(TOKEN_DATA), LINK_BUF_SIZE, LINK_BUF_SIZE));

    let random_stream = UnixStream::connect(&random_path).expect("failed to connect to random service");
    let mut random_link = Link::new(SocketContext::new(random_stream, Token(TOKEN_RANDOM), LINK_BUF_SIZE, LINK_BUF_SIZE));

    let mut event_loop = EventLoop::new().expect("failed to initialize event loop");
    data_link
        .socket
        .set_interest(event_loop.poll(), true, false)
        .expect("failed to register data-service link");
    random_link
        .socket
        .set_interest(event_loop.poll(), true, false)
        .expect("failed to register random-service link");

    let mut pipeline = Pipeline::new(
        Identity {
            entity_id,
            suite: CryptoSuite::current(),
        },
        Config {
            max_transactions,
            cert_version: DEFAULT_CERT_VERSION,
        },
    );

    let block_max = Duration::from_millis(block_max_millis);
    event_loop.timers.schedule(block_max, Instant::now());

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

        if !event_loop.timers.drain_expired(now).is_empty() {
            info!(logger, "canonization timer fired");
            pipeline.on_timer_fire(&mut random_link);
            flush_socket(&mut random_link.socket, &event_loop);
        }

        for (token, readiness) in ready {
            match token.0 {
                TOKEN_RANDOM => {
                    if readiness.is_writable() {
                        let _ = random_link.socket.egress();
                    }
                    if readiness.is_readable() {
                        if !drain_random(&mut random_link, &mut pipeline, &mut data_link) {
                            error!(logger, "random-service link failed, shutting down");
                            event_loop.force_exit.set();
                        }
                        flush_socket(&mut data_link.socket, &event_loop);
                    }
                }
                TOKEN_DATA => {
                    if readiness.is_writable() {
                        let _ = data_link.socket.egress();
                    }
                    if readiness.is_readable() {
                        match drain_data(&mut data_link, &mut pipeline) {
                            DrainResult::LinkDied => {
                                error!(logger, "data-service link failed, shutting down");
                                event_loop.force_exit.set();
                            }
                            DrainResult::Failed => {
                                error!(logger, "canonization pipeline failed, shutting down");
                                event_loop.force_exit.set();
                            }
                            DrainResult::CycleComplete { redrive_immediately } => {
                                let delay = if redrive_immediately { Duration::from_millis(0) } else { block_max };
                                event_loop.timers.schedule(delay, Instant::now());
                                info!(logger, "canonization cycle complete"; "redrive_immediately" => redrive_immediately);
                            }
                            DrainResult::Ok => {}
                        }
                        flush_socket(&mut data_link.socket, &event_loop);
                    }
                }
                _ => {}
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

/// Returns `false` if the random-service link itself died.
fn drain_random(random_link: &mut Link, pipeline: &mut Pipeline, data_link: &mut Link) -> bool {
    loop {
        match random_link.try_recv() {
            Some(Some(payload)) => match pipeline.on_random_response(&payload, data_link) {
                Outcome::Continue => {}
                Outcome::Failed | Outcome::CycleComplete { .. } => return true,
            },
            Some(None) => return true,
            None => return false,
        }
    }
}

enum DrainResult {
    Ok,
    Failed,
    LinkDied,
    CycleComplete { redrive_immediately: bool },
}

fn drain_data(data_link: &mut Link, pipeline: &mut Pipeline) -> DrainResult {
    loop {
        match data_link.try_recv() {
            Some(Some(payload)) => match pipeline.on_dataservice_response(&payload, data_link) {
                Outcome::Continue => continue,
                Outcome::Failed => return DrainResult::Failed,
                Outcome::CycleComplete { redrive_immediately } => {
                    return DrainResult::CycleComplete { redrive_immediately }
                }
            },
            Some(None) => return DrainResult::Ok,
            None => return DrainResult::LinkDied,
        }
    }
}
