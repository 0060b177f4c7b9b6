use feed_sieve_lib::{
    cli::parse_args,
    config::Config,
    feed::{Feed, MemoryFeed},
    index::{ConsumerError, Entry, IndexBuilder},
    logging::{format_error_report, init_logging},
    server::{register_metrics, setup_server_with_addr},
    state::AppState,
    store::SqliteStore,
};
use std::sync::Arc;

use dotenv::dotenv;
use log::debug;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const ORIGIN_BLOCKS: [&str; 5] = ["hello", "hi", "hej", "hallo", "heysan"];

/// Cancels the shutdown token on the first SIGTERM or SIGINT.
async fn handle_shutdown_signals(state: Arc<AppState>) {
    let (mut sigterm, mut sigint) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(err), _) | (_, Err(err)) => {
                error!(event = "signal_handler_failed", error = %err, "cannot watch shutdown signals");
                return;
            }
        };

    tokio::select! {
        _ = sigterm.recv() => {
            info!(event = "shutdown_signal", signal = "SIGTERM", "SIGTERM received, shutting down");
        }
        _ = sigint.recv() => {
            info!(event = "shutdown_signal", signal = "SIGINT", "SIGINT received, shutting down");
        }
    }

    state.shutdown_token.cancel();
}

async fn print_entry(entry: Entry) -> Result<(), ConsumerError> {
    println!("B {}", String::from_utf8_lossy(&entry.data));
    Ok(())
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    init_logging("feed_sieve", "info");
    let args = parse_args();

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(event = "config_invalid", report = %format_error_report(&err), "config incorrectly specified");
            std::process::exit(2);
        }
    };
    args.apply(&mut config);
    debug!("Config loaded");

    let state = Arc::new(AppState::new(CancellationToken::new()));
    register_metrics(&state).await;
    let server_handle = match config.metrics_addr {
        Some(addr) => match setup_server_with_addr(state.clone(), addr).await {
            Ok(handle) => {
                info!(event = "metrics_server_started", %addr, "serving /health and /metrics");
                Some(handle)
            }
            Err(err) => {
                error!(event = "metrics_server_bind_failed", %addr, error = %err, "could not bind metrics server");
                std::process::exit(1);
            }
        },
        None => None,
    };
    tokio::spawn(handle_shutdown_signals(state.clone()));

    let store = match SqliteStore::open(&config.db_path) {
        Ok(store) => store,
        Err(err) => {
            error!(event = "store_open_failed", db_path = %config.db_path, report = %format_error_report(&err), "could not open sieve store");
            std::process::exit(1);
        }
    };

    let origin = MemoryFeed::new();
    if let Err(err) = origin.append_batch(ORIGIN_BLOCKS) {
        error!(event = "origin_append_failed", error = %err, "could not build origin feed");
        std::process::exit(1);
    }
    // The replica knows the origin's length before indexing starts, as after a handshake.
    let replica = MemoryFeed::replica();
    if let Err(err) = replica.grow(origin.len()) {
        error!(event = "replica_grow_failed", error = %err, "could not size replica");
        std::process::exit(1);
    }

    let handle = match IndexBuilder::new()
        .store(store)
        .feed(replica.clone())
        .consumer(print_entry)
        .key_prefix(config.key_prefix.clone())
        .chunk_bits(config.chunk_bits)
        .start()
    {
        Ok(handle) => handle,
        Err(err) => {
            error!(event = "index_start_failed", report = %format_error_report(&err), "could not start index");
            std::process::exit(2);
        }
    };
    info!(
        event = "index_started",
        db_path = %config.db_path,
        blocks = ?args.fetch,
        "indexing sparse replica"
    );

    for index in args.fetch.iter().copied() {
        if index >= ORIGIN_BLOCKS.len() as u64 {
            warn!(event = "fetch_skipped", block = index, "origin has no such block");
            continue;
        }
        if let Err(err) = replica.fetch_from(&origin, index).await {
            warn!(event = "fetch_failed", block = index, error = %err, "could not fetch block from origin");
        }
    }

    if !args.exit_when_done {
        state.shutdown_token.cancelled().await;
    }
    replica.close();

    let outcome = handle.wait().await;
    state.shutdown_token.cancel();
    if let Some(server_handle) = server_handle {
        let _ = server_handle.await;
    }

    match outcome {
        Ok(()) => info!(event = "index_finished", "index drained and stopped"),
        Err(err) => {
            error!(event = "index_failed", report = %format_error_report(&err), "index stopped with an error");
            std::process::exit(1);
        }
    }
}
