//! RAX FTP runtime - Entry Point
//!
//! Serves the control port on the single-threaded event loop until SIGINT or
//! SIGTERM, then tears the server and the runtime down.

use log::{error, info};
use std::env;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};

use rax_ftp_runtime::error::RuntimeError;
use rax_ftp_runtime::error::handlers::handle_error;
use rax_ftp_runtime::{Runtime, RuntimeConfig, Server};

/// Set by the SIGINT/SIGTERM handler, checked once per tick.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn main() {
    // Initialize the logger (env_logger picks up RUST_LOG environment variable)
    env_logger::init();

    // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGTERM, signal_handler as *const () as libc::sighandler_t);
        libc::signal(libc::SIGINT, signal_handler as *const () as libc::sighandler_t);
    }

    info!("Launching control-port server...");

    if let Err(e) = serve(env::args().nth(1)) {
        handle_error(&e);
        error!("Startup failed");
        process::exit(1);
    }
}

/// Runs the server; `config_path` overrides the default config file lookup.
fn serve(config_path: Option<String>) -> Result<(), RuntimeError> {
    let config = match config_path {
        Some(path) => RuntimeConfig::load_from(&path)?,
        None => RuntimeConfig::load()?,
    };
    let runtime = Runtime::new(config.poll_batch_size);
    let server = Server::bind(&runtime, &config)?;
    info!(
        "Listening on {} ({} ms tick)",
        server.local_addr(),
        config.tick_delay_ms
    );

    runtime.run(config.tick_delay(), |_| !SHUTDOWN.load(Ordering::Relaxed));

    info!("Shutdown requested, closing {} sessions", server.session_count());
    server.shutdown();
    runtime.shutdown();
    Ok(())
}
