use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;
use nix::sys::signal::{signal, SigHandler, SigSet, Signal};

use khttpd::access_log::AccessLog;
use khttpd::config::Config;
use khttpd::pool::Pool;

const COPYRIGHT: &str = "copyright (c) 2021 Tom Dryer";

fn main() -> Result<()> {
    println!(
        "{}/{}, {}.",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        COPYRIGHT,
    );

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args();
    let argv0 = args.next().unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());
    let args: Vec<String> = args.collect();
    if args.is_empty() || args.iter().any(|arg| arg == "--help") {
        Config::new("/").usage(&argv0);
        std::process::exit(0);
    }

    let config = Config::from_args(args)?;
    let listener = config.create_listener()?;
    println!(
        "listening on: http://{}/",
        listener
            .local_addr()
            .context("failed to get listening address")?
    );
    let access_log = AccessLog::open(&config.log_target)?;

    // Workers inherit the signal mask; only the main thread waits for these.
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;
    let mut shutdown_signals = SigSet::empty();
    shutdown_signals.add(Signal::SIGINT);
    shutdown_signals.add(Signal::SIGTERM);
    shutdown_signals
        .thread_block()
        .context("failed to block shutdown signals")?;

    let pool = Pool::start(Arc::new(config), listener, access_log)?;

    let signal = shutdown_signals
        .wait()
        .context("failed to wait for shutdown signal")?;
    info!("caught {:?}, stopping", signal);

    let stats = pool.stop()?;
    println!("{}", stats);
    Ok(())
}
