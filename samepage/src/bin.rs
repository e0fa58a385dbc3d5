use clap::Parser;
use samepage_base::{err, Result};
use samepage_engine::{Engine, EngineOptions};
use samepage_net::{Connection, TcpVerbs};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Remote same-page-merging scan engine.
#[derive(Parser, Debug)]
#[command(name = "samepage", version)]
struct Args {
    /// Verbose per-item decision logging.
    #[arg(long)]
    debug: bool,

    /// Disable volatility-aware skipping of churning items.
    #[arg(long)]
    no_skip_opt: bool,

    /// Disable the background pre-hash worker.
    #[arg(long)]
    no_pre_hash_opt: bool,

    /// Legacy compare-and-merge without volatility scoring; also turns
    /// skipping and pre-hashing off.
    #[arg(long)]
    legacy_merge: bool,

    /// Single-operation fallback mode (baseline comparison only; not built
    /// into this binary).
    #[arg(long)]
    dataplane: bool,

    /// Address to listen on for the host connection.
    #[arg(long, default_value = "0.0.0.0:10103")]
    listen: String,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let default_filter = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    if args.dataplane {
        return Err(err(
            "single-operation fallback mode is not built into this binary",
        ));
    }
    let opts = EngineOptions {
        skip_opt: !args.no_skip_opt,
        pre_hash_opt: !args.no_pre_hash_opt,
        legacy_merge: args.legacy_merge,
        ..EngineOptions::default()
    };
    info!(
        "engine config: skip_opt={} pre_hash_opt={} legacy_merge={}",
        opts.skip_opt, opts.pre_hash_opt, opts.legacy_merge
    );

    let listener = std::net::TcpListener::bind(&args.listen)?;
    info!("listening on {}", listener.local_addr()?);
    // One host at a time; a disconnect ends the process cleanly and the
    // surrounding runtime restarts it.
    let verbs = TcpVerbs::accept(&listener)?;
    let mut conn = Connection::new(Box::new(verbs));
    let mut engine = Engine::new(opts)?;
    engine.serve(&mut conn)?;
    info!("clean shutdown after {} cycles", engine.cycles_served());
    Ok(())
}
