// src/main.rs
//
// CLI entrypoint. Config precedence: built-in defaults, then ARBOT_*
// environment overrides, then explicit CLI flags.

use std::time::Duration;

use clap::{Parser, ValueEnum};

use arbot::config::Config;
use arbot::engine::run_until_shutdown;
use arbot::types::ExecutionMode;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ModeArg {
    Backtest,
    Paper,
    Live,
}

#[derive(Debug, Parser)]
#[command(
    name = "arbot",
    about = "Cross-exchange arbitrage engine (paper / live)",
    version
)]
struct Args {
    /// Execution mode; overrides ARBOT_EXECUTION_MODE.
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// Metrics listen address; overrides ARBOT_METRICS_ADDR.
    #[arg(long)]
    metrics_addr: Option<String>,

    /// Run directory for records and audit files.
    #[arg(long)]
    run_dir: Option<String>,

    /// Stop after this many seconds (0 = run until signalled).
    #[arg(long, default_value_t = 0)]
    max_runtime_s: u64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut cfg = Config::from_env();
    if let Some(mode) = args.mode {
        cfg.system.execution_mode = match mode {
            ModeArg::Backtest => ExecutionMode::Backtest,
            ModeArg::Paper => ExecutionMode::Paper,
            ModeArg::Live => ExecutionMode::Live,
        };
    }
    if let Some(addr) = args.metrics_addr {
        cfg.metrics_addr = addr;
    }
    if let Some(run_dir) = args.run_dir {
        cfg.run_dir = run_dir;
    }

    let max_runtime = (args.max_runtime_s > 0).then(|| Duration::from_secs(args.max_runtime_s));
    if let Err(err) = run_until_shutdown(cfg, max_runtime).await {
        eprintln!("ERROR: {err}");
        std::process::exit(1);
    }
}
