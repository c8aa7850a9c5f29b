use std::process::ExitCode;

use camrelay::{Orchestrator, OrchestratorConfig};
use clap::Parser;

#[derive(Parser)]
#[command(
    name = "camrelay-server",
    about = "Multi-camera RTSP ingest relay: terminates camera ANNOUNCE/RECORD \
             sessions and fans reassembled H.264 out to monitor clients"
)]
struct Args {
    /// IP to bind the RTSP ingest listener (and the Monitor Server, unless
    /// --monitor-ip overrides it).
    #[arg(long, default_value = "0.0.0.0")]
    bind_ip: String,

    /// RTSP ingest listener port.
    #[arg(long, default_value_t = 8554)]
    rtsp_port: u16,

    /// Worker reactor count; each accepted ingest connection is pinned to
    /// one worker for its lifetime.
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Overrides --bind-ip for the Monitor Server's control listener.
    #[arg(long)]
    monitor_ip: Option<String>,

    /// Monitor Server control listener port.
    #[arg(long, default_value_t = 9000)]
    monitor_port: u16,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = OrchestratorConfig {
        bind_ip: args.bind_ip,
        rtsp_port: args.rtsp_port,
        workers: args.workers,
        monitor_ip: args.monitor_ip,
        monitor_port: args.monitor_port,
    };

    let orchestrator = match Orchestrator::start(config) {
        Ok(orchestrator) => orchestrator,
        Err(err) => {
            eprintln!("failed to start relay: {err}");
            return ExitCode::FAILURE;
        }
    };

    let stop_handle = orchestrator.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        tracing::info!("signal received, shutting down");
        stop_handle.stop();
    }) {
        eprintln!("failed to install signal handler: {err}");
        return ExitCode::FAILURE;
    }

    if let Err(err) = orchestrator.run() {
        eprintln!("relay exited with error: {err}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
