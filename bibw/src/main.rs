use std::{process::ExitCode, time::Duration};

use bibw_shared::{
    sweep::report_for, transport::tcp::TcpTransport, BenchConfig, Result, RoleOrchestrator,
    Transport,
};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::command_line::{GlobalArgs, TransportKind};

mod command_line;

const RETRY_INTERVAL: Duration = Duration::from_millis(100);

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = GlobalArgs::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "benchmark failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: GlobalArgs) -> Result<()> {
    let config = args.bench_config();

    tracing::info!(
        role = ?config.role,
        memory = %config.memory_kind(),
        transport = ?args.transport,
        iterations = config.iterations,
        window_depth = config.window_depth,
        max_msg_log = config.max_msg_log,
        "starting"
    );

    match args.transport {
        TransportKind::Tcp => {
            let transport =
                TcpTransport::new().connect_retries(args.connect_retries, RETRY_INTERVAL);
            drive(config, transport)
        }
        TransportKind::Verbs => verbs(config, &args),
    }
}

fn drive<T: Transport>(config: BenchConfig, transport: T) -> Result<()> {
    let mut sink = report_for(&config.role);
    RoleOrchestrator::new(config, transport).run(sink.as_mut())
}

#[cfg(feature = "verbs")]
fn verbs(config: BenchConfig, args: &GlobalArgs) -> Result<()> {
    use bibw_shared::transport::verbs::{config::VerbsConfig, VerbsTransport};

    let verbs_config = VerbsConfig {
        dev_name: args.dev.clone(),
        gid_index: args.gid_index,
        ..Default::default()
    }
    .covering_window(config.window_depth);

    drive(config, VerbsTransport::open(verbs_config)?)
}

#[cfg(not(feature = "verbs"))]
fn verbs(_config: BenchConfig, _args: &GlobalArgs) -> Result<()> {
    Err(bibw_shared::BenchError::InvalidArgument(
        "the verbs transport needs a build with the `verbs` feature".to_owned(),
    ))
}
