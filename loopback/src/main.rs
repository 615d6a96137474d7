use std::{panic, process::ExitCode, thread};

use bibw_shared::{transport::loopback::LoopbackTransport, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod client;
mod server;
mod spec;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let spec = spec::Spec::parse();

    let (listener, connector) = LoopbackTransport::pair();

    let (served, connected) = thread::scope(|s| {
        let server = s.spawn(move || server::serve(spec, listener));
        let client = s.spawn(move || client::connect(spec, connector));

        (join(server), join(client))
    });

    let mut status = ExitCode::SUCCESS;

    for (role, outcome) in [("listener", served), ("connector", connected)] {
        if let Err(e) = outcome {
            tracing::error!(role, error = %e, "loopback run failed");
            status = ExitCode::FAILURE;
        }
    }

    status
}

fn join(handle: thread::ScopedJoinHandle<'_, Result<()>>) -> Result<()> {
    handle.join().unwrap_or_else(|panic| panic::resume_unwind(panic))
}
