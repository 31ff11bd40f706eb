// # MeshGate node
//
// Main entry point for one cluster node. The environment selects which
// service this process hosts; everything else is wiring.

use meshgate::bootstrap::{Program, ServiceRegistry};
use meshgate::{Environ, VERSION};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    info!("meshgate {VERSION} starting");

    let env = match Environ::from_env() {
        Ok(env) => Arc::new(env),
        Err(err) => {
            error!("load environment: {err}");
            return ExitCode::from(1);
        }
    };

    let registry = ServiceRegistry::with_defaults();
    let program = match Program::start(&registry, env).await {
        Ok(program) => program,
        Err(err) => {
            error!("init service: {err}");
            return ExitCode::from(1);
        }
    };

    program.wait_for_signal().await;
    program.shutdown().await;
    ExitCode::SUCCESS
}
