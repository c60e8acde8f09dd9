//! # Event Job Provisioner
//!
//! Process entry point. Exits with code 1 when a fatal condition is reported
//! and with 0 after a shutdown signal.

use anyhow::Context;
use event_job_provisioner::config::ConfigLoader;
use event_job_provisioner::logging::init_structured_logging;
use event_job_provisioner::messaging::{AmqpConnector, FastRandSource};
use event_job_provisioner::orchestration::KubernetesClient;
use event_job_provisioner::provisioner::{Collaborators, Provisioner};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Local development convenience; absent .env is fine
    let _ = dotenvy::dotenv();

    let config = ConfigLoader::from_env().context("invalid configuration")?;
    init_structured_logging(config.is_production());

    let kubernetes = Arc::new(
        KubernetesClient::connect(&config.kubernetes, config.is_production())
            .await
            .context("failed to initialize Kubernetes client")?,
    );

    let provisioner = Provisioner::new(
        config.clone(),
        Collaborators {
            connector: Arc::new(AmqpConnector::new(config.broker.clone())),
            orchestrator: kubernetes.clone(),
            config_store: kubernetes,
            random: Arc::new(FastRandSource),
        },
    );

    if let Err(err) = provisioner.start().await {
        error!(error = %err, "Error while trying to initialize kubernetes and broker clients");
        std::process::exit(1);
    }

    tokio::select! {
        fatal = provisioner.wait_for_fatal() => {
            if let Some(fatal) = fatal {
                error!(error = %fatal, "Fatal error, exiting");
            }
            std::process::exit(1);
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            provisioner.stop().await;
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
