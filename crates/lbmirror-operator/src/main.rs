//! lbmirror - mirror LoadBalancer Services from one cluster into another

use clap::Parser;
use kube::CustomResourceExt;

use lbmirror_common::crd::MirroredService;
use lbmirror_common::telemetry::{init_telemetry, TelemetryConfig};
use lbmirror_operator::config::{resolve, Cli, Command, OsEnvConfig};
use lbmirror_operator::controller_runner::{run_inner, run_outer, shutdown_signal};
use lbmirror_operator::publish::publish_config;
use lbmirror_operator::queue::QueueConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&MirroredService::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        format: cli.log_format,
    })?;

    let env = OsEnvConfig;

    match cli.command {
        Some(Command::Inner(args)) => {
            let source = resolve(&args.source, &env).await?;
            let destination = resolve(&args.destination, &env).await?;
            let config = QueueConfig {
                concurrency: args.concurrency,
                ..Default::default()
            };
            run_inner(
                source,
                destination,
                args.cluster_name(),
                config,
                shutdown_signal(),
            )
            .await;
        }
        Some(Command::Outer(args)) => {
            let destination = resolve(&args.cluster, &env).await?;
            let config = QueueConfig {
                concurrency: args.concurrency,
                ..Default::default()
            };
            run_outer(destination, config, shutdown_signal()).await;
        }
        Some(Command::PublishConfig(args)) => {
            let destination = resolve(&args.destination, &env).await?;
            publish_config(&destination.client, &destination.namespace, &args.config_path)
                .await?;
        }
        None => anyhow::bail!("no command given; see --help"),
    }

    Ok(())
}
