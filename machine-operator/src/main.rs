use anyhow::Result;
use clap::{Parser, Subcommand};

mod nodes;
mod pools;
mod util;

#[derive(Parser, Debug)]
#[command(name = "nodeforge-operator")]
#[command(about = "Drives node host configuration to rendered revisions, pool by pool")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the MachinePool controller
    Run,

    /// Print the CustomResourceDefinition manifests to stdout
    Crd,
}

#[tokio::main]
async fn main() -> Result<()> {
    nodeforge_common::init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Crd => print_crds(),
        Commands::Run => {
            #[cfg(feature = "metrics")]
            util::metrics::maybe_spawn_metrics_server();

            let client = kube::Client::try_default().await?;
            pools::reconcile::run(client).await?;
            Ok(())
        }
    }
}

fn print_crds() -> Result<()> {
    use kube::CustomResourceExt;
    use nodeforge_types::{HostConfig, MachinePool, RenderedHostConfig};

    let docs = [
        serde_yaml::to_string(&MachinePool::crd())?,
        serde_yaml::to_string(&HostConfig::crd())?,
        serde_yaml::to_string(&RenderedHostConfig::crd())?,
    ];
    print!("{}", docs.join("---\n"));
    Ok(())
}
