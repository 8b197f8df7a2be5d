//! Tideway deployment coordinator binary.
//!
//! Runs one deployment and prints its summary as JSON on stdout. Logs go to
//! stderr.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tideway_control::registry::{timestamped_tag, validate_tag};
use tideway_control::{
    ControlConfig, ControlResult, ControlService, DeploymentRequest, DeploymentSummary,
};

#[derive(Parser)]
#[command(name = "tideway-control")]
#[command(about = "Roll container images out to environments")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to tideway.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy an image tag to an environment
    Deploy {
        /// Target environment
        #[arg(short, long)]
        environment: String,

        /// Image repository name
        #[arg(short, long)]
        repository: String,

        /// Image tag
        #[arg(short, long)]
        tag: String,

        /// Strategy (defaults to the environment's configured strategy)
        #[arg(short, long)]
        strategy: Option<String>,

        /// Local image to push under the tag before deploying
        #[arg(long)]
        local_image: Option<String>,
    },

    /// Print a deterministic image tag for a commit
    Tag {
        /// Commit SHA the image was built from
        #[arg(short, long)]
        commit: String,
    },
}

fn load_config(path: Option<PathBuf>) -> ControlResult<ControlConfig> {
    match path {
        Some(path) => ControlConfig::from_file(path),
        None => ControlConfig::load(),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("tideway_control=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let summary = match cli.command {
        Commands::Deploy {
            environment,
            repository,
            tag,
            strategy,
            local_image,
        } => {
            let request =
                DeploymentRequest::new(environment, repository, tag, strategy.unwrap_or_default());
            match load_config(cli.config) {
                Ok(config) => {
                    info!(project = %config.project, "configuration loaded");
                    let service = ControlService::new(config);
                    match service.run_deploy(request, local_image.as_deref()).await {
                        Ok(report) => report.summary(),
                        Err(e) => DeploymentSummary::never_ran(&e),
                    }
                }
                Err(e) => DeploymentSummary::never_ran(&e),
            }
        }
        Commands::Tag { commit } => {
            let tag = timestamped_tag(chrono::Utc::now(), &commit);
            validate_tag(&tag)?;
            println!("{tag}");
            return Ok(ExitCode::SUCCESS);
        }
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(ExitCode::from(summary.status.exit_code()))
}
