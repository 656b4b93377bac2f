use clap::{Parser, Subcommand};
use cloud::{AwsCli, SystemRunner};
use reconciler::{EnvironmentContext, ReconcilerConfig, ReconciliationOutcome, Reconciler};
use std::path::{Path, PathBuf};
use terraform::TerraformCli;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "reconcile")]
#[command(about = "Reconciles Terraform state, imports and teardown for a neo4j-demos environment")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, env = "RECONCILE_CONFIG")]
    config: Option<PathBuf>,
    /// Environment to reconcile
    #[arg(
        short,
        long,
        global = true,
        env = "RECONCILE_ENVIRONMENT",
        default_value = "dev"
    )]
    environment: String,
    /// AWS region (overrides config and RECONCILE_REGION)
    #[arg(long, global = true)]
    region: Option<String>,
    /// Resource naming prefix (overrides config and RECONCILE_PREFIX)
    #[arg(long, global = true)]
    prefix: Option<String>,
    /// Explicit state bucket name
    #[arg(long, global = true)]
    state_bucket: Option<String>,
    /// Explicit lock table name
    #[arg(long, global = true)]
    lock_table: Option<String>,
    /// Write the run outcome here instead of stdout
    #[arg(long, global = true)]
    outcome_file: Option<PathBuf>,
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the state backend for the environment
    Locate {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Remove a leftover state backend and create a fresh one
    Bootstrap,
    /// Init, plan, import leftovers, apply and publish outputs
    Apply {
        /// Recreate the state backend first
        #[arg(long)]
        bootstrap: bool,
    },
    /// Tear down workloads and network leftovers, then destroy
    Destroy {
        /// Also delete the state bucket and lock table
        #[arg(long)]
        include_backend: bool,
    },
    /// Show the values published for the environment
    Params,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli)?;
    let context = EnvironmentContext::new(&cli.environment, &config.aws.region, &config.prefix)?;
    info!(
        "Reconciling {} in {} (prefix {})",
        context.environment(),
        context.region(),
        context.prefix()
    );

    let cloud = AwsCli::with_system_runner(config.aws.clone())?;
    let bootstrap = TerraformCli::new(SystemRunner::new(), &config.terraform.bootstrap_dir)
        .with_binary(&config.terraform.binary);
    let infrastructure =
        TerraformCli::new(SystemRunner::new(), &config.terraform.infrastructure_dir)
            .with_binary(&config.terraform.binary);

    let reconciler = Reconciler::new(context, config, cloud, bootstrap, infrastructure)?;

    let outcome = match cli.command {
        Commands::Locate { json } => {
            let backend = reconciler.locate().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&backend)?);
            } else {
                println!("bucket:     {}", backend.bucket);
                println!("lock_table: {}", backend.lock_table);
                println!("region:     {}", backend.region);
                println!("key:        {}", backend.key);
            }
            return Ok(());
        }
        Commands::Params => {
            let values = reconciler.published_values().await;
            println!("{}", serde_json::to_string_pretty(&values)?);
            return Ok(());
        }
        Commands::Bootstrap => reconciler.bootstrap().await,
        Commands::Apply { bootstrap } => reconciler.apply(bootstrap).await,
        Commands::Destroy { include_backend } => reconciler.destroy(include_backend).await,
    };

    emit_outcome(&outcome, cli.outcome_file.as_deref())?;

    if outcome.is_fatal() {
        error!("Run {} failed", outcome.run_id);
        std::process::exit(1);
    }
    Ok(())
}

/// File, then environment, then flags.
fn load_config(cli: &Cli) -> Result<ReconcilerConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => ReconcilerConfig::from_file(path)?,
        None => ReconcilerConfig::default(),
    };
    config.apply_env_overrides();

    if let Some(region) = &cli.region {
        config = config.with_region(region);
    }
    if let Some(prefix) = &cli.prefix {
        config = config.with_prefix(prefix);
    }
    if let Some(bucket) = &cli.state_bucket {
        config = config.with_state_bucket(bucket);
    }
    if let Some(table) = &cli.lock_table {
        config = config.with_lock_table(table);
    }

    config.validate()?;
    Ok(config)
}

fn emit_outcome(
    outcome: &ReconciliationOutcome,
    path: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let json = outcome.to_json()?;
    match path {
        Some(path) => {
            std::fs::write(path, json)?;
            info!("Outcome written to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}
