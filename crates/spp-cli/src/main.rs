use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand};
use spp_adapters::{ManualInput, SourceShape};
use spp_core::{Gender, SppError, UserAction};
use spp_sync::{AppConfig, AuthenticatedSession, Authenticator, Pipeline};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "spp-cli")]
#[command(about = "Student performance prediction from bullying, support and wellbeing scores")]
struct Cli {
    /// Account used for commands that write to the store.
    #[arg(long, global = true, env = "SPP_USER")]
    user: Option<String>,
    #[arg(long, global = true, env = "SPP_PASSWORD", hide_env_values = true)]
    password: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create, migrate or reset the store header for the configured schema.
    EnsureSchema,
    /// Score one student and store the result.
    Predict(PredictArgs),
    /// Score and store every row of an upload.
    Import {
        #[arg(long, default_value = "raw-csv")]
        shape: SourceShape,
        file: PathBuf,
    },
    /// Print stored records as JSON.
    History,
    Delete(DeleteArgs),
    /// Record the observed performance for a stored student.
    FillActual {
        #[arg(long)]
        name: String,
        #[arg(long)]
        value: f64,
    },
    Analysis,
    /// Write CSV and Parquet snapshots of the history with a manifest.
    Export,
    Serve,
}

#[derive(Debug, Args)]
struct PredictArgs {
    #[arg(long)]
    name: String,
    #[arg(long, value_parser = parse_gender)]
    gender: Gender,
    #[arg(long)]
    age: u32,
    #[arg(long)]
    grade: u32,
    #[arg(long)]
    bullying: f64,
    #[arg(long)]
    social_support: f64,
    #[arg(long)]
    mental_health: f64,
    #[arg(long)]
    bullying_type: Option<String>,
}

impl From<PredictArgs> for ManualInput {
    fn from(args: PredictArgs) -> Self {
        Self {
            name: args.name,
            gender: Some(args.gender),
            age: args.age,
            grade: args.grade,
            bullying_type: args.bullying_type,
            bullying: args.bullying,
            social_support: args.social_support,
            mental_health: args.mental_health,
            subscores: None,
        }
    }
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("target").required(true).args(["name", "all"])))]
struct DeleteArgs {
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    all: bool,
}

fn parse_gender(value: &str) -> Result<Gender, String> {
    Gender::from_alias(value).ok_or_else(|| format!("unrecognized gender `{value}`"))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("SPP_LOG").unwrap_or_else(|_| EnvFilter::new("spp=info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn login(user: Option<&str>, password: Option<&str>, config: &AppConfig) -> Result<AuthenticatedSession> {
    let user = user.context("--user (or SPP_USER) is required for this command")?;
    let password = password.context("--password (or SPP_PASSWORD) is required for this command")?;
    Authenticator::from_yaml_file(&config.auth_file)?
        .login(user, password)
        .context("invalid username or password")
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = AppConfig::from_env()?;
    run_with(cli, &config).await
}

async fn run_with(cli: Cli, config: &AppConfig) -> Result<()> {
    let Cli {
        user,
        password,
        command,
    } = cli;
    if matches!(command, Commands::Serve) {
        return spp_web::serve(config).await;
    }

    let pipeline = Pipeline::from_config(config).await?;
    match command {
        Commands::History => print_json(&pipeline.history().await?)?,
        Commands::Analysis => print_json(&pipeline.analysis().await?)?,
        Commands::Export => {
            let export = pipeline.export_history().await?;
            println!("export complete: manifest={}", export.manifest_path.display());
        }
        Commands::Serve => {}
        // Every write, schema resets included, needs a session.
        command => {
            let session = login(user.as_deref(), password.as_deref(), config)?;
            let status = pipeline.ensure_schema().await?;
            if matches!(command, Commands::EnsureSchema) {
                print_json(&status)?;
            } else {
                write(&pipeline, &session, command).await?;
            }
        }
    }
    Ok(())
}

async fn write(pipeline: &Pipeline, session: &AuthenticatedSession, command: Commands) -> Result<()> {
    match command {
        Commands::Predict(args) => {
            let prediction = pipeline.predict_manual(session, args.into()).await?;
            if !prediction.stored {
                info!(name = prediction.record.name(), "already stored; nothing written");
            }
            print_json(&prediction)?;
        }
        Commands::Import { shape, file } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let outcome = pipeline.import_batch(session, shape, &bytes).await?;
            println!(
                "import complete: added={} skipped={}",
                outcome.added.len(),
                outcome.skipped.len()
            );
        }
        Commands::Delete(DeleteArgs { name, all }) => {
            let deleted = match name {
                Some(name) if !all => pipeline.delete_by_name(session, &name).await?,
                _ => pipeline.delete_all(session).await?,
            };
            println!("deleted {deleted} record(s)");
        }
        Commands::FillActual { name, value } => {
            if pipeline.set_actual_performance(session, &name, value).await? {
                println!("recorded actual performance for {name}");
            } else {
                println!("no record for {name} is waiting for an actual performance");
            }
        }
        _ => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => match err.downcast_ref::<SppError>() {
            Some(spp) => {
                eprintln!("{}", spp.user_message());
                match spp.action() {
                    UserAction::FixInput => ExitCode::from(2),
                    UserAction::TryAgainLater => ExitCode::from(3),
                }
            }
            None => {
                eprintln!("error: {err:#}");
                ExitCode::FAILURE
            }
        },
    }
}
