// cfdebug agent - CFML step-debugging instrumentation
//
// Bootstrap checks, helper injection planning and offline instrumentation of
// compiled CFML pages

use anyhow::{bail, Context, Result};
use cfdebug_instrumenter::{InstrumentConfig, LoadHook};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

mod args;
mod bootstrap;
mod injection;
mod inspect;
mod offline;

#[cfg(test)]
mod fixtures;

use args::AgentArgs;
use bootstrap::Bootstrap;
use injection::DEFAULT_HELPER_PREFIX;

/// Instrument compiled CFML classes for step debugging
#[derive(Parser)]
#[command(name = "cfdebug-agent")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate an agent argument string and print the resolved setup
    Check {
        /// e.g. jdwphost=localhost,jdwpport=9999,debughost=0.0.0.0,debugport=10000,jarpath=/abs/agent.jar
        #[arg(long, value_name = "ARGS")]
        args: String,

        /// Instrumentation config (JSON)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Jar path prefix of helper classes
        #[arg(long, default_value = DEFAULT_HELPER_PREFIX)]
        prefix: String,
    },

    /// List helper classes in injection order
    Helpers {
        #[arg(long, value_name = "JAR")]
        jar: PathBuf,

        #[arg(long, default_value = DEFAULT_HELPER_PREFIX)]
        prefix: String,
    },

    /// Instrument every class in a directory or jar
    Instrument {
        #[arg(long, value_name = "DIR|JAR")]
        input: PathBuf,

        #[arg(long, value_name = "DIR")]
        output: PathBuf,

        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Show how the methods of a class file are classified
    Inspect {
        #[arg(value_name = "CLASS_FILE")]
        path: PathBuf,

        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&Path>) -> Result<InstrumentConfig> {
    match path {
        Some(path) => InstrumentConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(InstrumentConfig::default()),
    }
}

// stdout carries command output only
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Tracing to stderr only
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cfdebug_agent=info".parse()?)
                .add_directive("cfdebug_instrumenter=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { args, config, prefix } => {
            let args = AgentArgs::parse(&args)?;
            let config = load_config(config.as_deref())?;
            let bootstrap = Bootstrap::prepare(args, config, &prefix).map_err(|e| {
                error!("Agent setup failed: {}", e);
                e
            })?;
            print_json(&bootstrap.summary())?;
        }

        Commands::Helpers { jar, prefix } => {
            let helpers = injection::injection_order(injection::read_helpers(&jar, &prefix)?)?;
            for helper in &helpers {
                println!("{}", helper.name);
            }
        }

        Commands::Instrument { input, output, config } => {
            let hook = Arc::new(LoadHook::new(load_config(config.as_deref())?)?);
            let report = offline::instrument(&input, &output, hook).await?;
            print_json(&report)?;
            if report.failed > 0 {
                bail!("{} of {} classes failed to instrument", report.failed, report.total);
            }
        }

        Commands::Inspect { path, config } => {
            let config = load_config(config.as_deref())?;
            print_json(&inspect::inspect(&path, &config)?)?;
        }
    }

    info!("Done");
    Ok(())
}
