//! parrun: run up to four commands side by side with colored, labelled output.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, merges the optional config file, validates the batch, and hands
//! it to the supervisor until it completes or a termination signal arrives.

mod ansi;
mod config;
mod errors;
mod logging;
mod output;
mod process;
mod runner;
mod signals;
mod supervisor;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{CommandFactory, Parser};
use tracing::info;

use crate::config::{Overrides, Settings};
use crate::logging::LogLevel;
use crate::output::OutputMultiplexer;
use crate::process::{BatchPlan, Separator};
use crate::supervisor::{run_until_shutdown, Supervisor};

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "parrun",
    version,
    about = "Run up to 4 commands concurrently with colored, prefixed output",
    styles = help_styles(),
    after_help = after_help(),
)]
struct Cli {
    /// Field separator for spec strings.
    #[arg(short = 's', long, visible_alias = "delimiter", value_name = "SEP")]
    separator: Option<String>,
    /// Command run to completion before the batch: "<command>" or a full spec.
    #[arg(long, visible_alias = "startup", value_name = "SPEC")]
    pre: Option<String>,
    /// Path to a parrun.toml configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Ignore any parrun.toml in the current directory.
    #[arg(long)]
    no_config: bool,
    /// Print prefixes without background colors.
    #[arg(long)]
    no_color: bool,
    /// Time to wait for commands after a shutdown request (ms).
    #[arg(long, value_name = "MS")]
    shutdown_grace_ms: Option<u64>,
    /// Diagnostic log level (also PARRUN_LOG).
    #[arg(long, value_enum)]
    log_level: Option<LogLevel>,
    /// Commands as "<background-color><sep><prefix><sep><command>".
    #[arg(value_name = "SPEC")]
    commands: Vec<String>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            separator: self.separator.clone(),
            pre: self.pre.clone(),
            no_color: self.no_color,
            shutdown_grace_ms: self.shutdown_grace_ms,
            commands: self.commands.clone(),
        }
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.log_level)?;

    let config = config::resolve_config(cli.config.as_deref(), cli.no_config)?;
    let settings = Settings::merge(cli.overrides(), config)?;
    if settings.commands.is_empty() && settings.pre.is_none() {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    }

    // nothing is spawned unless the whole batch validates
    let plan = BatchPlan::parse(&settings.commands, settings.pre.as_deref(), settings.separator)?;
    for warning in &plan.warnings {
        info!(%warning, "skipping pre-hook");
        eprintln!("WARNING {}", warning);
    }

    let output = Arc::new(OutputMultiplexer::stdout(settings.color));
    let supervisor = Supervisor::from_plan(plan, output);
    let summary =
        run_until_shutdown(&supervisor, signals::shutdown_signal(), settings.shutdown_grace).await;

    info!(
        commands = summary.reports.len(),
        failures = summary.failures(),
        interrupted = ?summary.interrupted.map(|signal| signal.label()),
        "batch finished"
    );
    for report in summary.failed() {
        info!(prefix = %report.prefix, result = ?report.result, "command did not succeed");
    }
    Ok(())
}

fn after_help() -> String {
    format!(
        "Allowed separators: {}\nAllowed background colors: {}",
        Separator::allowed(),
        ansi::palette()
    )
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
}
