//! Command-line interface for taskvault
//!
//! This module defines the CLI structure using clap derive macros.
//! Each subcommand is implemented in its own submodule.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::context::EngineContext;
use crate::error::Result;
use crate::events::{EventBus, EventDestination};
use crate::output::OutputOptions;

mod checkpoint;
mod init;
mod plan;
mod recover;
mod status;

/// taskvault - durable task state for AI orchestration sessions
///
/// Inspects and repairs the task store, takes and restores checkpoints, and
/// plans execution order from task dependencies.
#[derive(Parser, Debug)]
#[command(name = "taskvault")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Project directory holding `.gemini-tasks/` (defaults to current directory)
    #[arg(long, global = true, env = "TASKVAULT_PROJECT")]
    pub project: Option<PathBuf>,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Write lifecycle events as JSON lines to a file, or `-` for stdout
    #[arg(long, global = true, value_name = "PATH")]
    pub events: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the storage layout and a default `.taskvault.toml`
    Init,

    /// Summarize sessions, tasks, checkpoints and store health
    Status,

    /// Take a manual checkpoint, or list existing ones
    Checkpoint {
        /// List checkpoints instead of creating one
        #[arg(long)]
        list: bool,
    },

    /// Restore task state from a checkpoint
    Restore {
        /// Checkpoint ID
        id: String,
    },

    /// Recover the store, or a single task
    Recover {
        /// Recover only this task
        #[arg(long, conflicts_with = "strategy")]
        task: Option<String>,

        /// Force a strategy: hot, warm, cold, emergency
        #[arg(long)]
        strategy: Option<String>,
    },

    /// List the unfinished tasks of a previous session
    Resume {
        /// Session ID
        session: String,
    },

    /// Compute execution order, parallel groups and critical path
    Plan,

    /// List tasks whose dependencies are all completed
    Ready,
}

/// What every command needs: where the project is and how to report.
pub(crate) struct CommandContext {
    pub ctx: EngineContext,
    pub events: EventBus,
    pub output: OutputOptions,
}

impl Cli {
    fn command_context(&self) -> Result<CommandContext> {
        let root = match &self.project {
            Some(path) => path.clone(),
            None => std::env::current_dir()?,
        };
        let events = EventBus::new();
        if let Some(destination) = EventDestination::parse(self.events.as_deref()) {
            events.attach_sink(destination.open()?);
        }
        // Events on stdout would interleave with the JSON envelope.
        let events_to_stdout = matches!(
            EventDestination::parse(self.events.as_deref()),
            Some(EventDestination::Stdout)
        );
        Ok(CommandContext {
            ctx: EngineContext::for_project(&root),
            events,
            output: OutputOptions {
                json: self.json && !events_to_stdout,
                quiet: self.quiet,
            },
        })
    }

    /// Execute the CLI command
    pub fn run(self) -> Result<()> {
        let cmd = self.command_context()?;
        match self.command {
            Commands::Init => init::run(&cmd),
            Commands::Status => status::run(&cmd),
            Commands::Checkpoint { list } => {
                if list {
                    checkpoint::run_list(&cmd)
                } else {
                    checkpoint::run_create(&cmd)
                }
            }
            Commands::Restore { id } => checkpoint::run_restore(&cmd, &id),
            Commands::Recover { task, strategy } => match task {
                Some(task) => recover::run_task(&cmd, &task),
                None => recover::run_system(&cmd, strategy.as_deref()),
            },
            Commands::Resume { session } => recover::run_resume(&cmd, &session),
            Commands::Plan => plan::run_plan(&cmd),
            Commands::Ready => plan::run_ready(&cmd),
        }
    }
}
