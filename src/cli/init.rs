//! taskvault init command implementation
//!
//! Creates the storage layout and a default config in a project directory.

use std::path::{Path, PathBuf};

use crate::cli::CommandContext;
use crate::config::{Config, CONFIG_FILE};
use crate::error::{Error, Result};
use crate::output::{emit_success, HumanOutput};
use crate::persistence::TaskPersistenceEngine;

#[derive(serde::Serialize)]
struct InitReport {
    project: PathBuf,
    state_dir: PathBuf,
    created: InitCreated,
}

#[derive(serde::Serialize)]
struct InitCreated {
    config: bool,
    state_dir: bool,
}

pub fn run(cmd: &CommandContext) -> Result<()> {
    let storage = cmd.ctx.storage.clone();
    let project = storage.project_root().to_path_buf();

    let created_state_dir = !storage.is_initialized();
    TaskPersistenceEngine::new(cmd.ctx.clone()).init()?;
    let created_config = ensure_config(&project)?;

    let report = InitReport {
        project: project.clone(),
        state_dir: storage.root().to_path_buf(),
        created: InitCreated {
            config: created_config,
            state_dir: created_state_dir,
        },
    };

    let mut created_items = Vec::new();
    if created_config {
        created_items.push(CONFIG_FILE.to_string());
    }
    if created_state_dir {
        created_items.push(format!("{}/", storage.root().display()));
    }

    let header = if created_items.is_empty() {
        "taskvault init: nothing to do".to_string()
    } else {
        "taskvault init: initialized project".to_string()
    };

    let mut human = HumanOutput::new(header);
    human.push_summary("project", project.display().to_string());
    human.push_summary(
        "created",
        if created_items.is_empty() {
            "none".to_string()
        } else {
            created_items.join(", ")
        },
    );
    human.push_next_step("taskvault status");

    emit_success(cmd.output, "init", &report, Some(&human))
}

fn ensure_config(project_root: &Path) -> Result<bool> {
    let config_path = project_root.join(CONFIG_FILE);
    if config_path.exists() {
        if !config_path.is_file() {
            return Err(Error::OperationFailed(format!(
                "{CONFIG_FILE} exists but is not a file: {}",
                config_path.display()
            )));
        }
        return Ok(false);
    }

    Config::default().save(&config_path)?;
    Ok(true)
}
