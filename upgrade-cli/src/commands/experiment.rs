//! Experiment lifecycle commands.

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use comfy_table::Cell;
use upgrade_core::{Actor, ExperimentId, ExperimentSpec, ExperimentState};
use uuid::Uuid;

use super::{print_json, read_json, services, table};

#[derive(Args, Debug)]
pub struct ExperimentArgs {
    #[command(subcommand)]
    pub command: ExperimentCommands,

    /// Name recorded as the author of writes
    #[arg(long, global = true, default_value = "cli")]
    pub actor: String,
}

#[derive(Subcommand, Debug)]
pub enum ExperimentCommands {
    /// Create an experiment from a JSON document (`-` for stdin)
    Create { file: PathBuf },

    /// Replace an experiment's definition from a JSON document
    Update { id: Uuid, file: PathBuf },

    /// Move an experiment to another state
    State {
        id: Uuid,
        /// inactive, demo, scheduled, enrolling or enrollmentComplete
        #[arg(value_parser = parse_state)]
        state: ExperimentState,
    },

    /// Delete an experiment with its overrides and assignments
    Delete { id: Uuid },

    /// Show one experiment as JSON
    Get { id: Uuid },

    /// List all experiments
    List,

    /// Show the persisted assignment records of an experiment
    Records { id: Uuid },

    /// Show the decision point visits of an experiment
    Visits { id: Uuid },
}

fn parse_state(s: &str) -> Result<ExperimentState, String> {
    ExperimentState::parse(s).ok_or_else(|| format!("unknown experiment state {s:?}"))
}

pub async fn run(args: ExperimentArgs) -> Result<()> {
    let actor = Actor(args.actor);
    let services = services().await?;
    let manager = &services.experiments;

    match args.command {
        ExperimentCommands::Create { file } => {
            let spec: ExperimentSpec = read_json(&file)?;
            print_json(&manager.create(spec, &actor).await?)
        }
        ExperimentCommands::Update { id, file } => {
            let spec: ExperimentSpec = read_json(&file)?;
            print_json(&manager.update(ExperimentId(id), spec, &actor).await?)
        }
        ExperimentCommands::State { id, state } => {
            print_json(&manager.update_state(ExperimentId(id), state, &actor).await?)
        }
        ExperimentCommands::Delete { id } => {
            let deleted = manager.delete(ExperimentId(id), &actor).await?;
            println!("Deleted experiment {} ({})", deleted.name, deleted.id);
            Ok(())
        }
        ExperimentCommands::Get { id } => match manager.get(ExperimentId(id)).await? {
            Some(experiment) => print_json(&experiment),
            None => bail!("experiment {id} not found"),
        },
        ExperimentCommands::List => {
            let experiments = manager.find().await?;
            if experiments.is_empty() {
                println!("No experiments");
                return Ok(());
            }
            let mut table = table(&["Id", "Name", "State", "Context", "Conditions", "Partitions"]);
            for experiment in experiments {
                table.add_row(vec![
                    Cell::new(experiment.id),
                    Cell::new(&experiment.name),
                    Cell::new(experiment.state.as_str()),
                    Cell::new(experiment.context.join(", ")),
                    Cell::new(experiment.conditions.len()),
                    Cell::new(experiment.partitions.len()),
                ]);
            }
            println!("{table}");
            Ok(())
        }
        ExperimentCommands::Records { id } => {
            print_json(&services.assignments.list_assignments(ExperimentId(id)).await?)
        }
        ExperimentCommands::Visits { id } => {
            print_json(&services.assignments.list_visits(ExperimentId(id)).await?)
        }
    }
}
