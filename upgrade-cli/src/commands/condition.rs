use anyhow::Result;
use clap::{Args, Subcommand};
use comfy_table::Cell;
use upgrade_core::ExperimentId;
use uuid::Uuid;

use super::{services, table};

#[derive(Args, Debug)]
pub struct ConditionArgs {
    #[command(subcommand)]
    pub command: ConditionCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConditionCommands {
    /// List the conditions of an experiment with their weights
    List { experiment: Uuid },
}

pub async fn run(args: ConditionArgs) -> Result<()> {
    match args.command {
        ConditionCommands::List { experiment } => {
            let services = services().await?;
            let conditions = services
                .experiments
                .list_conditions(ExperimentId(experiment))
                .await?;
            let mut table = table(&["Id", "Code", "Two-char id", "Weight"]);
            for condition in conditions {
                table.add_row(vec![
                    Cell::new(condition.id),
                    Cell::new(&condition.code),
                    Cell::new(&condition.two_character_id),
                    Cell::new(condition.assignment_weight),
                ]);
            }
            println!("{table}");
            Ok(())
        }
    }
}
