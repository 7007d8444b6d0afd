//! Decision point commands.

use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use comfy_table::Cell;
use upgrade_core::{Actor, ExperimentId, Partition};
use uuid::Uuid;

use super::{print_json, services, table};

#[derive(Args, Debug)]
pub struct PartitionArgs {
    #[command(subcommand)]
    pub command: PartitionCommands,
}

#[derive(Subcommand, Debug)]
pub enum PartitionCommands {
    /// List partitions, of one experiment or of all
    List {
        #[arg(short, long)]
        experiment: Option<Uuid>,
    },

    /// Find the partition with a two-character id
    Find { two_character_id: String },

    /// Delete every partition of an experiment
    Clear {
        experiment: Uuid,
        #[arg(long, default_value = "cli")]
        actor: String,
    },
}

pub async fn run(args: PartitionArgs) -> Result<()> {
    let services = services().await?;
    let manager = &services.experiments;

    match args.command {
        PartitionCommands::List { experiment } => {
            let partitions = match experiment {
                Some(id) => manager.list_partitions(ExperimentId(id)).await?,
                None => manager.list_all_partitions().await?,
            };
            print_partitions(&partitions);
            Ok(())
        }
        PartitionCommands::Find { two_character_id } => {
            match manager.find_partition(&two_character_id).await? {
                Some(partition) => print_json(&partition),
                None => bail!("no partition with two-character id {two_character_id:?}"),
            }
        }
        PartitionCommands::Clear { experiment, actor } => {
            let deleted = manager
                .delete_partitions(ExperimentId(experiment), &Actor(actor))
                .await?;
            println!("Deleted {} partition(s)", deleted.len());
            Ok(())
        }
    }
}

fn print_partitions(partitions: &[Partition]) {
    if partitions.is_empty() {
        println!("No partitions");
        return;
    }
    let mut table = table(&["Two-char id", "Partition", "Experiment", "Description"]);
    for partition in partitions {
        table.add_row(vec![
            Cell::new(&partition.two_character_id),
            Cell::new(&partition.id),
            Cell::new(partition.experiment_id),
            Cell::new(&partition.description),
        ]);
    }
    println!("{table}");
}
