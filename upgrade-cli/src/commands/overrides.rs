//! Explicit per-user assignment commands.

use anyhow::Result;
use clap::{Args, Subcommand};
use upgrade_core::{ConditionId, ExperimentId, UserId};
use uuid::Uuid;

use super::{print_json, services};

#[derive(Args, Debug)]
pub struct OverrideArgs {
    #[command(subcommand)]
    pub command: OverrideCommands,
}

#[derive(Subcommand, Debug)]
pub enum OverrideCommands {
    /// Pin a user to a condition
    Set {
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        experiment: Uuid,
        #[arg(short, long)]
        condition: Uuid,
    },

    /// Show the condition a user is pinned to
    Get {
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        experiment: Uuid,
    },

    /// Remove a pin
    Delete {
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        experiment: Uuid,
    },

    /// List a user's pins
    List {
        #[arg(short, long)]
        user: String,
    },
}

pub async fn run(args: OverrideArgs) -> Result<()> {
    let services = services().await?;
    let pins = &services.explicit;

    match args.command {
        OverrideCommands::Set {
            user,
            experiment,
            condition,
        } => {
            let pin = pins
                .upsert(
                    &UserId(user),
                    ExperimentId(experiment),
                    ConditionId(condition),
                )
                .await?;
            print_json(&pin)
        }
        OverrideCommands::Get { user, experiment } => {
            match pins.get(&UserId(user.clone()), ExperimentId(experiment)).await? {
                Some(condition) => print_json(&condition),
                None => {
                    println!("{user} has no explicit assignment in {experiment}");
                    Ok(())
                }
            }
        }
        OverrideCommands::Delete { user, experiment } => {
            if pins.delete(&UserId(user.clone()), ExperimentId(experiment)).await? {
                println!("Removed explicit assignment of {user}");
            } else {
                println!("{user} had no explicit assignment in {experiment}");
            }
            Ok(())
        }
        OverrideCommands::List { user } => print_json(&pins.list_for_user(&UserId(user)).await?),
    }
}
