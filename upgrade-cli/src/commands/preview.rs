//! Preview user commands.

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use comfy_table::Cell;
use upgrade_core::{PreviewAssignmentSpec, UserId};

use super::{print_json, read_json, services, table};

#[derive(Args, Debug)]
pub struct PreviewArgs {
    #[command(subcommand)]
    pub command: PreviewCommands,
}

#[derive(Subcommand, Debug)]
pub enum PreviewCommands {
    /// Register a preview user
    Create { user: String },

    /// List preview users
    List {
        #[arg(long, default_value_t = 0)]
        skip: usize,
        /// Page size; all users when omitted
        #[arg(long)]
        take: Option<usize>,
    },

    /// Show a preview user with their assignments
    Show { user: String },

    /// Replace a preview user's assignments from a JSON array (`-` for stdin)
    Assign { user: String, file: PathBuf },

    /// Remove a preview user and their assignments
    Delete { user: String },

    /// Count preview users
    Count,
}

pub async fn run(args: PreviewArgs) -> Result<()> {
    let services = services().await?;
    let preview = &services.preview;

    match args.command {
        PreviewCommands::Create { user } => print_json(&preview.create(&UserId(user)).await?),
        PreviewCommands::List { skip, take } => {
            let users = match take {
                Some(take) => preview.find_paginated(skip, take).await?,
                None => preview.find().await?.into_iter().skip(skip).collect(),
            };
            if users.is_empty() {
                println!("No preview users");
                return Ok(());
            }
            let mut table = table(&["User", "Assignments", "Created"]);
            for user in users {
                table.add_row(vec![
                    Cell::new(&user.id),
                    Cell::new(user.assignments.len()),
                    Cell::new(user.created_at.to_rfc3339()),
                ]);
            }
            println!("{table}");
            Ok(())
        }
        PreviewCommands::Show { user } => match preview.find_one(&UserId(user.clone())).await? {
            Some(found) => print_json(&found),
            None => bail!("{user} is not a preview user"),
        },
        PreviewCommands::Assign { user, file } => {
            let specs: Vec<PreviewAssignmentSpec> = read_json(&file)?;
            print_json(&preview.set_assignments(&UserId(user), specs).await?)
        }
        PreviewCommands::Delete { user } => match preview.delete(&UserId(user.clone())).await? {
            Some(_) => {
                println!("Removed preview user {user}");
                Ok(())
            }
            None => bail!("{user} is not a preview user"),
        },
        PreviewCommands::Count => {
            println!("{}", preview.count().await?);
            Ok(())
        }
    }
}
