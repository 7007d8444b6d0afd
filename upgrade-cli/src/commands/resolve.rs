//! Resolution commands for one user.

use anyhow::Result;
use clap::Args;
use upgrade_core::ExperimentUser;

use super::{print_json, services};

/// Who is resolved, and where.
#[derive(Args, Debug, Clone)]
pub struct UserArgs {
    /// User id
    #[arg(short, long)]
    pub user: String,

    /// Host context the request comes from
    #[arg(short, long)]
    pub context: String,

    /// Group membership as `type=id`, repeatable
    #[arg(short, long = "group", value_parser = parse_group)]
    pub groups: Vec<(String, String)>,
}

impl UserArgs {
    pub fn experiment_user(&self) -> ExperimentUser {
        self.groups.iter().fold(
            ExperimentUser::new(self.user.as_str()),
            |user, (group_type, group_id)| user.with_group(group_type, group_id),
        )
    }
}

fn parse_group(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((group_type, group_id)) if !group_type.is_empty() && !group_id.is_empty() => {
            Ok((group_type.to_string(), group_id.to_string()))
        }
        _ => Err(format!("expected type=id, got {s:?}")),
    }
}

#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Two-character id of the decision point
    pub partition: String,

    #[command(flatten)]
    pub user: UserArgs,
}

pub async fn run(args: ResolveArgs) -> Result<()> {
    let services = services().await?;
    let user = args.user.experiment_user();
    let resolution = services
        .engine
        .resolve(&user, &args.user.context, &args.partition)
        .await?;
    print_json(&resolution)
}
