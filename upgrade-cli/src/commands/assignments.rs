use anyhow::Result;
use clap::Args;
use comfy_table::Cell;
use upgrade_core::DecisionPointAssignment;

use super::resolve::UserArgs;
use super::{print_json, services, table};

#[derive(Args, Debug)]
pub struct AssignmentsArgs {
    #[command(flatten)]
    pub user: UserArgs,

    /// Record visits (defaults to `resolution.mark_visited`)
    #[arg(long)]
    pub mark_visited: Option<bool>,

    /// Look up as support staff: never records visits
    #[arg(long, conflicts_with = "mark_visited")]
    pub support: bool,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: AssignmentsArgs) -> Result<()> {
    let services = services().await?;
    let user = args.user.experiment_user();
    let context = &args.user.context;

    let entries = if args.support {
        services.support.get_assignments(&user, context).await?
    } else {
        let mark_visited = args
            .mark_visited
            .unwrap_or(services.resolution.mark_visited);
        services
            .engine
            .get_all_experiment_conditions(&user, context, mark_visited)
            .await?
    };

    if args.json {
        return print_json(&entries);
    }
    print_entries(&entries);
    Ok(())
}

fn print_entries(entries: &[DecisionPointAssignment]) {
    if entries.is_empty() {
        println!("No decision points in this context");
        return;
    }
    let mut table = table(&["Two-char id", "Partition", "Condition", "Source"]);
    for entry in entries {
        let (code, source) = match (&entry.condition, entry.source) {
            (Some(condition), Some(source)) => (condition.code.clone(), format!("{source:?}")),
            (Some(condition), None) => (condition.code.clone(), String::new()),
            (None, _) => ("-".to_string(), String::new()),
        };
        table.add_row(vec![
            Cell::new(&entry.two_character_id),
            Cell::new(&entry.partition_id),
            Cell::new(code),
            Cell::new(source),
        ]);
    }
    println!("{table}");
}
