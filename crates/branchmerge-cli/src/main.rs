use std::path::PathBuf;

use anyhow::{Context, Result};
use branchmerge_api::BranchMergeApi;
use branchmerge_core::{BranchId, MergeRequest};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "bm")]
#[command(about = "Merchant branch consolidation CLI")]
struct Cli {
    #[arg(long, default_value = "./branchmerge.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Branch {
        #[command(subcommand)]
        command: BranchCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    SeedDemo,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum BranchCommand {
    List,
    Show(BranchShowArgs),
    Merge(BranchMergeArgs),
    Transactions(BranchShowArgs),
    Orders(BranchShowArgs),
}

#[derive(Debug, Args)]
struct BranchShowArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct BranchMergeArgs {
    /// The surviving branch; chosen by the operator, never inferred.
    #[arg(long)]
    canonical: String,
    /// Repeatable; every duplicate is absorbed into the canonical branch.
    #[arg(long = "duplicate", required = true)]
    duplicates: Vec<String>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "data": other,
        }),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let value = serde_json::to_value(value).context("failed to serialize output")?;
    let stamped = with_contract_version(value);
    let rendered =
        serde_json::to_string_pretty(&stamped).context("failed to render output JSON")?;
    println!("{rendered}");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let api = BranchMergeApi::new(cli.db);

    match cli.command {
        Command::Db { command } => match command {
            DbCommand::SchemaVersion => print_json(&api.schema_status()?),
            DbCommand::Migrate(args) => print_json(&api.migrate(args.dry_run)?),
            DbCommand::SeedDemo => print_json(&api.seed_demo()?),
        },
        Command::Branch { command } => match command {
            BranchCommand::List => print_json(&api.list_branches()?),
            BranchCommand::Show(args) => print_json(&api.get_branch(&BranchId::new(args.id))?),
            BranchCommand::Transactions(args) => {
                print_json(&api.list_transactions(&BranchId::new(args.id))?)
            }
            BranchCommand::Orders(args) => {
                print_json(&api.list_orders(&BranchId::new(args.id))?)
            }
            BranchCommand::Merge(args) => {
                let request = MergeRequest {
                    canonical_id: BranchId::new(args.canonical),
                    duplicate_ids: args.duplicates.into_iter().map(BranchId::new).collect(),
                };
                let canonical = api.merge_branches(&request)?;
                print_json(&canonical)
            }
        },
    }
}
