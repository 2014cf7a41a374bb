use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use board_sync::board::{BoardApi, GraphQlBoardClient};
use board_sync::config;

#[derive(Parser, Debug)]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Board ID to inspect; defaults to the configured board
    #[arg(long)]
    board: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let cfg = config::load(Some(&args.config))?;
    let client = GraphQlBoardClient::from_config(&cfg)?;
    let board_id = args.board.unwrap_or_else(|| cfg.board.board_id.clone());

    let schema = client.board_schema(&board_id).await?;
    println!("Board ID: {}", schema.board_id);
    println!("Columns:");
    for (id, col) in &schema.columns {
        println!("  {} -> {{ title: {}, type: {} }}", id, col.title, col.ty.kind());
    }

    let mapped: Vec<_> = cfg
        .mapping
        .columns
        .iter()
        .filter(|m| m.target != "name" && schema.column(&m.target).is_none())
        .collect();
    for m in mapped {
        println!("warning: mapped target '{}' is not a column of this board", m.target);
    }
    Ok(())
}
