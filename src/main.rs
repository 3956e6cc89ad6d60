//! sqldevice CLI: translate a JSON logical plan, or run it against a backend.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use log::{error, info};

use sqldevice::models::enums::{CursorType, DatabaseType, IsolationLevel};
use sqldevice::query_ast::LogicalQueryPlan;
use sqldevice::query_ast::ResultKind;
use sqldevice::{Device, DeviceConfig, DeviceSession, Value};

#[derive(Parser)]
#[command(name = "sqldevice", version, about = "Translate and run logical query plans as SQL")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the SQL and parameter list a plan translates to
    Translate {
        plan: PathBuf,
        /// Dialect name (generic, sqlite, postgres, mysql, mssql)
        #[arg(long)]
        dialect: Option<DatabaseType>,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Execute a plan and print its rows tab-separated
    Run {
        plan: PathBuf,
        #[arg(long)]
        config: PathBuf,
        /// Run the cursor on the read-uncommitted browse pool
        #[arg(long)]
        browse: bool,
    },
}

fn read_plan(path: &Path) -> Result<LogicalQueryPlan, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn load_config(path: Option<&Path>) -> Result<DeviceConfig, Box<dyn std::error::Error>> {
    Ok(match path {
        Some(path) => DeviceConfig::load(path)?,
        None => DeviceConfig::from_env()?,
    })
}

fn translate(plan: &Path, dialect: Option<DatabaseType>, config: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(config)?;
    if dialect.is_some() {
        config.dialect = dialect;
    }
    let device = Device::from_config(&config);
    let prepared = device.prepare(&read_plan(plan)?)?;
    for diagnostic in &prepared.translated.diagnostics {
        info!("{}", diagnostic);
    }
    println!("{}", prepared.sql.text);
    for (position, name) in prepared.sql.parameters.iter().enumerate() {
        println!("-- ${} = {}", position + 1, name);
    }
    Ok(())
}

async fn run(plan: &Path, config: &Path, browse: bool) -> Result<(), Box<dyn std::error::Error>> {
    let plan = read_plan(plan)?;
    let mut session = DeviceSession::from_config(DeviceConfig::load(config)?);
    let result = run_in(&mut session, &plan, browse).await;
    let closed = session.close().await;
    result?;
    Ok(closed?)
}

async fn run_in(session: &mut DeviceSession, plan: &LogicalQueryPlan, browse: bool) -> Result<(), Box<dyn std::error::Error>> {
    let parameters = HashMap::new();
    if plan.result_kind() == ResultKind::Statement {
        session.begin_transaction(IsolationLevel::CursorStability).await?;
        let rows = session.execute(plan, &parameters).await?;
        session.commit().await?;
        println!("{} rows affected", rows);
        return Ok(());
    }
    let isolation = if browse { IsolationLevel::Browse } else { IsolationLevel::CursorStability };
    let cursor = session.open_cursor(plan, parameters, CursorType::Dynamic, isolation).await?;
    let prepared = session.device().prepare(plan)?;
    let header: Vec<&str> = prepared.translated.columns.iter().map(|c| c.name.as_str()).collect();
    println!("{}", header.join("\t"));
    while let Some(row) = session.next(cursor).await? {
        let cells: Vec<String> = row.iter().map(Value::to_string).collect();
        println!("{}", cells.join("\t"));
    }
    session.close_cursor(cursor).await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    sqldevice::init_logging();
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Translate { plan, dialect, config } => translate(&plan, dialect, config.as_deref()),
        Commands::Run { plan, config, browse } => run(&plan, &config, browse).await,
    };
    if let Err(err) = result {
        error!("{}", err);
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }
}
