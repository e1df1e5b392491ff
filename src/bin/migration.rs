use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use farm_service_api::{db, migrator::Migrator};
use sea_orm_migration::MigratorTrait;
use tracing::info;

#[derive(Parser)]
#[command(name = "migration", about = "Schema migrations for farm-service-api", version)]
struct Cli {
    #[arg(
        long,
        env = "DATABASE_URL",
        default_value = "sqlite://farm_service.db?mode=rwc",
        help = "Database connection URL"
    )]
    database_url: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending migrations (default)
    Up {
        #[arg(long, help = "Apply at most this many migrations")]
        steps: Option<u32>,
    },
    /// Roll back applied migrations
    Down {
        #[arg(long, default_value_t = 1, help = "Number of migrations to roll back")]
        steps: u32,
    },
    /// List applied and pending migrations
    Status,
    /// Drop every table and re-apply all migrations
    Fresh,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Up { steps: None }) {
        Command::Up { steps: None } => {
            farm_service_api::migrator::run_migration(&cli.database_url).await?;
        }
        Command::Up { steps } => {
            let conn = connect(&cli.database_url).await?;
            Migrator::up(&conn, steps).await?;
            info!("Applied up to {:?} migrations", steps);
        }
        Command::Down { steps } => {
            let conn = connect(&cli.database_url).await?;
            Migrator::down(&conn, Some(steps)).await?;
            info!("Rolled back {} migrations", steps);
        }
        Command::Status => {
            let conn = connect(&cli.database_url).await?;
            Migrator::status(&conn).await?;
        }
        Command::Fresh => {
            let conn = connect(&cli.database_url).await?;
            Migrator::fresh(&conn).await?;
            info!("Database recreated");
        }
    }

    Ok(())
}

async fn connect(url: &str) -> Result<db::DbPool> {
    db::establish_connection(url)
        .await
        .with_context(|| format!("failed to connect to {}", url))
}
