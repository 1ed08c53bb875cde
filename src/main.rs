use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use shardgroup::config::{self, Config, LoggingConfig};
use shardgroup::group::GroupManager;
use shardgroup::health::HealthMonitor;
use shardgroup::metrics::metrics;
use shardgroup::model::{POSTS, USERS};
use shardgroup::repository::{
    generate_sample_data, RepoContext, SqlNewsRepository, SqlPostRepository, SqlUserRepository,
    UserRepository, SQL_TARGET,
};
use shardgroup::retry::RetryPolicy;
use shardgroup::schema;
use shardgroup::sharding::TableSelector;

#[derive(Parser)]
#[command(name = "shardgroup")]
#[command(about = "Sharded database groups: connectivity, schema and inspection")]
struct Cli {
    /// Config file; defaults to config/{APP_ENV}/shardgroup.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect both groups and run health checks until Ctrl-C
    Serve,
    /// Ping every database and print per-shard row counts and metrics
    Status,
    /// Create the tables on the master and every shard
    Migrate,
    /// Print the DDL for the configured topology
    Schema,
    /// List users across all shards
    ListUsers {
        #[arg(long, default_value_t = 20)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
    /// Insert sample users, posts and news
    GenerateSampleData {
        /// Rows per entity
        #[arg(long, default_value_t = 100)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => config::load_config(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => config::load_for_env()?,
    };
    init_tracing(&config.logging);

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Status => status(config).await,
        Command::Migrate => migrate(config).await,
        Command::Schema => print_schema(&config),
        Command::ListUsers { limit, offset } => list_users(config, limit, offset).await,
        Command::GenerateSampleData { count } => generate_sample(config, count).await,
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let level = logging
        .level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);
    let mut filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    if logging.sql_log_enabled {
        if let Ok(directive) = format!("{SQL_TARGET}=debug").parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn connect(config: &Config) -> Result<Arc<GroupManager>> {
    let manager = GroupManager::connect(&config.database.groups, &RetryPolicy::from(&config.retry))
        .await
        .context("connecting database groups")?;
    Ok(Arc::new(manager))
}

async fn serve(config: Config) -> Result<()> {
    let manager = connect(&config).await?;
    let monitor = Arc::new(HealthMonitor::new(
        Arc::clone(&manager),
        config.health.clone(),
    ));
    let cancel = CancellationToken::new();
    let checks = Arc::clone(&monitor).start(cancel.clone());

    info!(
        shards = manager.sharding().len(),
        total_tables = manager.table_selector().table_count(),
        "Database groups ready"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    cancel.cancel();
    if let Err(e) = checks.await {
        warn!(error = %e, "Health monitor task failed");
    }
    manager.close_all().await;
    Ok(())
}

async fn status(config: Config) -> Result<()> {
    let manager = connect(&config).await?;

    for outcome in manager.ping_all().await {
        match outcome.result {
            Ok(()) => println!("{:<9} {:>3}  ok", outcome.group, outcome.shard_id),
            Err(e) => println!("{:<9} {:>3}  {e}", outcome.group, outcome.shard_id),
        }
    }

    let ctx = RepoContext::from_config(Arc::clone(&manager), &config);
    for entity in [USERS, POSTS] {
        match ctx.shard_counts(entity, CancellationToken::new()).await {
            Ok(counts) => {
                for count in counts {
                    println!("{entity:<9} {:>3}  {} rows", count.shard_id, count.rows);
                }
            }
            Err(e) => println!("{entity:<9} count failed: {e}"),
        }
    }

    print!("{}", metrics().gather());
    manager.close_all().await;
    Ok(())
}

async fn migrate(config: Config) -> Result<()> {
    let manager = connect(&config).await?;
    let result = schema::migrate(&manager).await;
    manager.close_all().await;
    result.context("applying schema")?;
    info!("Schema applied");
    Ok(())
}

fn print_schema(config: &Config) -> Result<()> {
    let groups = &config.database.groups;
    let master = groups
        .master
        .first()
        .context("master group has no database")?;
    let sharding_driver = groups
        .sharding
        .databases
        .first()
        .map(|db| db.driver)
        .unwrap_or(master.driver);
    let selector = TableSelector::new(
        groups.sharding.total_tables,
        groups.sharding.tables_per_database,
    )?;

    print!("{}", schema::render(master.driver, sharding_driver, &selector)?);
    Ok(())
}

async fn list_users(config: Config, limit: u32, offset: u32) -> Result<()> {
    let manager = connect(&config).await?;
    let users = SqlUserRepository::new(RepoContext::from_config(Arc::clone(&manager), &config));

    let result = users.list(limit, offset, CancellationToken::new()).await;
    manager.close_all().await;
    for user in result? {
        println!("{}", serde_json::to_string(&user)?);
    }
    Ok(())
}

async fn generate_sample(config: Config, count: usize) -> Result<()> {
    let manager = connect(&config).await?;
    let ctx = RepoContext::from_config(Arc::clone(&manager), &config);
    let users = SqlUserRepository::new(ctx.clone());
    let posts = SqlPostRepository::new(ctx.clone());
    let news = SqlNewsRepository::new(ctx);

    info!(count, "Generating sample data");
    let result = generate_sample_data(&users, &posts, &news, count).await;
    manager.close_all().await;
    let summary = result.context("generating sample data")?;
    info!(
        users = summary.users,
        posts = summary.posts,
        news = summary.news,
        "Sample data generated"
    );
    Ok(())
}
