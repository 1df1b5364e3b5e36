use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;

use membership_engine::audit::{init_audit_bus, start_audit_listener, EventBusAuditLogger};
use membership_engine::cache::{EffectiveGroups, InMemoryCache};
use membership_engine::db::{self, SqliteGraphStore};
use membership_engine::{EngineConfig, EntityNode, MembershipEngine, Role};

#[derive(Parser, Debug)]
#[command(author, version, about = "group membership administration", long_about = None)]
struct Cli {
    /// Data partition every command operates on
    #[arg(long, short, global = true, env = "DATA_PARTITION_ID", default_value = "opendes")]
    partition: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply pending migrations
    Migrate,
    /// Create the partition's bootstrap groups
    Bootstrap {
        #[arg(long)]
        principal: String,
    },
    /// Create a group owned by the requester
    CreateGroup {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        requester: String,
        /// Restrict visibility to these applications (repeatable)
        #[arg(long = "app-id")]
        app_ids: Vec<String>,
        /// Nest the partition's data root group under the new group
        #[arg(long)]
        add_data_root: bool,
    },
    AddMember {
        #[arg(long)]
        group: String,
        /// User email or group id
        #[arg(long)]
        member: String,
        #[arg(long, default_value = "MEMBER")]
        role: Role,
    },
    RemoveMember {
        #[arg(long)]
        group: String,
        #[arg(long)]
        member: String,
    },
    DeleteGroup {
        #[arg(long)]
        group: String,
    },
    RenameGroup {
        #[arg(long)]
        group: String,
        #[arg(long)]
        new_name: String,
    },
    /// Groups a user belongs to, directly or through nesting
    GroupsOf {
        #[arg(long)]
        user: String,
        #[arg(long)]
        app_id: Option<String>,
    },
    /// Direct members of a group
    MembersOf {
        #[arg(long)]
        group: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();
    let pool = db::init().await?;

    if let Commands::Migrate = cli.command {
        // `db::init` already ran them.
        println!("Migrations applied");
        return Ok(());
    }

    let config = EngineConfig::from_env().context("invalid engine configuration")?;
    let (bus, rx) = init_audit_bus();
    let listener = tokio::spawn(start_audit_listener(rx, pool.clone()));

    let engine = MembershipEngine::new(
        Arc::new(SqliteGraphStore::new(pool)),
        Arc::new(InMemoryCache::<EffectiveGroups>::new()),
        Arc::new(EventBusAuditLogger::new(bus)),
        config,
    );

    let result = run(&engine, &cli.partition, cli.command).await;

    // Closing the bus lets the listener drain and exit.
    drop(engine);
    if let Err(err) = listener.await {
        tracing::warn!(error = %err, "audit listener did not shut down cleanly");
    }

    result
}

async fn run(engine: &MembershipEngine, partition: &str, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Migrate => {}
        Commands::Bootstrap { principal } => {
            let affected = engine.bootstrap_partition(partition, &principal).await?;
            print_json(&affected)?;
        }
        Commands::CreateGroup {
            name,
            description,
            requester,
            app_ids,
            add_data_root,
        } => {
            let group = EntityNode::group(&name, &description, partition, &engine.config().domain)
                .with_app_ids(app_ids);
            let requester = engine.resolve_user(&requester, partition).await?;
            let affected = engine
                .create_group(&group, &requester, partition, add_data_root)
                .await?;
            print_json(&affected)?;
        }
        Commands::AddMember { group, member, role } => {
            let group = engine.resolve_group(&group, partition).await?;
            let member = engine.resolve_member(&member, partition).await?;
            let affected = engine.add_member(&group, &member, role, partition).await?;
            print_json(&affected)?;
        }
        Commands::RemoveMember { group, member } => {
            let group = engine.resolve_group(&group, partition).await?;
            let member = engine.resolve_member(&member, partition).await?;
            let affected = engine.remove_member(&group, &member, partition).await?;
            print_json(&affected)?;
        }
        Commands::DeleteGroup { group } => {
            let group = engine.resolve_group(&group, partition).await?;
            let affected = engine.delete_group(&group, partition).await?;
            print_json(&affected)?;
        }
        Commands::RenameGroup { group, new_name } => {
            let group = engine.resolve_group(&group, partition).await?;
            let affected = engine.rename_group(&group, &new_name, partition).await?;
            print_json(&affected)?;
        }
        Commands::GroupsOf { user, app_id } => {
            let user = engine.resolve_user(&user, partition).await?;
            let groups = engine
                .effective_groups(&user.node_id, partition, app_id.as_deref())
                .await?;
            print_json(&groups)?;
        }
        Commands::MembersOf { group } => {
            let group = engine.resolve_group(&group, partition).await?;
            let members = engine.members(&group, partition).await?;
            print_json(&members)?;
        }
    }

    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value).context("failed to encode output")?;
    println!("{json}");
    Ok(())
}

fn load_env() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    let crate_env = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    let _ = dotenvy::from_path(crate_env);
}

fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr);

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
