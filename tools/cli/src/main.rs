//! ledgerkeep CLI - offline administration of a local ledger replica.
//!
//! Every command works against the local database only. Writes are queued
//! for the next sync and audited as offline.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::{debug, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ledgerkeep_app::{Ledger, LedgerConfig};
use ledgerkeep_common::{Actor, EntityPayload, EntityType, Record, RecordId, SyncState};
use ledgerkeep_store::{AuditAction, AuditFilter, ConflictChoice, CursorStore};

#[derive(Parser)]
#[command(name = "ledgerkeep")]
#[command(about = "ledgerkeep - Offline-first ledger replica administration")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Ledger configuration file (JSON).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Local database (overrides the configuration).
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Account id (required without --config).
    #[arg(short, long, global = true)]
    account: Option<String>,

    /// Acting user id.
    #[arg(long, global = true, default_value = "admin")]
    user: String,

    /// Acting user role.
    #[arg(long, global = true, default_value = "owner")]
    role: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or overwrite a record.
    Put {
        /// Entity type (inventory, transaction, receivable, ledger_entry, contact).
        #[arg(value_parser = parse_entity_type)]
        entity: EntityType,

        /// Record fields as JSON.
        json: String,

        /// Record id (generated when omitted).
        #[arg(short, long)]
        id: Option<String>,
    },

    /// Show one record.
    Get {
        #[arg(value_parser = parse_entity_type)]
        entity: EntityType,

        id: String,
    },

    /// List records of a type.
    List {
        #[arg(value_parser = parse_entity_type)]
        entity: EntityType,

        /// Only records in this sync state (synced, pending, conflict).
        #[arg(short, long)]
        state: Option<String>,
    },

    /// Delete a record.
    Remove {
        #[arg(value_parser = parse_entity_type)]
        entity: EntityType,

        id: String,
    },

    /// Record a payment against a receivable.
    Pay {
        /// Receivable id.
        id: String,

        /// Amount in minor currency units.
        amount: i64,
    },

    /// Search the audit trail.
    Audit {
        /// Only entries by this user.
        #[arg(long)]
        by: Option<String>,

        /// Only this action (create, update, delete, login, logout, role_change, payment, sync).
        #[arg(long)]
        action: Option<String>,

        /// Only this entity type.
        #[arg(long, value_parser = parse_entity_type)]
        entity: Option<EntityType>,

        /// Description substring.
        #[arg(long)]
        contains: Option<String>,

        /// Maximum entries to show.
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Show sync bookkeeping of the replica.
    Status,

    /// List records in conflict.
    Conflicts {
        #[arg(value_parser = parse_entity_type)]
        entity: Option<EntityType>,
    },

    /// Resolve a conflict.
    Resolve {
        #[arg(value_parser = parse_entity_type)]
        entity: EntityType,

        id: String,

        #[arg(value_enum)]
        choice: Choice,
    },

    /// Record a sign-in.
    Login,

    /// Record a sign-out.
    Logout,
}

#[derive(Clone, Copy, ValueEnum)]
enum Choice {
    KeepLocal,
    TakeRemote,
}

impl From<Choice> for ConflictChoice {
    fn from(choice: Choice) -> Self {
        match choice {
            Choice::KeepLocal => ConflictChoice::KeepLocal,
            Choice::TakeRemote => ConflictChoice::TakeRemote,
        }
    }
}

fn parse_entity_type(s: &str) -> std::result::Result<EntityType, String> {
    s.parse().map_err(|e: ledgerkeep_common::Error| e.to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .compact()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(false)
            .compact()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    let config = load_config(&cli)?;
    let ledger = Ledger::open(&config).context("Failed to open ledger")?;
    debug!("Using account {} as {}", ledger.account(), ledger.actor().id);

    match cli.command {
        Commands::Put { entity, json, id } => cmd_put(&ledger, entity, &json, id),
        Commands::Get { entity, id } => cmd_get(&ledger, entity, &id),
        Commands::List { entity, state } => cmd_list(&ledger, entity, state.as_deref()),
        Commands::Remove { entity, id } => cmd_remove(&ledger, entity, &id),
        Commands::Pay { id, amount } => cmd_pay(&ledger, &id, amount),
        Commands::Audit {
            by,
            action,
            entity,
            contains,
            limit,
        } => cmd_audit(&ledger, by, action, entity, contains, limit),
        Commands::Status => cmd_status(&ledger),
        Commands::Conflicts { entity } => cmd_conflicts(&ledger, entity),
        Commands::Resolve { entity, id, choice } => cmd_resolve(&ledger, entity, &id, choice),
        Commands::Login => {
            ledger
                .login(Actor::new(cli.user.clone(), cli.role.clone()))
                .context("Failed to record login")?;
            println!("Signed in as {} ({})", cli.user, cli.role);
            Ok(())
        }
        Commands::Logout => {
            ledger.logout().context("Failed to record logout")?;
            println!("Signed out {}", cli.user);
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<LedgerConfig> {
    let actor = Actor::new(cli.user.clone(), cli.role.clone());
    let mut config = match (&cli.config, &cli.account) {
        (Some(path), _) => {
            let mut config = LedgerConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?;
            config.actor = actor;
            if let Some(account) = &cli.account {
                config.account_id = account.clone();
            }
            config
        }
        (None, Some(account)) => LedgerConfig::new(account.clone(), actor),
        (None, None) => bail!("Either --config or --account is required"),
    };
    if let Some(database) = &cli.database {
        config.database_path = database.clone();
    }
    Ok(config)
}

fn record_id(id: &str) -> Result<RecordId> {
    RecordId::new(id).context("Invalid record id")
}

fn print_record(record: &Record) -> Result<()> {
    let fields = record.payload.to_value()?;
    println!(
        "{} [{}] rev {} updated {}",
        record.id,
        record.sync_state,
        record.revision,
        record.updated_at.to_rfc3339()
    );
    println!("{}", serde_json::to_string_pretty(&fields)?);
    Ok(())
}

fn cmd_put(ledger: &Ledger, entity: EntityType, json: &str, id: Option<String>) -> Result<()> {
    let id = match id {
        Some(id) => record_id(&id)?,
        None => RecordId::generate(),
    };
    let value: serde_json::Value = serde_json::from_str(json).context("Fields are not valid JSON")?;
    let payload = EntityPayload::decode(entity, id.as_str(), value)
        .with_context(|| format!("Fields do not match {}", entity))?;

    let record = ledger.write(id, payload).context("Failed to write record")?;
    println!("Saved {} {} (queued for sync)", entity, record.id);
    Ok(())
}

fn cmd_get(ledger: &Ledger, entity: EntityType, id: &str) -> Result<()> {
    let record = ledger.read(entity, &record_id(id)?)?;
    print_record(&record)
}

fn cmd_list(ledger: &Ledger, entity: EntityType, state: Option<&str>) -> Result<()> {
    let records = match state {
        Some(state) => {
            let state: SyncState = state.parse().context("Invalid sync state")?;
            ledger.query_by_state(entity, state)?
        }
        None => ledger.query(entity)?,
    };

    if records.is_empty() {
        println!("No {} records.", entity);
        return Ok(());
    }
    for record in records {
        let tombstone = if record.deleted { " (deleted)" } else { "" };
        println!(
            "  {} [{}] rev {}{}",
            record.id, record.sync_state, record.revision, tombstone
        );
    }
    Ok(())
}

fn cmd_remove(ledger: &Ledger, entity: EntityType, id: &str) -> Result<()> {
    ledger
        .remove(entity, &record_id(id)?)
        .with_context(|| format!("Failed to remove {} {}", entity, id))?;
    println!("Removed {} {}", entity, id);
    Ok(())
}

fn cmd_pay(ledger: &Ledger, id: &str, amount: i64) -> Result<()> {
    let record = ledger
        .record_payment(&record_id(id)?, amount)
        .context("Failed to record payment")?;
    let EntityPayload::Receivable(receivable) = &record.payload else {
        return Err(anyhow!("{} is not a receivable", id));
    };
    println!(
        "Payment recorded. Paid {} of {}, balance {}",
        receivable.amount_paid,
        receivable.amount,
        receivable.balance()
    );
    Ok(())
}

fn cmd_audit(
    ledger: &Ledger,
    by: Option<String>,
    action: Option<String>,
    entity: Option<EntityType>,
    contains: Option<String>,
    limit: usize,
) -> Result<()> {
    let mut filter = AuditFilter::default();
    if let Some(by) = by {
        filter = filter.actor(by);
    }
    if let Some(action) = action {
        filter = filter.action(action.parse::<AuditAction>().context("Invalid action")?);
    }
    if let Some(entity) = entity {
        filter = filter.entity_type(entity);
    }
    if let Some(contains) = contains {
        filter = filter.description(contains);
    }

    let mut shown = 0;
    for entry in ledger.audit_query(filter).take(limit) {
        let entry = entry.context("Failed to read audit trail")?;
        let target = match (&entry.entity_type, &entry.record_id) {
            (Some(t), Some(id)) => format!(" {} {}", t, id),
            _ => String::new(),
        };
        println!(
            "{} {:<11} {:<7} {}/{}{}: {}",
            entry.created_at.to_rfc3339(),
            entry.action.as_str(),
            entry.mode.as_str(),
            entry.actor.id,
            entry.actor.role,
            target,
            entry.description
        );
        shown += 1;
    }
    if shown == 0 {
        println!("No matching audit entries.");
    }
    Ok(())
}

fn cmd_status(ledger: &Ledger) -> Result<()> {
    let cursors = CursorStore::new(ledger.database(), ledger.account().clone());

    println!("Account:          {}", ledger.account());
    match cursors.last_synced_at()? {
        Some(at) => println!("Last synced:      {}", at.to_rfc3339()),
        None => println!("Last synced:      never"),
    }
    println!("Pending writes:   {}", ledger.pending_count()?);

    for entity_type in EntityType::ALL {
        let conflicts = ledger.conflicts(entity_type)?.len();
        let pending = ledger.query_by_state(entity_type, SyncState::Pending)?.len();
        println!(
            "  {:<16} cursor {:<6} pending {:<4} conflicts {}",
            entity_type.table(),
            cursors.get(entity_type)?,
            pending,
            conflicts
        );
    }
    Ok(())
}

fn cmd_conflicts(ledger: &Ledger, entity: Option<EntityType>) -> Result<()> {
    let types: Vec<EntityType> = match entity {
        Some(entity) => vec![entity],
        None => EntityType::ALL.to_vec(),
    };

    let mut found = 0;
    for entity_type in types {
        for conflict in ledger.conflicts(entity_type)? {
            found += 1;
            println!(
                "{} {}: fields {}",
                entity_type,
                conflict.record_id,
                conflict.fields.join(", ")
            );
            println!(
                "  local  ({}): {}",
                conflict.local_modified.to_rfc3339(),
                conflict.local.payload.to_json()?
            );
            println!(
                "  remote ({}): {}",
                conflict.remote_modified.to_rfc3339(),
                conflict.remote.payload.to_json()?
            );
        }
    }
    if found == 0 {
        println!("No conflicts.");
    }
    Ok(())
}

fn cmd_resolve(ledger: &Ledger, entity: EntityType, id: &str, choice: Choice) -> Result<()> {
    let record = ledger
        .resolve_conflict(entity, &record_id(id)?, choice.into())
        .context("Failed to resolve conflict")?;
    println!("Resolved {} {}; now {}", entity, id, record.sync_state);
    Ok(())
}
