use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use memory_foundation_core::{
    CanonError, CanonExport, CanonSnapshot, CanonStore, Confidence, ConflictChoice, ConflictParty,
    ConflictResolver, CreateFactInput, FactConflictId, FactFilter, FactId, FactSource, FactStatus,
    FactType, FoundationConfig, SharedClock, SystemClock, UpdateFactInput,
};
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "mf")]
#[command(about = "Memory Foundation CLI")]
struct Cli {
    /// Canon export envelope read on start and rewritten after mutations.
    #[arg(long, default_value = "./canon.json")]
    store: PathBuf,

    /// YAML file with store limits.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Add(AddArgs),
    Update(UpdateArgs),
    Delete(DeleteArgs),
    Get(KeyArgs),
    Query(QueryArgs),
    Snapshot(SnapshotArgs),
    Diff(DiffArgs),
    Verify,
    Metrics,
    Audit(AuditArgs),
    /// List canon conflicts still waiting for a decision.
    PendingConflicts,
    /// Keep one side of a pending canon conflict.
    ResolveConflict(ResolveConflictArgs),
    Conflicts {
        #[command(subcommand)]
        command: ConflictsCommand,
    },
}

#[derive(Debug, Args)]
struct KeyArgs {
    #[arg(long)]
    subject: String,
    #[arg(long)]
    predicate: String,
}

#[derive(Debug, Args)]
struct AddArgs {
    #[arg(long = "type")]
    fact_type: FactType,
    #[command(flatten)]
    key: KeyArgs,
    #[arg(long)]
    value: String,
    #[arg(long)]
    source: FactSource,
    #[arg(long)]
    confidence: Option<Confidence>,
    #[arg(long)]
    created_by: Option<String>,
    #[arg(long)]
    source_ref: Option<String>,
    #[arg(long)]
    source_position: Option<String>,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Debug, Args)]
struct UpdateArgs {
    #[command(flatten)]
    key: KeyArgs,
    #[arg(long)]
    value: String,
    #[arg(long)]
    source: Option<FactSource>,
    #[arg(long)]
    confidence: Option<Confidence>,
    #[arg(long)]
    updated_by: Option<String>,
    #[arg(long)]
    reason: Option<String>,
}

#[derive(Debug, Args)]
struct DeleteArgs {
    #[command(flatten)]
    key: KeyArgs,
    #[arg(long, default_value = "cli")]
    deleted_by: String,
    #[arg(long)]
    reason: Option<String>,
}

#[derive(Debug, Args)]
struct QueryArgs {
    #[arg(long = "type")]
    fact_type: Option<FactType>,
    #[arg(long)]
    subject: Option<String>,
    #[arg(long)]
    subject_pattern: Option<String>,
    #[arg(long)]
    predicate: Option<String>,
    #[arg(long)]
    source: Option<FactSource>,
    #[arg(long)]
    status: Option<FactStatus>,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long)]
    offset: Option<usize>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
struct SnapshotArgs {
    /// Also write the snapshot to this file for a later `diff --from`.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct DiffArgs {
    #[arg(long)]
    from: PathBuf,
}

#[derive(Debug, Args)]
struct AuditArgs {
    #[arg(long)]
    fact_id: Option<FactId>,
}

#[derive(Debug, Args)]
struct ResolveConflictArgs {
    #[arg(long)]
    id: FactConflictId,
    /// `existing` or `incoming`.
    #[arg(long)]
    choice: ConflictChoice,
    #[arg(long, default_value = "cli")]
    resolved_by: String,
}

#[derive(Debug, Subcommand)]
enum ConflictsCommand {
    /// Detect conflicts across a JSON array of parties.
    Scan(ScanArgs),
}

#[derive(Debug, Args)]
struct ScanArgs {
    #[arg(long = "in")]
    input: PathBuf,
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
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn canon_error(err: CanonError) -> anyhow::Error {
    anyhow!("{}: {err}", err.code())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let clock: SharedClock = Arc::new(SystemClock);

    match cli.command {
        Command::Conflicts { command } => run_conflicts(command, clock, &config),
        command => {
            let mut store = open_store(&cli.store, Arc::clone(&clock), &config)?;
            run_canon(command, &mut store, &cli.store)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<FoundationConfig> {
    let Some(path) = path else {
        return Ok(FoundationConfig::default());
    };
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_yaml::from_str(&body)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn open_store(path: &Path, clock: SharedClock, config: &FoundationConfig) -> Result<CanonStore> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "starting with an empty canon");
        return Ok(CanonStore::with_limits(clock, config.canon));
    }
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read canon store {}", path.display()))?;
    let export: CanonExport = serde_json::from_str(&body)
        .with_context(|| format!("failed to parse canon store {}", path.display()))?;
    CanonStore::import(clock, config.canon, export)
        .map_err(canon_error)
        .with_context(|| format!("failed to import canon store {}", path.display()))
}

/// Write the store's export envelope next to `path` and rename it into place.
fn persist_store(store: &mut CanonStore, path: &Path) -> Result<()> {
    let export = store.export().map_err(canon_error)?;
    let body = serde_json::to_vec_pretty(&export)?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temp = NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
    temp.write_all(&body)
        .with_context(|| format!("failed to write canon store {}", path.display()))?;
    temp.as_file()
        .sync_all()
        .with_context(|| format!("failed to sync canon store {}", path.display()))?;
    temp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("failed to replace canon store {}", path.display()))?;
    Ok(())
}

fn run_canon(command: Command, store: &mut CanonStore, path: &Path) -> Result<()> {
    match command {
        Command::Add(args) => run_add(args, store, path),
        Command::Update(args) => run_update(args, store, path),
        Command::Delete(args) => run_delete(args, store, path),
        Command::Get(args) => run_get(&args, store),
        Command::Query(args) => run_query(args, store),
        Command::Snapshot(args) => run_snapshot(&args, store),
        Command::Diff(args) => run_diff(&args, store),
        Command::Verify => run_verify(store),
        Command::Metrics => emit_json(serde_json::to_value(store.get_metrics())?),
        Command::Audit(args) => emit_json(serde_json::json!({
            "entries": store.get_audit_trail(args.fact_id)
        })),
        Command::PendingConflicts => {
            let pending = store.get_pending_conflicts();
            emit_json(serde_json::json!({ "count": pending.len(), "conflicts": pending }))
        }
        Command::ResolveConflict(args) => run_resolve_conflict(&args, store, path),
        Command::Conflicts { .. } => bail!("conflict commands do not operate on the canon store"),
    }
}

fn run_add(args: AddArgs, store: &mut CanonStore, path: &Path) -> Result<()> {
    let mut input = CreateFactInput::new(
        args.fact_type,
        args.key.subject,
        args.key.predicate,
        args.value,
        args.source,
    );
    input.confidence = args.confidence;
    input.created_by = args.created_by;
    input.source_ref = args.source_ref;
    input.source_position = args.source_position;
    input.tags = (!args.tags.is_empty()).then_some(args.tags);
    input.notes = args.notes;

    let fact = match store.add(input) {
        Ok(fact) => fact,
        Err(err @ CanonError::ConflictUnresolved { .. }) => {
            // The CONFLICTED fact and its pending conflict outlive this run.
            persist_store(store, path)?;
            return Err(canon_error(err));
        }
        Err(err) => return Err(canon_error(err)),
    };
    persist_store(store, path)?;
    emit_json(serde_json::json!({ "fact": fact }))
}

fn run_resolve_conflict(args: &ResolveConflictArgs, store: &mut CanonStore, path: &Path) -> Result<()> {
    let fact = store
        .resolve_conflict(args.id, args.choice, &args.resolved_by)
        .map_err(canon_error)?;
    persist_store(store, path)?;
    emit_json(serde_json::json!({ "fact": fact, "conflict": store.get_conflict(args.id) }))
}

fn run_update(args: UpdateArgs, store: &mut CanonStore, path: &Path) -> Result<()> {
    let input = UpdateFactInput {
        value: args.value,
        source: args.source,
        confidence: args.confidence,
        updated_by: args.updated_by,
        reason: args.reason,
    };
    let fact = store
        .update(&args.key.subject, &args.key.predicate, input)
        .map_err(canon_error)?;
    persist_store(store, path)?;
    emit_json(serde_json::json!({ "fact": fact }))
}

fn run_delete(args: DeleteArgs, store: &mut CanonStore, path: &Path) -> Result<()> {
    let fact = store
        .delete(&args.key.subject, &args.key.predicate, &args.deleted_by, args.reason)
        .map_err(canon_error)?;
    persist_store(store, path)?;
    emit_json(serde_json::json!({ "fact": fact }))
}

fn run_get(args: &KeyArgs, store: &CanonStore) -> Result<()> {
    let fact = store.get_fact(&args.subject, &args.predicate).ok_or_else(|| {
        canon_error(CanonError::FactNotFound {
            subject: args.subject.clone(),
            predicate: args.predicate.clone(),
        })
    })?;
    emit_json(serde_json::json!({ "fact": fact }))
}

fn run_query(args: QueryArgs, store: &CanonStore) -> Result<()> {
    let filter = FactFilter {
        fact_type: args.fact_type,
        subject: args.subject,
        subject_pattern: args.subject_pattern,
        predicate: args.predicate,
        source: args.source,
        status: args.status,
        tags: (!args.tags.is_empty()).then_some(args.tags),
        offset: args.offset,
        limit: args.limit,
        ..FactFilter::default()
    };
    let facts = store.query(&filter).map_err(canon_error)?;
    emit_json(serde_json::json!({ "count": facts.len(), "facts": facts }))
}

fn run_snapshot(args: &SnapshotArgs, store: &mut CanonStore) -> Result<()> {
    let snapshot = store.create_snapshot();
    if let Some(out) = args.out.as_ref() {
        let body = serde_json::to_vec_pretty(&snapshot)?;
        fs::write(out, body)
            .with_context(|| format!("failed to write snapshot file {}", out.display()))?;
    }
    emit_json(serde_json::json!({ "snapshot": snapshot }))
}

fn run_diff(args: &DiffArgs, store: &mut CanonStore) -> Result<()> {
    let body = fs::read_to_string(&args.from)
        .with_context(|| format!("failed to read snapshot file {}", args.from.display()))?;
    let from: CanonSnapshot = serde_json::from_str(&body)
        .with_context(|| format!("failed to parse snapshot file {}", args.from.display()))?;
    emit_json(serde_json::to_value(store.diff(&from))?)
}

fn run_verify(store: &CanonStore) -> Result<()> {
    let facts = store.verify_integrity();
    let audit = store.verify_audit_chain();
    let valid = facts.valid && audit.valid;
    emit_json(serde_json::json!({
        "valid": valid,
        "facts": facts,
        "audit": audit
    }))?;
    if !valid {
        bail!("canon integrity check failed");
    }
    Ok(())
}

fn run_conflicts(command: ConflictsCommand, clock: SharedClock, config: &FoundationConfig) -> Result<()> {
    match command {
        ConflictsCommand::Scan(args) => {
            let body = fs::read_to_string(&args.input)
                .with_context(|| format!("failed to read parties file {}", args.input.display()))?;
            let parties: Vec<ConflictParty> = serde_json::from_str(&body)
                .with_context(|| format!("failed to parse parties file {}", args.input.display()))?;

            let mut resolver = ConflictResolver::with_limits(clock, config.resolver);
            let outcome = resolver.scan(&parties);
            emit_json(serde_json::json!({
                "detected": outcome.detected,
                "rejected": outcome.rejected,
                "metrics": resolver.get_metrics()
            }))
        }
    }
}
