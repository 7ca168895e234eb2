use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use raid_roster_core::{
    compute_assignment, AssignmentMode, RecruitmentId, RecruitmentState, RetentionPolicy,
};
use raid_roster_store_json::{RecruitmentStore, SnapshotFile};
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "roster")]
#[command(about = "Operator tool for the raid roster snapshot")]
struct Cli {
    #[arg(long, env = "ROSTER_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print recruitments, oldest first.
    List(ListArgs),
    Show(IdArgs),
    /// Run the assignment engine read-only.
    Preview(IdArgs),
    /// Drop recruitments past their retention ceiling. Refuses to write while the service
    /// holds the data directory.
    Sweep(SweepArgs),
    /// Load the snapshot and report what was used and what was skipped.
    Verify,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long, value_parser = parse_state)]
    state: Option<RecruitmentState>,
}

#[derive(Debug, Args)]
struct IdArgs {
    id: RecruitmentId,
}

#[derive(Debug, Args)]
struct SweepArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    /// Evaluate ages as of this RFC 3339 instant instead of the current time.
    #[arg(long, value_parser = parse_rfc3339)]
    now: Option<OffsetDateTime>,
    #[arg(long, env = "ROSTER_RETENTION_MAX_AGE_DAYS", default_value_t = 7)]
    retention_max_age_days: u32,
    #[arg(long, env = "ROSTER_RETENTION_TERMINAL_DAYS", default_value_t = 3)]
    retention_terminal_days: u32,
}

impl SweepArgs {
    fn policy(&self) -> Result<RetentionPolicy> {
        let policy = RetentionPolicy {
            max_age: Duration::days(i64::from(self.retention_max_age_days)),
            terminal_max_age: Duration::days(i64::from(self.retention_terminal_days)),
        };
        if policy.terminal_max_age > policy.max_age {
            return Err(anyhow!(
                "terminal retention ({} days) exceeds the absolute ceiling ({} days)",
                self.retention_terminal_days,
                self.retention_max_age_days
            ));
        }
        Ok(policy)
    }
}

fn parse_state(raw: &str) -> Result<RecruitmentState, String> {
    RecruitmentState::parse(raw).ok_or_else(|| format!("unknown recruitment state `{raw}`"))
}

fn parse_rfc3339(raw: &str) -> Result<OffsetDateTime, String> {
    OffsetDateTime::parse(raw, &Rfc3339).map_err(|err| format!("invalid RFC 3339 time: {err}"))
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut map) => {
            map.insert(
                "cli_contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(map)
        }
        other => json!({ "cli_contract_version": CLI_CONTRACT_VERSION, "data": other }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_store(file: &SnapshotFile) -> Result<RecruitmentStore> {
    let (store, report) = file.load()?;
    for skipped in &report.skipped {
        warn!(key = %skipped.key, reason = %skipped.reason, "skipped malformed recruitment record");
    }
    Ok(store)
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let file = SnapshotFile::in_dir(&cli.data_dir);
    match cli.command {
        Command::List(args) => run_list(&file, &args),
        Command::Show(args) => run_show(&file, &args),
        Command::Preview(args) => run_preview(&file, &args),
        Command::Sweep(args) => run_sweep(&file, &args),
        Command::Verify => run_verify(&file),
    }
}

fn run_list(file: &SnapshotFile, args: &ListArgs) -> Result<()> {
    let store = load_store(file)?;
    let mut records = store
        .all_entries()
        .map(|(_, record)| record)
        .filter(|record| args.state.map_or(true, |state| record.state == state))
        .collect::<Vec<_>>();
    records.sort_by(|left, right| {
        left.created_at.cmp(&right.created_at).then_with(|| left.id.cmp(&right.id))
    });
    emit_json(json!({ "count": records.len(), "recruitments": records }))
}

fn run_show(file: &SnapshotFile, args: &IdArgs) -> Result<()> {
    let store = load_store(file)?;
    let record = store.get(&args.id).ok_or_else(|| anyhow!("recruitment not found: {}", args.id))?;
    emit_json(json!({ "recruitment": record }))
}

fn run_preview(file: &SnapshotFile, args: &IdArgs) -> Result<()> {
    let store = load_store(file)?;
    let record = store.get(&args.id).ok_or_else(|| anyhow!("recruitment not found: {}", args.id))?;
    let outcome = compute_assignment(record, AssignmentMode::Preview)?;
    emit_json(json!({ "outcome": outcome }))
}

fn run_sweep(file: &SnapshotFile, args: &SweepArgs) -> Result<()> {
    let now = args.now.unwrap_or_else(OffsetDateTime::now_utc);
    let policy = args.policy()?;
    let _lock = if args.dry_run { None } else { Some(file.try_lock()?) };
    let mut store = load_store(file)?;

    let evictions = store
        .all_entries()
        .filter_map(|(id, record)| policy.eviction_reason(record, now).map(|reason| (*id, reason)))
        .collect::<Vec<_>>();
    for (id, reason) in &evictions {
        store.delete(id);
        info!(recruitment_id = %id, reason = ?reason, dry_run = args.dry_run, "recruitment evicted");
    }

    let snapshot = if args.dry_run {
        None
    } else {
        Some(file.write(&store).context("failed to write swept snapshot")?)
    };

    emit_json(json!({
        "dry_run": args.dry_run,
        "now": now.format(&Rfc3339)?,
        "removed": evictions
            .iter()
            .map(|(id, reason)| json!({ "id": id, "reason": reason }))
            .collect::<Vec<_>>(),
        "remaining": store.len(),
        "snapshot": snapshot,
    }))
}

fn run_verify(file: &SnapshotFile) -> Result<()> {
    let inspection = file.inspect()?;
    emit_json(json!({
        "path": inspection.path,
        "exists": inspection.exists,
        "sha256": inspection.sha256,
        "backup_exists": inspection.backup_exists,
        "source": inspection.report.source,
        "loaded": inspection.report.loaded,
        "skipped": inspection.report.skipped,
        "primary_error": inspection.report.primary_error,
    }))
}
