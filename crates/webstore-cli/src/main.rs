//! Webstore CLI
//!
//! Inspects and edits the storage of one profile directory: lists objects,
//! runs statements against them, manages quotas and removes stale files.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use webstore_core::{
    init_logging, Attribute, AttributeValue, Config, DriveStep, ExceededHandling, Identity,
    IterFilter, IterOrder, PolicyScope, PromptTarget, Quota, QuotaPrompt, QuotaReply, QuotaRequest,
    QuotaResponder, ResultSet, SqlValue, SqliteEngine, StatementOptions, StorageClass, StorageEnv,
    TokioScheduler, TransactionOptions, DEFAULT_CONTEXT,
};

/// Webstore CLI
#[derive(Parser, Debug)]
#[command(name = "webstore")]
#[command(about = "Inspect and edit quota-managed web storage")]
#[command(version)]
struct Args {
    /// Profile directory holding the index file and data files
    #[arg(short, long, default_value = "./profile")]
    profile: PathBuf,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List storage objects
    List {
        /// Only this storage class
        #[arg(long)]
        class: Option<StorageClass>,

        /// Only this origin
        #[arg(long)]
        origin: Option<String>,

        /// Print JSON lines instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Run one statement against a database
    Sql {
        origin: String,

        /// Database name
        name: String,

        statement: String,

        /// Values for `?` placeholders, bound as text
        #[arg(short = 'p', long = "param")]
        params: Vec<String>,

        /// Grant any quota increase without asking
        #[arg(short, long)]
        yes: bool,
    },

    /// Measure an object's data file
    Size {
        origin: String,

        #[arg(long, default_value = "webdatabase")]
        class: StorageClass,

        name: Option<String>,
    },

    /// Delete objects of an origin, or one named object
    Delete {
        origin: String,

        #[arg(long, default_value = "webdatabase")]
        class: StorageClass,

        name: Option<String>,
    },

    /// Show or change an origin's quota
    Quota {
        origin: String,

        #[arg(long, default_value = "webdatabase")]
        class: StorageClass,

        /// New quota in bytes, or "unlimited"
        #[arg(long)]
        set: Option<Quota>,

        /// What happens when the quota runs out: allow, deny or ask
        #[arg(long)]
        handling: Option<ExceededHandling>,
    },

    /// Remove data files no index entry refers to
    Gc,
}

#[derive(Serialize)]
struct ListedObject<'a> {
    id: u64,
    class: StorageClass,
    origin: &'a str,
    name: Option<&'a str>,
    persistent: bool,
    file: Option<String>,
    size: u64,
    version: Option<&'a str>,
}

/// The only window a terminal has.
const TERMINAL: PromptTarget = PromptTarget(0);

/// Answers quota prompts on the terminal. The reply is given before the
/// prompt returns, so a flushing transaction carries straight on.
struct TerminalPrompt {
    assume_yes: bool,
}

impl TerminalPrompt {
    fn ask(&self, request: &QuotaRequest) -> io::Result<bool> {
        if self.assume_yes {
            return Ok(true);
        }
        let mut stderr = io::stderr().lock();
        write!(
            stderr,
            "{} ({}) uses {} bytes of {} and wants {} bytes. Allow? [y/N] ",
            request.display_name,
            request.domain,
            request.current_size,
            request.current_quota,
            request.desired_size
        )?;
        stderr.flush()?;
        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
    }
}

impl QuotaPrompt for TerminalPrompt {
    fn request_quota_increase(&self, request: QuotaRequest, responder: QuotaResponder) {
        match self.ask(&request) {
            Ok(true) => responder.reply(QuotaReply::AllowUpTo(request.desired_size)),
            Ok(false) => responder.reply(QuotaReply::Deny { new_quota: None }),
            Err(e) => {
                tracing::warn!(error = %e, "Could not read an answer");
                responder.cancel();
            }
        }
    }

    fn cancel(&self, request_id: u64) {
        tracing::debug!(request = request_id, "Quota prompt withdrawn");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.verbose && std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "debug");
    }
    init_logging();

    let config = match &args.config {
        Some(path) => {
            let mut config = Config::from_json_file(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            config.profile_dir = args.profile.clone();
            config
        }
        None => Config::new(&args.profile),
    };

    let env = StorageEnv::new(
        config,
        Arc::new(SqliteEngine::new()),
        Arc::new(TokioScheduler::current()),
    )
    .context("Failed to open profile")?;
    tracing::debug!(profile = %args.profile.display(), "Profile opened");

    let outcome = run(&env, args.command).await;
    env.shutdown().context("Failed to write the index")?;
    outcome
}

async fn run(env: &StorageEnv, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::List {
            class,
            origin,
            json,
        } => list(env, class, origin, json),
        Commands::Sql {
            origin,
            name,
            statement,
            params,
            yes,
        } => {
            env.set_prompt(Some(Arc::new(TerminalPrompt { assume_yes: yes })));
            let identity = Identity::new(
                DEFAULT_CONTEXT,
                StorageClass::WebDatabase,
                origin,
                Some(name),
            );
            let params = params.into_iter().map(SqlValue::Text).collect();
            let result = execute(env, identity, statement, params).await?;
            write_result(&mut io::stdout().lock(), result)
        }
        Commands::Size {
            origin,
            class,
            name,
        } => {
            let identity = Identity::new(DEFAULT_CONTEXT, class, origin, name);
            println!("{}", env.eval_data_size(&identity)?);
            Ok(())
        }
        Commands::Delete {
            origin,
            class,
            name,
        } => {
            let deleted = match name {
                Some(name) => {
                    let identity = Identity::new(DEFAULT_CONTEXT, class, origin, Some(name));
                    usize::from(env.delete_object(&identity)?)
                }
                None => env.delete_objects(DEFAULT_CONTEXT, Some(class), Some(&origin), false)?,
            };
            println!("Deleted {deleted} object(s)");
            Ok(())
        }
        Commands::Quota {
            origin,
            class,
            set,
            handling,
        } => {
            let scope = PolicyScope::origin(DEFAULT_CONTEXT, class, origin);
            if let Some(quota) = set {
                env.set_policy(Attribute::OriginQuota, &scope, AttributeValue::Quota(quota))?;
            }
            if let Some(handling) = handling {
                env.set_policy(
                    Attribute::ExceededHandling,
                    &scope,
                    AttributeValue::Handling(handling),
                )?;
            }
            println!("quota: {}", env.policy().origin_quota(&scope));
            println!("handling: {}", env.policy().exceeded_handling(&scope).as_str());
            Ok(())
        }
        Commands::Gc => {
            let removed = env.delete_orphan_files(DEFAULT_CONTEXT)?;
            println!("Removed {removed} orphan file(s)");
            Ok(())
        }
    }
}

fn list(
    env: &StorageEnv,
    class: Option<StorageClass>,
    origin: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let mut filter = IterFilter::default();
    if let Some(class) = class {
        filter = filter.class(class);
    }
    if let Some(origin) = origin {
        filter = filter.origin(origin);
    }
    let entries = env.enumerate(DEFAULT_CONTEXT, IterOrder::Ascending, filter)?;

    for entry in &entries {
        let identity = entry.identity();
        let listed = ListedObject {
            id: entry.id().raw(),
            class: identity.class,
            origin: entry.origin(),
            name: identity.name.as_deref(),
            persistent: entry.is_persistent(),
            file: entry
                .data_file()
                .and_then(|file| file.relative_path())
                .map(display_path),
            size: env.index().data_file_size(entry.id()).unwrap_or(0),
            version: entry.version(),
        };
        if json {
            println!("{}", serde_json::to_string(&listed)?);
        } else {
            println!(
                "{:<6} {:<18} {:<40} {:<20} {:>10}  {}",
                listed.id,
                listed.class.to_string(),
                listed.origin,
                listed.name.unwrap_or("-"),
                listed.size,
                listed.file.as_deref().unwrap_or("-"),
            );
        }
    }
    if !json {
        println!("{} object(s)", entries.len());
    }
    Ok(())
}

fn display_path(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Runs one statement in a synchronous transaction, waiting out busy
/// back-offs.
async fn execute(
    env: &StorageEnv,
    identity: Identity,
    sql: String,
    params: Vec<SqlValue>,
) -> anyhow::Result<Option<ResultSet>> {
    let object = env.open(identity)?;
    let tx = object.transaction(TransactionOptions::default().synchronous())?;
    let (done, result) = crossbeam::channel::bounded(1);
    tx.execute_sql(
        sql,
        params,
        StatementOptions::cached().with_prompt_target(TERMINAL),
        Box::new(move |outcome| {
            let _ = done.send(outcome);
        }),
    )?;

    loop {
        match tx.flush()? {
            DriveStep::Yield(delay) => tokio::time::sleep(delay).await,
            DriveStep::Continue => {}
            DriveStep::Done | DriveStep::Suspended => break,
        }
    }
    tx.release();
    object.release();

    match result.try_recv() {
        Ok(outcome) => Ok(outcome?),
        Err(_) => bail!("Statement did not finish"),
    }
}

/// Prints a statement's outcome as tab-separated rows. Stops at the first
/// row the engine fails to produce.
fn write_result(out: &mut impl Write, result: Option<ResultSet>) -> anyhow::Result<()> {
    let Some(mut result) = result else {
        return Ok(());
    };
    if let Some(affected) = result.rows_affected() {
        writeln!(out, "{affected} row(s) affected")?;
        return Ok(());
    }
    writeln!(out, "{}", result.column_names().join("\t"))?;
    while result.step().context("Failed to read the next row")? {
        let row: Vec<String> = (0..result.column_count())
            .map(|column| {
                result
                    .value(column)
                    .map(ToString::to_string)
                    .unwrap_or_default()
            })
            .collect();
        writeln!(out, "{}", row.join("\t"))?;
    }
    writeln!(out, "({} row(s))", result.row_count())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use webstore_core::{Engine, MemoryEngine};
    use webstore_sql::{Cursor, OpenTarget};

    fn output(result: Option<ResultSet>) -> (anyhow::Result<()>, String) {
        let mut out = Vec::new();
        let written = write_result(&mut out, result);
        (written, String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_writes_rows_and_counts() {
        let (written, text) = output(Some(ResultSet::dml(3, 7)));
        written.unwrap();
        assert_eq!(text, "3 row(s) affected\n");

        let rows = ResultSet::rows(
            vec!["k".into(), "bytes".into()],
            None,
            Some(vec![SqlValue::Text("a".into()), SqlValue::Integer(4)]),
        );
        let (written, text) = output(Some(rows));
        written.unwrap();
        assert_eq!(text, "k\tbytes\na\t4\n(1 row(s))\n");
    }

    #[test]
    fn test_step_error_is_reported() {
        let engine = MemoryEngine::new();
        let mut conn = engine.open(&OpenTarget::Memory, false).unwrap();
        let stmt = conn.prepare("SELECT").unwrap();
        conn.finalize(stmt).unwrap();
        let cursor = Cursor::new(Arc::new(Mutex::new(conn)), stmt);
        let rows = ResultSet::rows(
            vec!["k".into(), "bytes".into()],
            Some(cursor),
            Some(vec![SqlValue::Text("a".into()), SqlValue::Integer(4)]),
        );

        let (written, text) = output(Some(rows));
        assert!(written.is_err());
        assert_eq!(text, "k\tbytes\na\t4\n");
    }
}
