use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facetrack_core::extractor::parse_embedding;
use facetrack_core::{
    EnrollmentId, GalleryBuilder, IdentityId, MatchSession, MemoryStore, RosterSource, Scope,
    ThresholdMatcher, VectorStore,
};
use facetrack_store::SqliteStore;
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};

mod config;
mod engine;

use config::Config;
use engine::spawn_scanner;

#[derive(Parser)]
#[command(name = "facetrack", about = "FaceTrack attendance face matching")]
struct Cli {
    /// TOML config file (defaults to $FACETRACK_CONFIG if set)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a face embedding for an identity
    Enroll {
        /// Identity (student) id
        #[arg(short, long)]
        identity: i64,
        /// Extractor response JSON file, or "-" for stdin
        #[arg(short, long)]
        encoding: PathBuf,
    },
    /// Remove an enrollment
    Remove {
        /// Enrollment ID to remove
        id: EnrollmentId,
    },
    /// List enrollments of an identity
    List {
        #[arg(short, long)]
        identity: i64,
    },
    /// Manage roster membership
    Roster {
        #[command(subcommand)]
        action: RosterAction,
    },
    /// Match captured frames against a roster and report attendance
    Scan {
        /// Roster scope, e.g. a module code
        #[arg(short, long)]
        scope: String,
        /// JSON Lines file with one extractor response per captured frame
        #[arg(short, long)]
        captures: PathBuf,
        /// Record the result as attendance for this session number
        #[arg(long)]
        session: Option<i64>,
    },
    /// Show store and matcher status
    Status,
}

#[derive(Subcommand)]
enum RosterAction {
    /// Add an identity to a scope
    Add { scope: String, identity: i64 },
    /// Remove an identity from a scope
    Remove { scope: String, identity: i64 },
    /// List members of a scope
    List { scope: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .or_else(|| std::env::var_os("FACETRACK_CONFIG").map(PathBuf::from));
    let config = Config::load(config_path.as_deref())?;
    config
        .match_policy()
        .validate()
        .context("invalid matcher configuration")?;

    let store = SqliteStore::open(&config.db_path, config.embedding_dim)
        .with_context(|| format!("opening {}", config.db_path.display()))?;

    match cli.command {
        Commands::Enroll { identity, encoding } => {
            let body = read_input(&encoding)?;
            let embedding = parse_embedding(&body).context("reading extractor response")?;
            let enrollment = store.add(IdentityId(identity), embedding)?;
            println!(
                "{}",
                serde_json::json!({
                    "id": enrollment.id,
                    "identity": enrollment.identity,
                    "created_at": enrollment.created_at,
                })
            );
        }
        Commands::Remove { id } => {
            if store.remove(id)? {
                println!("Removed enrollment {id}");
            } else {
                println!("No enrollment {id}");
            }
        }
        Commands::List { identity } => {
            let enrollments = store.list_by_identity(IdentityId(identity))?;
            let rows: Vec<_> = enrollments
                .iter()
                .map(|e| {
                    serde_json::json!({
                        "id": e.id,
                        "created_at": e.created_at,
                        "model_version": e.embedding.model_version,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Commands::Roster { action } => run_roster(&store, action)?,
        Commands::Scan {
            scope,
            captures,
            session,
        } => run_scan(&config, &store, Scope(scope), &captures, session).await?,
        Commands::Status => {
            let (identities, enrollments) = store.counts()?;
            println!(
                "{}",
                serde_json::json!({
                    "version": env!("CARGO_PKG_VERSION"),
                    "db_path": config.db_path,
                    "identities": identities,
                    "enrollments": enrollments,
                    "policy": config.match_policy(),
                    "allow_empty_gallery": config.allow_empty_gallery,
                })
            );
        }
    }

    Ok(())
}

fn read_input(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut body = String::new();
        std::io::stdin().read_to_string(&mut body)?;
        return Ok(body);
    }
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn run_roster(store: &SqliteStore, action: RosterAction) -> Result<()> {
    match action {
        RosterAction::Add { scope, identity } => {
            if !store.add_member(&Scope(scope.clone()), IdentityId(identity))? {
                println!("{identity} is already on {scope}");
            }
        }
        RosterAction::Remove { scope, identity } => {
            if !store.remove_member(&Scope(scope.clone()), IdentityId(identity))? {
                println!("{identity} is not on {scope}");
            }
        }
        RosterAction::List { scope } => {
            let members = store.members(&Scope(scope))?;
            println!("{}", serde_json::to_string(&members)?);
        }
    }
    Ok(())
}

async fn run_scan(
    config: &Config,
    store: &SqliteStore,
    scope: Scope,
    captures: &Path,
    session_id: Option<i64>,
) -> Result<()> {
    let matcher = ThresholdMatcher::new(config.match_policy())?;
    let policy = matcher.policy();
    tracing::info!(
        metric = %policy.metric,
        accept = policy.accept_threshold,
        margin = policy.margin_threshold,
        "matcher ready"
    );
    let mut session = MatchSession::new(matcher, config.session_options());

    // Enrollments are read once, before the scan starts.
    let enrolled = MemoryStore::load(config.embedding_dim, store.all_enrollments()?)?;
    let gallery = session
        .start(&GalleryBuilder::new(store, &enrolled), &scope)
        .with_context(|| format!("starting scan for {scope}"))?;
    tracing::info!(
        scope = %gallery.scope(),
        built_at = %gallery.built_at(),
        preloaded = enrolled.len()?,
        "gallery fixed for this scan"
    );
    if !gallery.unenrolled().is_empty() {
        eprintln!(
            "{} of {} students on {scope} have no registered face data",
            gallery.unenrolled().len(),
            gallery.members().len()
        );
    }

    let scanner = spawn_scanner(session)?;

    let file = tokio::fs::File::open(captures)
        .await
        .with_context(|| format!("opening {}", captures.display()))?;
    let mut lines = BufReader::new(file).lines();
    let mut frame = 0usize;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        frame += 1;
        let outcome = scanner
            .submit(parse_embedding(&line))
            .await
            .with_context(|| format!("frame {frame}"))?;
        println!("{}", serde_json::to_string(&outcome)?);
    }

    let report = scanner.close().await?;
    if frame == 0 {
        tracing::warn!(path = %captures.display(), "no captures submitted");
    }

    if let Some(id) = session_id {
        if report.scope != scope {
            bail!("scan report scope {} does not match {scope}", report.scope);
        }
        let written = store.record_attendance(id, &report)?;
        tracing::info!(session = id, rows = written, "attendance written");
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
