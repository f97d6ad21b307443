//! Athena server entry point.
//!
//! Binds the hook socket, opens (or resumes) the session store, and runs
//! one pipeline for the session. Rules and loop configuration arrive from
//! collaborator surfaces at runtime; none are read from files here.

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use athena::engine::DecisionEngine;
use athena::mapper::FeedMapper;
use athena::pipeline::Pipeline;
use athena::store::SessionStore;
use athena::transport::{DecisionRouter, HookSocket};
use athena::{logging, paths};

#[derive(Parser)]
#[command(name = "athena", about = "Hook event pipeline for coding-agent sessions")]
struct Args {
    /// Data directory (default: ATHENA_DATA_DIR or ~/.athena)
    #[arg(long, env = "ATHENA_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Hook socket path (default: <data-dir>/athena.sock)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Project directory this session monitors
    #[arg(long, default_value = ".")]
    project_dir: PathBuf,

    /// Resume an existing persisted session by id
    #[arg(long)]
    resume: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    paths::init_data_dir(args.data_dir.as_deref());
    paths::ensure_dirs()?;
    let _logging = logging::init_logging()?;

    let session_id = args
        .resume
        .clone()
        .unwrap_or_else(athena_protocol::new_id);
    let project_dir = args
        .project_dir
        .canonicalize()
        .unwrap_or(args.project_dir.clone())
        .display()
        .to_string();

    let store = SessionStore::open(
        paths::session_db_path(&session_id),
        &session_id,
        &project_dir,
    )
    .await?;
    let checkpoint = store.checkpoint().await?;
    let mapper = FeedMapper::with_checkpoint(&session_id, checkpoint);
    let engine = DecisionEngine::new(Vec::new(), None);

    let router = DecisionRouter::new();
    let (pipeline, events_tx) = Pipeline::spawn(engine, mapper, store, router.clone());

    let socket_path = args.socket.unwrap_or_else(paths::socket_path);
    let socket = HookSocket::bind(&socket_path, router, events_tx)?;

    info!(
        component = "main",
        event = "main.started",
        session_id = %session_id,
        project_dir = %project_dir,
        socket = %socket_path.display(),
        resumed = args.resume.is_some(),
        "Athena server started"
    );

    tokio::select! {
        _ = socket.serve() => {}
        _ = tokio::signal::ctrl_c() => {
            info!(
                component = "main",
                event = "main.shutdown",
                "Shutting down"
            );
        }
    }

    pipeline.shutdown().await;
    Ok(())
}
