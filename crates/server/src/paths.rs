//! Central path resolution for all Athena data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `ATHENA_DATA_DIR` env
//! > `~/.athena`. All callsites use these helpers instead of constructing
//! paths from `HOME`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Initialize the global data directory. Returns the resolved path.
///
/// Priority: `explicit` arg > `ATHENA_DATA_DIR` env > `~/.athena` default.
/// Panics if no valid path can be resolved.
pub fn init_data_dir(explicit: Option<&Path>) -> PathBuf {
    let dir = if let Some(p) = explicit {
        p.to_path_buf()
    } else if let Ok(env_val) = std::env::var("ATHENA_DATA_DIR") {
        PathBuf::from(env_val)
    } else {
        dirs::home_dir()
            .expect("HOME directory not found")
            .join(".athena")
    };

    let mut guard = DATA_DIR.write().expect("DATA_DIR lock poisoned");
    *guard = Some(dir.clone());
    dir
}

/// Return the current data directory. Panics if `init_data_dir` hasn't been called.
pub fn data_dir() -> PathBuf {
    DATA_DIR
        .read()
        .expect("DATA_DIR lock poisoned")
        .clone()
        .expect("data_dir() called before init_data_dir()")
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

pub fn sessions_dir() -> PathBuf {
    data_dir().join("sessions")
}

/// Database file for one persisted session.
pub fn session_db_path(session_id: &str) -> PathBuf {
    sessions_dir().join(format!("{session_id}.db"))
}

/// Default hook socket for this instance.
pub fn socket_path() -> PathBuf {
    data_dir().join("athena.sock")
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs() -> io::Result<()> {
    let base = data_dir();
    std::fs::create_dir_all(&base)?;
    std::fs::create_dir_all(base.join("logs"))?;
    std::fs::create_dir_all(base.join("sessions"))?;
    Ok(())
}
