use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rusqlite::ffi::ErrorCode;
use rusqlite::Connection;
use tracing::{info, warn};

use crate::errors::AppResult;

const SCHEMA: &str = r#"
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    CREATE TABLE IF NOT EXISTS geocode_cache (
        query TEXT PRIMARY KEY,
        status TEXT NOT NULL CHECK (status IN ('found', 'not_found', 'failed')),
        latitude REAL,
        longitude REAL,
        formatted_address TEXT,
        reason TEXT,
        recorded_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_geocode_cache_status ON geocode_cache(status);
"#;

pub struct GeocodeDatabase {
    pub connection: Connection,
    /// The file on disk was unreadable and has been replaced by an empty one.
    pub recreated: bool,
}

/// Opens the geocode cache database, creating the file and schema on first
/// use. An unreadable file is deleted together with its WAL sidecars.
pub fn open_geocode_db(path: &Path) -> AppResult<GeocodeDatabase> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    match open_with_schema(path) {
        Ok(connection) => {
            info!(target: "geocode_db", path = %path.display(), "geocode database ready");
            Ok(GeocodeDatabase {
                connection,
                recreated: false,
            })
        }
        Err(err) if is_unreadable(&err) => {
            warn!(target: "geocode_db", path = %path.display(), error = %err, "geocode database unreadable; recreating");
            for suffix in ["", "-wal", "-shm"] {
                discard(&with_suffix(path, suffix))?;
            }
            Ok(GeocodeDatabase {
                connection: open_with_schema(path)?,
                recreated: true,
            })
        }
        Err(err) => Err(err.into()),
    }
}

fn open_with_schema(path: &Path) -> rusqlite::Result<Connection> {
    let connection = Connection::open(path)?;
    connection.execute_batch(SCHEMA)?;
    Ok(connection)
}

fn is_unreadable(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt)
    )
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn discard(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}
