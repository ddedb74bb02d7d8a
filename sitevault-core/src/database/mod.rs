//! SQLite dump and import.

pub mod dump;
pub mod import;

pub use dump::{dump_database, dump_file, DumpSummary, DUMPING};
pub use import::{import_file, ImportMode, ImportSummary, StatementSplitter, RESTORING_DB};

use rusqlite::{Connection, OpenFlags};
use std::path::Path;

use crate::utils::{Error, Result};

pub fn open_read_only(path: &Path) -> Result<Connection> {
    if !path.is_file() {
        return Err(Error::Configuration(format!(
            "database {} does not exist",
            path.display()
        )));
    }
    Ok(Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?)
}

/// Open for writing, creating the file when missing.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(conn)
}
