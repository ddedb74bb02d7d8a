//! Database-wide search/replace, typically the site URL after a move.

pub mod serialized;

pub use serialized::{decode, encode, replace_in, Decoded, SerializedValue};

use rusqlite::types::{Value, ValueRef};
use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::json;
use std::path::Path;
use uuid::Uuid;

use crate::database::dump::quote_ident;
use crate::status::JobContext;
use crate::utils::{Error, Result};

const MIGRATING_PERCENT: u8 = 50;

const TEXT_TYPES: &[&str] = &["TEXT", "CHAR", "CLOB", "BLOB", "JSON"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationSummary {
    pub tables: u64,
    pub columns: u64,
    pub values_scanned: u64,
    pub values_updated: u64,
}

struct Table {
    name: String,
    without_rowid: bool,
}

enum RowKey {
    RowId(i64),
    Original(Value),
}

/// Replace `from` with `to` in every text-bearing column of every table.
///
/// Runs in one transaction. Values that come out identical are not written.
pub fn search_replace(
    conn: &mut Connection,
    from: &str,
    to: &str,
    ctx: &JobContext,
) -> Result<MigrationSummary> {
    if from.is_empty() {
        return Err(Error::Configuration(
            "search string must not be empty".to_string(),
        ));
    }
    if from == to {
        return Ok(MigrationSummary::default());
    }

    let tx = conn.transaction()?;
    let mut summary = MigrationSummary::default();

    for table in user_tables(&tx)? {
        summary.tables += 1;
        for column in text_columns(&tx, &table.name)? {
            summary.columns += 1;
            replace_column(&tx, &table, &column, from.as_bytes(), to.as_bytes(), &mut summary)?;
        }
    }

    tx.commit()?;
    ctx.log.info(
        "migrate_replace_done",
        json!({
            "from": from,
            "to": to,
            "tables": summary.tables,
            "updated": summary.values_updated,
        }),
    );
    Ok(summary)
}

/// Open `db_path` and run [`search_replace`] against it.
pub fn migrate_file(db_path: &Path, from: &str, to: &str, ctx: &JobContext) -> Result<MigrationSummary> {
    if !db_path.is_file() {
        return Err(Error::Configuration(format!(
            "database {} does not exist",
            db_path.display()
        )));
    }
    let mut conn = crate::database::open(db_path)?;
    search_replace(&mut conn, from, to, ctx)
}

/// Standalone migration job with its own progress record, from begin to
/// "Complete". Failures end the record in "Failed".
pub async fn run_job(
    db_path: &Path,
    from: &str,
    to: &str,
    ctx: &JobContext,
) -> Result<MigrationSummary> {
    let job_id = Uuid::new_v4().to_string();
    ctx.progress.begin(&job_id);
    ctx.log.info(
        "migrate_started",
        json!({ "job_id": job_id, "from": from, "to": to }),
    );

    let result = async {
        ctx.checkpoint()?;
        ctx.progress.update(MIGRATING_PERCENT, "Rewriting URLs");
        let path = db_path.to_path_buf();
        let (from, to) = (from.to_string(), to.to_string());
        let job_ctx = ctx.clone();
        tokio::task::spawn_blocking(move || migrate_file(&path, &from, &to, &job_ctx)).await?
    }
    .await;

    match result {
        Ok(summary) => {
            ctx.progress.update(100, "Complete");
            ctx.log.info(
                "migrate_finished",
                json!({ "job_id": job_id, "values_updated": summary.values_updated }),
            );
            Ok(summary)
        }
        Err(e) => {
            ctx.report_failure("migrate_failed", &e);
            Err(e)
        }
    }
}

fn user_tables(conn: &Connection) -> Result<Vec<Table>> {
    let mut stmt = conn.prepare(
        "SELECT name, sql FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND sql IS NOT NULL
         ORDER BY name",
    )?;
    let rows = stmt.query_map([], |row| {
        let name: String = row.get(0)?;
        let sql: String = row.get(1)?;
        Ok((name, sql.to_ascii_uppercase()))
    })?;

    let mut tables = Vec::new();
    for row in rows {
        let (name, sql) = row?;
        if sql.starts_with("CREATE VIRTUAL TABLE") {
            continue;
        }
        tables.push(Table {
            name,
            without_rowid: sql.contains("WITHOUT ROWID"),
        });
    }
    Ok(tables)
}

fn text_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let rows = stmt.query_map([], |row| {
        let name: String = row.get(1)?;
        let decl: String = row.get(2)?;
        Ok((name, decl))
    })?;

    let mut columns = Vec::new();
    for row in rows {
        let (name, decl) = row?;
        if is_text_bearing(&decl) {
            columns.push(name);
        }
    }
    Ok(columns)
}

/// Untyped columns can hold anything, so they count.
pub fn is_text_bearing(declared: &str) -> bool {
    let upper = declared.trim().to_ascii_uppercase();
    upper.is_empty() || TEXT_TYPES.iter().any(|t| upper.contains(t))
}

fn replace_column(
    conn: &Connection,
    table: &Table,
    column: &str,
    from: &[u8],
    to: &[u8],
    summary: &mut MigrationSummary,
) -> Result<()> {
    let t = quote_ident(&table.name);
    let c = quote_ident(column);
    let select = if table.without_rowid {
        format!("SELECT NULL, {c} FROM {t} WHERE typeof({c}) IN ('text', 'blob')")
    } else {
        format!("SELECT rowid, {c} FROM {t} WHERE typeof({c}) IN ('text', 'blob')")
    };

    let mut updates: Vec<(RowKey, Value)> = Vec::new();
    {
        let mut stmt = conn.prepare(&select)?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            summary.values_scanned += 1;
            let new_value = match row.get_ref(1)? {
                ValueRef::Text(bytes) => replace_in(bytes, from, to)
                    .and_then(|new| String::from_utf8(new).ok())
                    .map(Value::Text),
                ValueRef::Blob(bytes) if std::str::from_utf8(bytes).is_ok() => {
                    replace_in(bytes, from, to).map(Value::Blob)
                }
                _ => None,
            };
            let Some(new_value) = new_value else {
                continue;
            };

            let key = if table.without_rowid {
                RowKey::Original(row.get::<_, Value>(1)?)
            } else {
                RowKey::RowId(row.get(0)?)
            };
            updates.push((key, new_value));
        }
    }

    for (key, value) in updates {
        match key {
            RowKey::RowId(rowid) => {
                conn.execute(
                    &format!("UPDATE {t} SET {c} = ?1 WHERE rowid = ?2"),
                    params![value, rowid],
                )?;
            }
            RowKey::Original(original) => {
                conn.execute(
                    &format!("UPDATE {t} SET {c} = ?1 WHERE {c} = ?2"),
                    params![value, original],
                )?;
            }
        }
        summary.values_updated += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE options (id INTEGER PRIMARY KEY, name TEXT, value TEXT, hits INTEGER);
            CREATE TABLE meta (k TEXT PRIMARY KEY, v) WITHOUT ROWID;
            INSERT INTO options (name, value, hits) VALUES
                ('siteurl', 'http://old.test', 1),
                ('widgets', 'a:1:{s:3:"url";s:15:"http://old.test";}', 2),
                ('other', 'nothing here', 3);
            INSERT INTO meta VALUES ('home', 'http://old.test/home');
            "#,
        )
        .unwrap();
        conn
    }

    fn value(conn: &Connection, name: &str) -> String {
        conn.query_row("SELECT value FROM options WHERE name = ?1", [name], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_text_bearing_types() {
        assert!(is_text_bearing("TEXT"));
        assert!(is_text_bearing("varchar(255)"));
        assert!(is_text_bearing("LONGBLOB"));
        assert!(is_text_bearing(""));
        assert!(!is_text_bearing("INTEGER"));
        assert!(!is_text_bearing("REAL"));
    }

    #[test]
    fn test_replaces_plain_and_serialized_values() {
        let mut conn = setup();
        let summary =
            search_replace(&mut conn, "http://old.test", "https://new.test", &JobContext::detached())
                .unwrap();

        assert_eq!(value(&conn, "siteurl"), "https://new.test");
        assert_eq!(
            value(&conn, "widgets"),
            r#"a:1:{s:3:"url";s:16:"https://new.test";}"#
        );
        assert_eq!(value(&conn, "other"), "nothing here");
        assert_eq!(summary.values_updated, 3);

        let home: String = conn
            .query_row("SELECT v FROM meta WHERE k = 'home'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(home, "https://new.test/home");
    }

    #[test]
    fn test_empty_search_is_rejected() {
        let mut conn = setup();
        assert!(matches!(
            search_replace(&mut conn, "", "x", &JobContext::detached()),
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_run_job_reports_progress() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = dir.path().join("site.db");
        let conn = Connection::open(&db).unwrap();
        conn.execute_batch("CREATE TABLE options (name TEXT, value TEXT);
             INSERT INTO options VALUES ('home', 'http://old.test');")
            .unwrap();
        drop(conn);

        let ctx = JobContext::detached();
        let summary = run_job(&db, "http://old.test", "http://new.test", &ctx)
            .await
            .unwrap();
        assert_eq!(summary.values_updated, 1);
        assert_eq!(ctx.progress.current().stage, "Complete");

        let missing = dir.path().join("missing.db");
        let err = run_job(&missing, "a", "b", &ctx).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(ctx.progress.current().stage, "Failed");
    }
}
