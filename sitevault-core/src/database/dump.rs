//! Plain-SQL dump of the application database.
//!
//! Layout: header pragmas, then per table `DROP TABLE IF EXISTS`, the
//! original `CREATE` statement and one `INSERT` per row, then the
//! AUTOINCREMENT counters, then indexes, views and triggers once all data
//! is in place.

use chrono::Utc;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde_json::json;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::status::{JobContext, PhaseRange};
use crate::utils::Result;

pub const DUMPING: PhaseRange = PhaseRange::new(20, 35);
const STAGE: &str = "Dumping Database";

#[derive(Debug, Clone)]
pub struct DumpSummary {
    pub path: PathBuf,
    pub tables: u64,
    pub rows: u64,
    pub bytes: u64,
}

struct SchemaObject {
    kind: String,
    name: String,
    sql: String,
}

/// Dump the database at `db_path` without modifying it.
pub fn dump_file(db_path: &Path, output: &Path, ctx: &JobContext) -> Result<DumpSummary> {
    let conn = super::open_read_only(db_path)?;
    dump_database(&conn, output, ctx)
}

pub fn dump_database(conn: &Connection, output: &Path, ctx: &JobContext) -> Result<DumpSummary> {
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = BufWriter::new(File::create(output)?);

    let tables = schema_objects(
        conn,
        "SELECT type, name, sql FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND sql IS NOT NULL
         ORDER BY name",
    )?;
    let others = schema_objects(
        conn,
        "SELECT type, name, sql FROM sqlite_master
         WHERE type IN ('index', 'view', 'trigger') AND sql IS NOT NULL
         ORDER BY CASE type WHEN 'index' THEN 0 WHEN 'view' THEN 1 ELSE 2 END, name",
    )?;

    ctx.log
        .info("db_dump_started", json!({ "tables": tables.len(), "output": output.display().to_string() }));

    writeln!(out, "-- sitevault database dump")?;
    writeln!(out, "-- generated {}", Utc::now().to_rfc3339())?;
    writeln!(out, "PRAGMA foreign_keys=OFF;")?;

    let total = tables.len() as u64;
    let mut rows = 0u64;
    for (i, table) in tables.iter().enumerate() {
        rows += dump_table(conn, table, &mut out)?;
        ctx.progress.update(DUMPING.at(i as u64 + 1, total), STAGE);
    }

    dump_sequences(conn, &mut out)?;

    for object in &others {
        writeln!(out)?;
        writeln!(
            out,
            "DROP {} IF EXISTS {};",
            object.kind.to_ascii_uppercase(),
            quote_ident(&object.name)
        )?;
        writeln!(out, "{};", object.sql.trim_end_matches(';'))?;
    }

    writeln!(out)?;
    writeln!(out, "PRAGMA foreign_keys=ON;")?;
    out.flush()?;
    drop(out);

    let bytes = fs::metadata(output)?.len();
    ctx.progress.update(DUMPING.end, STAGE);
    ctx.log.info(
        "db_dump_finished",
        json!({ "tables": total, "rows": rows, "bytes": bytes }),
    );

    Ok(DumpSummary {
        path: output.to_path_buf(),
        tables: total,
        rows,
        bytes,
    })
}

fn schema_objects(conn: &Connection, sql: &str) -> Result<Vec<SchemaObject>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| {
        Ok(SchemaObject {
            kind: row.get(0)?,
            name: row.get(1)?,
            sql: row.get(2)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn dump_table(conn: &Connection, table: &SchemaObject, out: &mut impl Write) -> Result<u64> {
    let name = quote_ident(&table.name);
    writeln!(out)?;
    writeln!(out, "-- table {}", table.name)?;
    writeln!(out, "DROP TABLE IF EXISTS {name};")?;
    writeln!(out, "{};", table.sql.trim_end_matches(';'))?;

    if table.sql.to_ascii_uppercase().starts_with("CREATE VIRTUAL TABLE") {
        return Ok(0);
    }

    let mut stmt = conn.prepare(&format!("SELECT * FROM {name}"))?;
    let columns = stmt.column_count();
    let mut rows = stmt.query([])?;
    let mut count = 0u64;
    let mut line = String::new();

    while let Some(row) = rows.next()? {
        line.clear();
        line.push_str("INSERT INTO ");
        line.push_str(&name);
        line.push_str(" VALUES(");
        for i in 0..columns {
            if i > 0 {
                line.push(',');
            }
            push_literal(&mut line, row.get_ref(i)?);
        }
        line.push_str(");");
        writeln!(out, "{line}")?;
        count += 1;
    }

    Ok(count)
}

/// Counters can run ahead of the highest stored id, so they are restored
/// as they were rather than recomputed from the data.
fn dump_sequences(conn: &Connection, out: &mut impl Write) -> Result<()> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'sqlite_sequence')",
        [],
        |row| row.get(0),
    )?;
    if !exists {
        return Ok(());
    }

    let mut stmt = conn.prepare("SELECT name, seq FROM sqlite_sequence ORDER BY name")?;
    let counters = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    if counters.is_empty() {
        return Ok(());
    }

    writeln!(out)?;
    writeln!(out, "DELETE FROM sqlite_sequence;")?;
    for (name, seq) in counters {
        let mut line = String::from("INSERT INTO sqlite_sequence VALUES(");
        push_literal(&mut line, ValueRef::Text(name.as_bytes()));
        line.push_str(&format!(",{seq});"));
        writeln!(out, "{line}")?;
    }
    Ok(())
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Append `value` as a SQLite literal.
pub fn push_literal(buf: &mut String, value: ValueRef<'_>) {
    match value {
        ValueRef::Null => buf.push_str("NULL"),
        ValueRef::Integer(i) => buf.push_str(&i.to_string()),
        ValueRef::Real(f) => {
            if f.is_nan() {
                buf.push_str("NULL");
            } else if f.is_infinite() {
                buf.push_str(if f > 0.0 { "9e999" } else { "-9e999" });
            } else {
                // Debug keeps a decimal point or exponent so SQLite reads a REAL back
                buf.push_str(&format!("{f:?}"));
            }
        }
        ValueRef::Text(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => {
                buf.push('\'');
                buf.push_str(&text.replace('\'', "''"));
                buf.push('\'');
            }
            // keep the exact bytes; the column still reads back as TEXT
            Err(_) => {
                buf.push_str("CAST(");
                push_hex(buf, bytes);
                buf.push_str(" AS TEXT)");
            }
        },
        ValueRef::Blob(bytes) => push_hex(buf, bytes),
    }
}

fn push_hex(buf: &mut String, bytes: &[u8]) {
    buf.push_str("X'");
    for b in bytes {
        buf.push_str(&format!("{b:02X}"));
    }
    buf.push('\'');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{import_file, ImportMode};
    use tempfile::TempDir;

    fn literal(value: ValueRef<'_>) -> String {
        let mut s = String::new();
        push_literal(&mut s, value);
        s
    }

    #[test]
    fn test_literal_escaping() {
        assert_eq!(literal(ValueRef::Null), "NULL");
        assert_eq!(literal(ValueRef::Integer(-7)), "-7");
        assert_eq!(literal(ValueRef::Real(1.0)), "1.0");
        assert_eq!(literal(ValueRef::Real(f64::INFINITY)), "9e999");
        assert_eq!(literal(ValueRef::Text(b"it's")), "'it''s'");
        assert_eq!(literal(ValueRef::Blob(&[0x00, 0xab])), "X'00AB'");
        assert_eq!(
            literal(ValueRef::Text(&[b'a', 0xff, b'\''])),
            "CAST(X'61FF27' AS TEXT)"
        );
    }

    #[test]
    fn test_invalid_utf8_text_and_counters_survive_reimport() {
        let dir = TempDir::new().unwrap();
        let source = Connection::open_in_memory().unwrap();
        source
            .execute_batch(
                "CREATE TABLE posts (id INTEGER PRIMARY KEY AUTOINCREMENT, body TEXT);
                 INSERT INTO posts (body) VALUES ('one'), ('two'), ('three');
                 DELETE FROM posts WHERE id = 3;",
            )
            .unwrap();
        let latin1: &[u8] = &[b'h', 0xe9, b'!'];
        source
            .execute("UPDATE posts SET body = CAST(?1 AS TEXT) WHERE id = 2", [latin1])
            .unwrap();

        let out = dir.path().join("dump.sql");
        let ctx = JobContext::detached();
        dump_database(&source, &out, &ctx).unwrap();
        let sql = fs::read_to_string(&out).unwrap();
        assert!(sql.contains("DELETE FROM sqlite_sequence;"));
        assert!(sql.contains("INSERT INTO sqlite_sequence VALUES('posts',3);"));

        let mut restored = Connection::open_in_memory().unwrap();
        let summary = import_file(&mut restored, &out, ImportMode::Transactional, &ctx).unwrap();
        assert_eq!(summary.failed, 0);

        let (kind, bytes): (String, Vec<u8>) = restored
            .query_row("SELECT typeof(body), CAST(body AS BLOB) FROM posts WHERE id = 2", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(kind, "text");
        assert_eq!(bytes, vec![b'h', 0xe9, b'!']);

        restored.execute("INSERT INTO posts (body) VALUES ('four')", []).unwrap();
        assert_eq!(restored.last_insert_rowid(), 4);
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("posts"), "\"posts\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_dump_orders_schema_objects_after_data() {
        let dir = TempDir::new().unwrap();
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE posts (id INTEGER PRIMARY KEY, title TEXT);
             CREATE INDEX idx_title ON posts(title);
             CREATE VIEW titles AS SELECT title FROM posts;
             INSERT INTO posts (title) VALUES ('hello'), ('o''clock');",
        )
        .unwrap();

        let out = dir.path().join("dump.sql");
        let ctx = JobContext::detached();
        let summary = dump_database(&conn, &out, &ctx).unwrap();
        assert_eq!(summary.tables, 1);
        assert_eq!(summary.rows, 2);
        assert_eq!(ctx.progress.current().percent, DUMPING.end);

        let sql = fs::read_to_string(&out).unwrap();
        let insert = sql.find("INSERT INTO \"posts\"").unwrap();
        let index = sql.find("CREATE INDEX idx_title").unwrap();
        assert!(insert < index);
        assert!(sql.contains("'o''clock'"));
        assert!(sql.trim_end().ends_with("PRAGMA foreign_keys=ON;"));
    }
}
