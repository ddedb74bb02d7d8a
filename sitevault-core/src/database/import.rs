//! Streams a SQL dump back into a database, one statement at a time.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::status::{JobContext, PhaseRange};
use crate::utils::Result;

pub const RESTORING_DB: PhaseRange = PhaseRange::new(45, 55);
const STAGE: &str = "Restoring Database";
const STATEMENT_PREVIEW: usize = 200;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportMode {
    /// Failed statements are logged and skipped.
    #[default]
    BestEffort,
    /// One transaction; the first failure rolls everything back.
    Transactional,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub executed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Normal,
    SingleQuote,
    DoubleQuote,
    Backtick,
    Bracket,
    LineComment,
    BlockComment,
}

/// Incremental statement splitter.
///
/// Semicolons inside quotes, identifiers and comments are ignored, and so
/// are the ones inside a trigger's `BEGIN ... END` body.
#[derive(Debug)]
pub struct StatementSplitter {
    state: State,
    current: String,
    word: String,
    head: Vec<String>,
    depth: u32,
    has_content: bool,
    prev: char,
}

impl Default for StatementSplitter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatementSplitter {
    pub fn new() -> Self {
        Self {
            state: State::Normal,
            current: String::new(),
            word: String::new(),
            head: Vec::new(),
            depth: 0,
            has_content: false,
            prev: '\0',
        }
    }

    /// Feed more text; returns the statements it completed.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        let mut done = Vec::new();
        for ch in text.chars() {
            self.current.push(ch);
            let prev = std::mem::replace(&mut self.prev, ch);

            match self.state {
                State::Normal => {
                    if ch.is_alphanumeric() || ch == '_' {
                        self.word.push(ch);
                        self.has_content = true;
                        continue;
                    }
                    self.end_word();
                    match ch {
                        '\'' => self.state = State::SingleQuote,
                        '"' => self.state = State::DoubleQuote,
                        '`' => self.state = State::Backtick,
                        '[' => self.state = State::Bracket,
                        '-' if prev == '-' => {
                            self.state = State::LineComment;
                        }
                        '*' if prev == '/' => {
                            self.state = State::BlockComment;
                            self.prev = '\0';
                        }
                        ';' if self.depth == 0 => {
                            if let Some(stmt) = self.take() {
                                done.push(stmt);
                            }
                        }
                        _ => {}
                    }
                }
                State::SingleQuote => {
                    if ch == '\'' {
                        self.state = State::Normal;
                    }
                }
                State::DoubleQuote => {
                    if ch == '"' {
                        self.state = State::Normal;
                    }
                }
                State::Backtick => {
                    if ch == '`' {
                        self.state = State::Normal;
                    }
                }
                State::Bracket => {
                    if ch == ']' {
                        self.state = State::Normal;
                    }
                }
                State::LineComment => {
                    if ch == '\n' {
                        self.state = State::Normal;
                    }
                }
                State::BlockComment => {
                    if ch == '/' && prev == '*' {
                        self.state = State::Normal;
                        self.prev = '\0';
                    }
                }
            }
        }
        done
    }

    /// Whatever is left once input ends, if it holds SQL.
    pub fn finish(mut self) -> Option<String> {
        self.end_word();
        self.take()
    }

    fn end_word(&mut self) {
        if self.word.is_empty() {
            return;
        }
        let word = std::mem::take(&mut self.word).to_ascii_uppercase();
        if self.is_trigger() {
            match word.as_str() {
                "BEGIN" | "CASE" => self.depth += 1,
                "END" => self.depth = self.depth.saturating_sub(1),
                _ => {}
            }
        }
        if self.head.len() < 3 {
            self.head.push(word);
        }
    }

    fn is_trigger(&self) -> bool {
        self.head.first().map(String::as_str) == Some("CREATE")
            && self.head.iter().skip(1).any(|w| w == "TRIGGER")
    }

    fn take(&mut self) -> Option<String> {
        let stmt = std::mem::take(&mut self.current);
        let had_content = std::mem::replace(&mut self.has_content, false);
        self.head.clear();
        self.depth = 0;
        self.word.clear();
        let trimmed = stmt.trim();
        if had_content && !trimmed.is_empty() {
            Some(trimmed.to_string())
        } else {
            None
        }
    }
}

/// Import `sql_path` into `conn`, reporting progress by bytes read.
pub fn import_file(
    conn: &mut Connection,
    sql_path: &Path,
    mode: ImportMode,
    ctx: &JobContext,
) -> Result<ImportSummary> {
    let file = File::open(sql_path)?;
    let total = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    ctx.log.info(
        "db_import_started",
        json!({ "file": sql_path.display().to_string(), "bytes": total, "mode": mode }),
    );

    let summary = match mode {
        ImportMode::BestEffort => run_statements(conn, &mut reader, total, mode, ctx)?,
        ImportMode::Transactional => {
            let tx = conn.transaction()?;
            let summary = run_statements(&tx, &mut reader, total, mode, ctx)?;
            tx.commit()?;
            summary
        }
    };

    ctx.progress.update(RESTORING_DB.end, STAGE);
    ctx.log.info(
        "db_import_finished",
        json!({ "executed": summary.executed, "failed": summary.failed }),
    );
    Ok(summary)
}

fn run_statements(
    conn: &Connection,
    reader: &mut impl BufRead,
    total: u64,
    mode: ImportMode,
    ctx: &JobContext,
) -> Result<ImportSummary> {
    let mut splitter = StatementSplitter::new();
    let mut summary = ImportSummary::default();
    let mut consumed = 0u64;
    let mut line = String::new();
    let mut last_percent = None;

    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            break;
        }
        consumed += n as u64;
        for stmt in splitter.push(&line) {
            execute(conn, &stmt, mode, &mut summary, ctx)?;
        }

        let percent = RESTORING_DB.at(consumed, total);
        if last_percent != Some(percent) {
            last_percent = Some(percent);
            ctx.progress.update(percent, STAGE);
        }
    }

    if let Some(stmt) = splitter.finish() {
        execute(conn, &stmt, mode, &mut summary, ctx)?;
    }
    Ok(summary)
}

fn execute(
    conn: &Connection,
    stmt: &str,
    mode: ImportMode,
    summary: &mut ImportSummary,
    ctx: &JobContext,
) -> Result<()> {
    match conn.execute_batch(stmt) {
        Ok(()) => {
            summary.executed += 1;
            Ok(())
        }
        Err(e) => {
            let preview: String = stmt.chars().take(STATEMENT_PREVIEW).collect();
            ctx.log.warn(
                "sql_statement_failed",
                json!({ "error": e.to_string(), "statement": preview }),
            );
            summary.failed += 1;
            match mode {
                ImportMode::BestEffort => Ok(()),
                ImportMode::Transactional => Err(e.into()),
            }
        }
    }
}
