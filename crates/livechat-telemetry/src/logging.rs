use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS logs (
     id INTEGER PRIMARY KEY AUTOINCREMENT,
     timestamp TEXT NOT NULL,
     level TEXT NOT NULL,
     target TEXT NOT NULL,
     message TEXT NOT NULL,
     fields TEXT,
     mount_id TEXT,
     subsystem TEXT
 );
 CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
 CREATE INDEX IF NOT EXISTS idx_logs_mount ON logs(mount_id);
 CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);";

/// A log record persisted to SQLite.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub mount_id: Option<String>,
    pub subsystem: Option<String>,
}

/// Filter for reading persisted logs back. Unset fields match everything.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub mount_id: Option<String>,
    pub limit: Option<u32>,
}

/// SQLite sink that persists warn+ logs, so init failures stay observable after
/// the widget has gone inert.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, record: &LogInsert) {
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, mount_id, subsystem)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                record.timestamp,
                record.level,
                record.target,
                record.message,
                record.fields,
                record.mount_id,
                record.subsystem,
            ],
        );
    }

    /// Newest records first, 100 unless `limit` says otherwise.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, timestamp, level, target, message, fields, mount_id, subsystem FROM logs
             WHERE (?1 IS NULL OR level = ?1) AND (?2 IS NULL OR mount_id = ?2)
             ORDER BY id DESC LIMIT ?3",
        )?;
        let level = q.level.as_deref().map(str::to_uppercase);
        let limit = q.limit.unwrap_or(100);
        let rows = stmt.query_map(rusqlite::params![level, q.mount_id, limit], |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                mount_id: row.get(6)?,
                subsystem: row.get(7)?,
            })
        })?;
        rows.collect()
    }

    /// Everything persisted for one mount, newest first.
    pub fn for_mount(&self, mount_id: &str) -> Result<Vec<LogRecord>, rusqlite::Error> {
        self.query(&LogQuery {
            mount_id: Some(mount_id.to_string()),
            ..LogQuery::default()
        })
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

struct LogInsert {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    mount_id: Option<String>,
    subsystem: Option<String>,
}

/// tracing Layer that writes warn+ events to SQLite.
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

/// Correlation fields an event carries itself or picks up from its spans.
#[derive(Clone, Default)]
struct Scope {
    mount_id: Option<String>,
    subsystem: Option<String>,
}

impl Scope {
    fn is_empty(&self) -> bool {
        self.mount_id.is_none() && self.subsystem.is_none()
    }

    fn is_complete(&self) -> bool {
        self.mount_id.is_some() && self.subsystem.is_some()
    }

    /// Fill whatever is still missing from an outer span. Inner values win.
    fn inherit(&mut self, outer: &Scope) {
        if self.mount_id.is_none() {
            self.mount_id.clone_from(&outer.mount_id);
        }
        if self.subsystem.is_none() {
            self.subsystem.clone_from(&outer.subsystem);
        }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    scope: Scope,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl FieldVisitor {
    fn put(&mut self, name: &str, value: serde_json::Value) {
        let _ = self.fields.insert(name.to_string(), value);
    }

    fn put_str(&mut self, name: &str, value: String) {
        match name {
            "message" => self.message = Some(value),
            "mount_id" => self.scope.mount_id = Some(value),
            "subsystem" => self.scope.subsystem = Some(value),
            other => self.put(other, serde_json::Value::String(value)),
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let text = format!("{value:?}");
        let text = match field.name() {
            // Display-less ids arrive quoted.
            "mount_id" | "subsystem" => text.trim_matches('"').to_string(),
            _ => text,
        };
        self.put_str(field.name(), text);
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put_str(field.name(), value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field.name(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field.name(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field.name(), value.into());
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        if let Some(spans) = ctx.event_scope(event) {
            for span in spans {
                if visitor.scope.is_complete() {
                    break;
                }
                if let Some(outer) = span.extensions().get::<Scope>() {
                    visitor.scope.inherit(outer);
                }
            }
        }

        let fields = (!visitor.fields.is_empty())
            .then(|| serde_json::to_string(&visitor.fields).ok())
            .flatten();

        self.sink.insert(&LogInsert {
            timestamp: Utc::now().to_rfc3339(),
            level: meta.level().as_str().to_string(),
            target: meta.target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
            mount_id: visitor.scope.mount_id,
            subsystem: visitor.scope.subsystem,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);
        if visitor.scope.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(visitor.scope);
        }
    }
}
