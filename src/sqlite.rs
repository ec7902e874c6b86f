use std::collections::HashMap;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection, OpenFlags};
use tracing::debug;

use crate::error::{BootstrapError, BootstrapResult};

/// First 16 bytes of every SQLite 3 database file.
const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Upper bound on delete passes when triggers keep re-inserting rows.
const MAX_CLEAR_PASSES: usize = 8;

/// Tables and virtual tables in `main`, excluding internal and shadow tables.
const USER_TABLES_SQL: &str = "SELECT name FROM pragma_table_list \
     WHERE schema = 'main' AND type IN ('table', 'virtual') \
     AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\' ORDER BY name";

/// Core value types for SQLite operations
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl From<ValueRef<'_>> for Value {
    fn from(v: ValueRef<'_>) -> Self {
        match v {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(r) => Value::Real(r),
            ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let value = match self {
            Value::Null => ValueRef::Null,
            Value::Integer(i) => ValueRef::Integer(*i),
            Value::Real(r) => ValueRef::Real(*r),
            Value::Text(t) => ValueRef::Text(t.as_bytes()),
            Value::Blob(b) => ValueRef::Blob(b),
        };
        Ok(ToSqlOutput::Borrowed(value))
    }
}

/// One result row, keyed by column name.
pub type Row = HashMap<String, Value>;

/// Outcome of clearing every user table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClearSummary {
    /// Tables that were emptied, in name order.
    pub tables: Vec<String>,
    /// Total rows removed across those tables.
    pub rows_deleted: usize,
}

/// Opens database files. Implementations never create a missing file.
pub trait DatabaseEngine {
    type Handle: DatabaseHandle;

    /// Open the existing database at `path`.
    fn open(&self, path: &Path) -> BootstrapResult<Self::Handle>;

    /// Check, without writing, that `path` holds a usable database.
    fn validate(&self, path: &Path) -> BootstrapResult<()>;
}

/// An open connection to a database file, owned by the caller.
pub trait DatabaseHandle {
    /// Run one statement and return the number of changed rows.
    fn execute(&self, sql: &str, params: &[Value]) -> BootstrapResult<usize>;

    fn query(&self, sql: &str, params: &[Value]) -> BootstrapResult<Vec<Row>>;

    /// Names of user tables, sorted.
    fn table_names(&self) -> BootstrapResult<Vec<String>>;

    /// Delete every row from every user table, keeping the schema.
    fn clear_all_rows(&mut self) -> BootstrapResult<ClearSummary>;

    fn close(self) -> BootstrapResult<()>
    where
        Self: Sized;
}

/// [`DatabaseEngine`] backed by the bundled SQLite library.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteEngine;

impl SqliteEngine {
    /// Immutable read-only open: SQLite creates no `-wal`/`-shm` siblings.
    fn read_only(path: &Path) -> rusqlite::Result<Connection> {
        let uri =
            immutable_uri(path).map_err(|_| rusqlite::Error::InvalidPath(path.to_path_buf()))?;
        Connection::open_with_flags(
            uri,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
    }

    fn read_write(path: &Path) -> rusqlite::Result<Connection> {
        // No SQLITE_OPEN_CREATE: a missing file must fail, not appear empty.
        Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
    }
}

impl DatabaseEngine for SqliteEngine {
    type Handle = SqliteHandle;

    fn open(&self, path: &Path) -> BootstrapResult<SqliteHandle> {
        let open_failure = |reason: String| BootstrapError::OpenFailure {
            path: path.to_path_buf(),
            reason,
        };

        if !path.is_file() {
            return Err(open_failure("database file does not exist".to_string()));
        }
        check_header(path).map_err(open_failure)?;

        let conn = Self::read_write(path).map_err(|e| open_failure(e.to_string()))?;
        schema_object_count(&conn).map_err(|e| open_failure(e.to_string()))?;

        debug!(path = %path.display(), "opened database handle");
        Ok(SqliteHandle {
            conn,
            path: path.to_path_buf(),
        })
    }

    fn validate(&self, path: &Path) -> BootstrapResult<()> {
        let invalid = |reason: String| BootstrapError::InvalidDatabaseFile {
            path: path.to_path_buf(),
            reason,
        };

        check_header(path).map_err(invalid)?;
        let conn = Self::read_only(path).map_err(|e| invalid(e.to_string()))?;
        let objects = schema_object_count(&conn).map_err(|e| invalid(e.to_string()))?;

        debug!(path = %path.display(), objects, "database file is valid");
        Ok(())
    }
}

/// Open SQLite connection returned by [`SqliteEngine::open`].
pub struct SqliteHandle {
    conn: Connection,
    path: PathBuf,
}

impl SqliteHandle {
    /// The underlying `rusqlite` connection, for anything beyond this trait.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DatabaseHandle for SqliteHandle {
    fn execute(&self, sql: &str, params: &[Value]) -> BootstrapResult<usize> {
        Ok(self.conn.execute(sql, params_from_iter(params.iter()))?)
    }

    fn query(&self, sql: &str, params: &[Value]) -> BootstrapResult<Vec<Row>> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            let mut map = Row::with_capacity(columns.len());
            for (idx, name) in columns.iter().enumerate() {
                map.insert(name.clone(), Value::from(row.get_ref(idx)?));
            }
            result.push(map);
        }
        Ok(result)
    }

    fn table_names(&self) -> BootstrapResult<Vec<String>> {
        Ok(user_tables(&self.conn)?)
    }

    fn clear_all_rows(&mut self) -> BootstrapResult<ClearSummary> {
        let tx = self.conn.transaction()?;
        // Constraints are checked once at commit, so delete order is irrelevant.
        tx.pragma_update(None, "defer_foreign_keys", "ON")?;

        let tables = user_tables(&tx)?;
        let mut rows_deleted = 0;
        let mut passes = 0;
        // Delete triggers may refill tables that were already emptied.
        loop {
            for table in &tables {
                rows_deleted +=
                    tx.execute(&format!("DELETE FROM {}", quote_identifier(table)), [])?;
            }
            passes += 1;

            let refilled = non_empty_tables(&tx, &tables)?;
            if refilled.is_empty() {
                break;
            }
            if passes == MAX_CLEAR_PASSES {
                // Dropping `tx` rolls back every pass.
                return Err(BootstrapError::DeleteFailure {
                    path: self.path.clone(),
                    reason: format!(
                        "tables still hold rows after {passes} passes: {}",
                        refilled.join(", ")
                    ),
                });
            }
            debug!(path = %self.path.display(), ?refilled, "clearing again after triggers");
        }

        let has_sequence: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'sqlite_sequence')",
            [],
            |row| row.get(0),
        )?;
        if has_sequence {
            tx.execute("DELETE FROM sqlite_sequence", [])?;
        }

        tx.commit()?;
        Ok(ClearSummary {
            tables,
            rows_deleted,
        })
    }

    fn close(self) -> BootstrapResult<()> {
        self.conn.close().map_err(|(_, err)| BootstrapError::Sqlite(err))
    }
}

fn user_tables(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(USER_TABLES_SQL)?;
    let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
    names.collect()
}

fn non_empty_tables(conn: &Connection, tables: &[String]) -> rusqlite::Result<Vec<String>> {
    let mut non_empty = Vec::new();
    for table in tables {
        let has_rows: bool = conn.query_row(
            &format!("SELECT EXISTS(SELECT 1 FROM {})", quote_identifier(table)),
            [],
            |row| row.get(0),
        )?;
        if has_rows {
            non_empty.push(table.clone());
        }
    }
    Ok(non_empty)
}

/// `file:` URI opening `path` with `immutable=1`.
fn immutable_uri(path: &Path) -> std::io::Result<String> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let raw = absolute.to_string_lossy().replace('\\', "/");

    let mut uri = String::from("file:");
    if !raw.starts_with('/') {
        // Windows drive letter.
        uri.push('/');
    }
    for ch in raw.chars() {
        match ch {
            '%' => uri.push_str("%25"),
            '?' => uri.push_str("%3f"),
            '#' => uri.push_str("%23"),
            c => uri.push(c),
        }
    }
    uri.push_str("?immutable=1");
    Ok(uri)
}

fn schema_object_count(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get(0))
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Reject files that are empty or lack the SQLite magic header.
fn check_header(path: &Path) -> Result<(), String> {
    let mut file = File::open(path).map_err(|e| e.to_string())?;
    let mut header = [0u8; 16];
    match file.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
            return Err("file is too short to be a SQLite database".to_string())
        }
        Err(e) => return Err(e.to_string()),
    }
    if &header != SQLITE_MAGIC {
        return Err("missing SQLite header".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seeded(dir: &TempDir, name: &str, sql: &str) -> PathBuf {
        let path = dir.path().join(name);
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(sql).unwrap();
        path
    }

    #[test]
    fn quote_identifier_escapes_quotes() {
        assert_eq!(quote_identifier("users"), "\"users\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn header_check_rejects_empty_and_foreign_files() {
        let dir = TempDir::new().unwrap();
        let empty = dir.path().join("empty.db");
        std::fs::write(&empty, b"").unwrap();
        assert!(check_header(&empty).is_err());

        let text = dir.path().join("notes.db");
        std::fs::write(&text, b"this is definitely not a database file").unwrap();
        assert_eq!(check_header(&text).unwrap_err(), "missing SQLite header");

        let real = seeded(&dir, "real.db", "CREATE TABLE t (x INTEGER);");
        assert!(check_header(&real).is_ok());
    }

    #[test]
    fn validate_reports_invalid_files() {
        let dir = TempDir::new().unwrap();
        let bogus = dir.path().join("bogus.db");
        std::fs::write(&bogus, vec![0xAB; 4096]).unwrap();

        let err = SqliteEngine.validate(&bogus).unwrap_err();
        assert!(matches!(err, BootstrapError::InvalidDatabaseFile { .. }));
    }

    #[test]
    fn open_does_not_create_missing_files() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.db");

        let err = SqliteEngine.open(&missing).err().unwrap();
        assert!(matches!(err, BootstrapError::OpenFailure { .. }));
        assert!(!missing.exists());
    }

    #[test]
    fn query_maps_columns_to_values() {
        let dir = TempDir::new().unwrap();
        let path = seeded(
            &dir,
            "values.db",
            "CREATE TABLE things (id INTEGER PRIMARY KEY, label TEXT, weight REAL, data BLOB);",
        );
        let handle = SqliteEngine.open(&path).unwrap();

        handle
            .execute(
                "INSERT INTO things (label, weight, data) VALUES (?1, ?2, ?3)",
                &[
                    Value::from("widget"),
                    Value::from(2.5),
                    Value::from(vec![1u8, 2, 3]),
                ],
            )
            .unwrap();
        handle
            .execute(
                "INSERT INTO things (label, weight, data) VALUES (?1, ?2, ?3)",
                &[Value::from(None::<String>), Value::Null, Value::Null],
            )
            .unwrap();

        let rows = handle
            .query("SELECT id, label, weight, data FROM things ORDER BY id", &[])
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], Value::Integer(1));
        assert_eq!(rows[0]["label"], Value::Text("widget".into()));
        assert_eq!(rows[0]["weight"], Value::Real(2.5));
        assert_eq!(rows[0]["data"], Value::Blob(vec![1, 2, 3]));
        assert_eq!(rows[1]["label"], Value::Null);

        handle.close().unwrap();
    }

    #[test]
    fn clear_skips_internal_tables_and_resets_autoincrement() {
        let dir = TempDir::new().unwrap();
        let path = seeded(
            &dir,
            "seq.db",
            "CREATE TABLE log (id INTEGER PRIMARY KEY AUTOINCREMENT, msg TEXT);
             INSERT INTO log (msg) VALUES ('a'), ('b'), ('c');",
        );
        let mut handle = SqliteEngine.open(&path).unwrap();

        let summary = handle.clear_all_rows().unwrap();
        assert_eq!(summary.tables, vec!["log".to_string()]);
        assert_eq!(summary.rows_deleted, 3);

        handle
            .execute("INSERT INTO log (msg) VALUES (?1)", &[Value::from("again")])
            .unwrap();
        let id: i64 = handle
            .connection()
            .query_row("SELECT id FROM log", [], |row| row.get(0))
            .unwrap();
        assert_eq!(id, 1);
    }

    #[test]
    fn clear_respects_foreign_keys_in_any_order() {
        let dir = TempDir::new().unwrap();
        let path = seeded(
            &dir,
            "fk.db",
            "CREATE TABLE a_parent (id INTEGER PRIMARY KEY);
             CREATE TABLE z_child (id INTEGER PRIMARY KEY, parent_id INTEGER NOT NULL REFERENCES a_parent(id));
             INSERT INTO a_parent (id) VALUES (1), (2);
             INSERT INTO z_child (id, parent_id) VALUES (10, 1), (11, 2);",
        );
        let mut handle = SqliteEngine.open(&path).unwrap();
        handle
            .connection()
            .pragma_update(None, "foreign_keys", "ON")
            .unwrap();

        let summary = handle.clear_all_rows().unwrap();
        assert_eq!(summary.rows_deleted, 4);
        assert_eq!(summary.tables, vec!["a_parent".to_string(), "z_child".to_string()]);
    }

    #[test]
    fn clear_empties_fts_tables_without_touching_shadow_tables() {
        let dir = TempDir::new().unwrap();
        let path = seeded(
            &dir,
            "fts.db",
            "CREATE VIRTUAL TABLE docs USING fts5(body);
             INSERT INTO docs (body) VALUES ('hello world'), ('goodbye world');",
        );
        let mut handle = SqliteEngine.open(&path).unwrap();

        assert_eq!(handle.table_names().unwrap(), vec!["docs".to_string()]);
        let summary = handle.clear_all_rows().unwrap();
        assert_eq!(summary.tables, vec!["docs".to_string()]);

        let rows = handle
            .query("SELECT rowid FROM docs WHERE docs MATCH 'world'", &[])
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn clear_repeats_until_triggers_stop_refilling() {
        let dir = TempDir::new().unwrap();
        let path = seeded(
            &dir,
            "audit.db",
            "CREATE TABLE audit (id INTEGER PRIMARY KEY, what TEXT NOT NULL);
             CREATE TABLE contacts (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
             CREATE TRIGGER contacts_audit AFTER DELETE ON contacts
             BEGIN INSERT INTO audit (what) VALUES ('deleted ' || OLD.name); END;
             INSERT INTO contacts (name) VALUES ('Ada'), ('Grace');",
        );
        let mut handle = SqliteEngine.open(&path).unwrap();

        let summary = handle.clear_all_rows().unwrap();
        assert_eq!(summary.tables, vec!["audit".to_string(), "contacts".to_string()]);
        // Two contacts, then the two audit rows their deletion produced.
        assert_eq!(summary.rows_deleted, 4);
        let refilled = non_empty_tables(handle.connection(), &summary.tables).unwrap();
        assert!(refilled.is_empty(), "{refilled:?}");
    }

    #[test]
    fn clear_gives_up_and_rolls_back_on_endless_refill() {
        let dir = TempDir::new().unwrap();
        let path = seeded(
            &dir,
            "pingpong.db",
            "CREATE TABLE ping (n INTEGER);
             CREATE TABLE pong (n INTEGER);
             CREATE TRIGGER ping_to_pong AFTER DELETE ON ping BEGIN INSERT INTO pong VALUES (OLD.n); END;
             CREATE TRIGGER pong_to_ping AFTER DELETE ON pong BEGIN INSERT INTO ping VALUES (OLD.n); END;
             INSERT INTO ping VALUES (1);
             INSERT INTO pong VALUES (2);",
        );
        let mut handle = SqliteEngine.open(&path).unwrap();

        let err = handle.clear_all_rows().unwrap_err();
        assert!(matches!(err, BootstrapError::DeleteFailure { .. }), "{err:?}");

        let rows = handle
            .query("SELECT n FROM ping UNION ALL SELECT n FROM pong ORDER BY n", &[])
            .unwrap();
        let values: Vec<&Value> = rows.iter().map(|row| &row["n"]).collect();
        assert_eq!(values, vec![&Value::Integer(1), &Value::Integer(2)]);
    }

    #[test]
    fn validating_a_wal_database_leaves_no_sidecar_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.pragma_update(None, "journal_mode", "WAL").unwrap();
            conn.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1);")
                .unwrap();
        }

        SqliteEngine.validate(&path).unwrap();

        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["wal.db".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn immutable_uri_escapes_reserved_characters() {
        let uri = immutable_uri(Path::new("/data/a?b#c%d.db")).unwrap();
        assert_eq!(uri, "file:/data/a%3fb%23c%25d.db?immutable=1");
    }

    #[cfg(unix)]
    #[test]
    fn file_prefixed_names_open_as_plain_files() {
        let dir = TempDir::new().unwrap();
        let path = seeded(
            &dir,
            "file:notes.db",
            "CREATE TABLE notes (body TEXT); INSERT INTO notes VALUES ('kept');",
        );

        SqliteEngine.validate(&path).unwrap();
        let handle = SqliteEngine.open(&path).unwrap();
        let rows = handle.query("SELECT body FROM notes", &[]).unwrap();
        assert_eq!(rows[0]["body"], Value::Text("kept".into()));
    }
}
