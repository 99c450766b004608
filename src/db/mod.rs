//! SQLite persistence layer: per-minute traffic totals keyed by app, plus
//! the peak-detection query the analysis layer drives off of.
//!
//! Two tables: `apps` (a stable id for each distinct display name) and
//! `traffic_log` (one row per persister flush, referencing `apps.id`).
//! Both are created idempotently on `Store::open` so repeated runs against
//! the same file never fail on "table already exists".

use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};

use crate::error::NetwatchError;

/// A distinct display name with a stable id. See `Persister` for how the
/// display name itself (`"chrome.exe -> example.com [US]"`) is built —
/// a name change (e.g. the resolved country code changes) is intentionally
/// a *new* app id, not an update of the old row (spec.md, Open Question c).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct App {
    pub id: i64,
    pub name: String,
}

/// One flush-interval's worth of traffic for one app.
#[derive(Debug, Clone, Copy)]
pub struct TrafficLogRow {
    pub timestamp: i64,
    pub app_id: i64,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

/// One minute-bucket/app group whose total crossed the configured
/// threshold.
#[derive(Debug, Clone)]
pub struct TrafficPeak {
    pub bucket: i64,
    pub app_id: i64,
    pub app_name: String,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

impl TrafficPeak {
    pub fn total(&self) -> u64 {
        self.bytes_up + self.bytes_down
    }
}

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (creating if necessary) the database at `path` and ensure the
    /// schema exists.
    pub fn open(path: &str) -> Result<Self, NetwatchError> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database, for tests.
    pub fn open_in_memory() -> Result<Self, NetwatchError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), NetwatchError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS apps (
                id   INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE
             );
             CREATE TABLE IF NOT EXISTS traffic_log (
                timestamp   INTEGER NOT NULL,
                app_id      INTEGER NOT NULL REFERENCES apps(id),
                bytes_up    INTEGER NOT NULL,
                bytes_down  INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_traffic_log_timestamp ON traffic_log(timestamp);
             CREATE INDEX IF NOT EXISTS idx_traffic_log_app_id ON traffic_log(app_id);",
        )?;
        Ok(())
    }

    /// Look up the id for `name`, inserting a new row if it doesn't exist
    /// yet. Select-then-insert rather than `INSERT OR IGNORE ... RETURNING`
    /// so the common (already-exists) case never writes.
    pub fn get_or_add_app(&self, name: &str) -> Result<i64, NetwatchError> {
        let conn = self.conn.lock().unwrap();
        if let Some(id) = conn
            .query_row(
                "SELECT id FROM apps WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .ok()
        {
            return Ok(id);
        }
        conn.execute("INSERT INTO apps (name) VALUES (?1)", params![name])?;
        Ok(conn.last_insert_rowid())
    }

    pub fn log_traffic(&self, row: &TrafficLogRow) -> Result<(), NetwatchError> {
        let conn = self.conn.lock().unwrap();
        conn.prepare_cached(
            "INSERT INTO traffic_log (timestamp, app_id, bytes_up, bytes_down)
             VALUES (?1, ?2, ?3, ?4)",
        )?
        .execute(params![
            row.timestamp,
            row.app_id,
            row.bytes_up as i64,
            row.bytes_down as i64,
        ])?;
        Ok(())
    }

    /// Total bytes per app within `[from, to]`, descending.
    pub fn usage_in(&self, from: i64, to: i64) -> Result<Vec<(App, u64)>, NetwatchError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT apps.id, apps.name, SUM(bytes_up) + SUM(bytes_down) AS total
             FROM traffic_log
             JOIN apps ON apps.id = traffic_log.app_id
             WHERE timestamp >= ?1 AND timestamp <= ?2
             GROUP BY apps.id
             ORDER BY total DESC",
        )?;
        let rows = stmt.query_map(params![from, to], |row| {
            let total: i64 = row.get(2)?;
            Ok((
                App {
                    id: row.get(0)?,
                    name: row.get(1)?,
                },
                total as u64,
            ))
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Traffic peaks: minute buckets (`timestamp / 60 * 60`) grouped *per
    /// app* (not collapsed across apps sharing a bucket — spec.md's Open
    /// Question (a)) whose combined total meets `threshold_bytes`, newest
    /// bucket first.
    pub fn find_peaks(
        &self,
        from: i64,
        to: i64,
        threshold_bytes: u64,
    ) -> Result<Vec<TrafficPeak>, NetwatchError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT (timestamp / 60) * 60 AS bucket, apps.id, apps.name,
                    SUM(bytes_up) AS up, SUM(bytes_down) AS down
             FROM traffic_log
             JOIN apps ON apps.id = traffic_log.app_id
             WHERE timestamp >= ?1 AND timestamp <= ?2
             GROUP BY bucket, apps.id
             HAVING SUM(bytes_up) + SUM(bytes_down) >= ?3
             ORDER BY bucket DESC",
        )?;
        let rows = stmt.query_map(params![from, to, threshold_bytes as i64], |row| {
            Ok(TrafficPeak {
                bucket: row.get(0)?,
                app_id: row.get(1)?,
                app_name: row.get(2)?,
                bytes_up: row.get::<_, i64>(3)? as u64,
                bytes_down: row.get::<_, i64>(4)? as u64,
            })
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_memory_db() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[test]
    fn test_get_or_add_app_is_idempotent() {
        let db = open_memory_db();
        let id1 = db.get_or_add_app("chrome.exe -> example.com").unwrap();
        let id2 = db.get_or_add_app("chrome.exe -> example.com").unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn test_get_or_add_app_distinct_names_get_distinct_ids() {
        let db = open_memory_db();
        let id1 = db.get_or_add_app("a").unwrap();
        let id2 = db.get_or_add_app("b").unwrap();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_log_traffic_and_usage_in() {
        let db = open_memory_db();
        let app_id = db.get_or_add_app("chrome.exe -> example.com").unwrap();
        db.log_traffic(&TrafficLogRow {
            timestamp: 1000,
            app_id,
            bytes_up: 100,
            bytes_down: 200,
        })
        .unwrap();
        db.log_traffic(&TrafficLogRow {
            timestamp: 1005,
            app_id,
            bytes_up: 50,
            bytes_down: 50,
        })
        .unwrap();

        let usage = db.usage_in(0, 2000).unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].0.name, "chrome.exe -> example.com");
        assert_eq!(usage[0].1, 400);
    }

    #[test]
    fn test_usage_in_orders_descending_by_total() {
        let db = open_memory_db();
        let small = db.get_or_add_app("small").unwrap();
        let big = db.get_or_add_app("big").unwrap();
        db.log_traffic(&TrafficLogRow {
            timestamp: 1,
            app_id: small,
            bytes_up: 10,
            bytes_down: 10,
        })
        .unwrap();
        db.log_traffic(&TrafficLogRow {
            timestamp: 1,
            app_id: big,
            bytes_up: 1000,
            bytes_down: 1000,
        })
        .unwrap();

        let usage = db.usage_in(0, 10).unwrap();
        assert_eq!(usage[0].0.name, "big");
        assert_eq!(usage[1].0.name, "small");
    }

    #[test]
    fn test_find_peaks_groups_per_bucket_and_app() {
        let db = open_memory_db();
        let chrome = db.get_or_add_app("chrome.exe -> cdn.example.com").unwrap();
        let steam = db.get_or_add_app("steam.exe -> cdn.steampowered.com").unwrap();

        // Same minute bucket (0), two different apps.
        db.log_traffic(&TrafficLogRow {
            timestamp: 10,
            app_id: chrome,
            bytes_up: 0,
            bytes_down: 2 * 1024 * 1024,
        })
        .unwrap();
        db.log_traffic(&TrafficLogRow {
            timestamp: 20,
            app_id: steam,
            bytes_up: 0,
            bytes_down: 512, // below threshold on its own
        })
        .unwrap();

        let peaks = db.find_peaks(0, 100, 1024 * 1024).unwrap();
        assert_eq!(peaks.len(), 1, "only chrome's bucket should clear the threshold");
        assert_eq!(peaks[0].app_name, "chrome.exe -> cdn.example.com");
        assert_eq!(peaks[0].bucket, 0);
    }

    #[test]
    fn test_find_peaks_orders_newest_bucket_first() {
        let db = open_memory_db();
        let app = db.get_or_add_app("app").unwrap();
        db.log_traffic(&TrafficLogRow {
            timestamp: 60,
            app_id: app,
            bytes_up: 2 * 1024 * 1024,
            bytes_down: 0,
        })
        .unwrap();
        db.log_traffic(&TrafficLogRow {
            timestamp: 180,
            app_id: app,
            bytes_up: 2 * 1024 * 1024,
            bytes_down: 0,
        })
        .unwrap();

        let peaks = db.find_peaks(0, 1000, 1024 * 1024).unwrap();
        assert_eq!(peaks.len(), 2);
        assert!(peaks[0].bucket > peaks[1].bucket);
    }

    #[test]
    fn test_schema_creation_is_idempotent_across_opens() {
        let conn = Connection::open_in_memory().unwrap();
        Store::init_schema(&conn).unwrap();
        Store::init_schema(&conn).unwrap();
    }
}
