//! Persisted record layout
//!
//! One row per sample: a 20-digit zero-padded counter key and the encoded
//! sample. Fixed-width decimal keys sort lexicographically in insertion
//! order, and `u64::MAX` still fits.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{ConnectOptions, SqliteConnection};

use crate::error::{HighwayError, Result};

/// Digits in every record key
pub const KEY_WIDTH: usize = 20;

pub(crate) const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS records (\
    key TEXT PRIMARY KEY NOT NULL, value BLOB NOT NULL) WITHOUT ROWID;";

pub(crate) const TABLE_EXISTS: &str =
    "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'records';";

pub(crate) const LAST_KEY: &str = "SELECT key FROM records ORDER BY key DESC LIMIT 1;";

pub(crate) const INSERT: &str = "INSERT INTO records (key, value) VALUES (?, ?);";

pub(crate) const SCAN: &str = "SELECT key, value FROM records WHERE key > ? ORDER BY key LIMIT ?;";

/// Format a counter as a record key
pub fn record_key(counter: u64) -> String {
    format!("{:0width$}", counter, width = KEY_WIDTH)
}

/// Parse a record key back into its counter
pub fn parse_key(key: &str) -> Result<u64> {
    if key.len() != KEY_WIDTH || !key.bytes().all(|b| b.is_ascii_digit()) {
        return Err(HighwayError::CorruptRecord {
            key: key.to_string(),
            reason: format!("expected {} decimal digits", KEY_WIDTH),
        });
    }
    u64::from_str(key).map_err(|e| HighwayError::CorruptRecord {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Open (or create) the store file in WAL mode
pub(crate) async fn connect(path: &Path, create: bool) -> Result<SqliteConnection> {
    let conn = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(create)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .connect()
        .await?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_sort_in_counter_order() {
        let keys: Vec<String> = [0u64, 9, 10, 99, 100, u64::MAX]
            .iter()
            .map(|c| record_key(*c))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(keys[1], "00000000000000000009");
        assert_eq!(keys[5].len(), KEY_WIDTH);
    }

    #[test]
    fn test_parse_key() {
        assert_eq!(parse_key(&record_key(12345)).unwrap(), 12345);
        assert!(parse_key("12345").is_err());
        assert!(parse_key("0000000000000000000x").is_err());
        assert!(parse_key("99999999999999999999").is_err());
    }
}
