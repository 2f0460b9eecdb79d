//! The batched "mark queued/copied" primitive.
//!
//! Marks large path sets as copied in one transaction: deduplicate,
//! materialize a transient table keyed by `file_path`, then join-update
//! the inventory table. Replaces a plain `IN (list)` filter that degrades
//! on large inputs.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{format_err, Error};
use rusqlite::{params, Connection, OptionalExtension};

/// Multi-row insert fallback batch size.
const INSERT_BATCH_SIZE: usize = 50_000;
/// Single-scan verification limit; larger inputs are chunked.
const VERIFY_FAST_PATH_LIMIT: usize = 50_000;
const VERIFY_CHUNK_SIZE: usize = 10_000;

static TMP_TABLE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Ensure the composite `(backup_set_id, file_path)` index exists.
///
/// Duplicate-create errors are ignored; a failed create never blocks the
/// update itself.
fn ensure_index_exists(conn: &Connection, table_name: &str) {
    let index_name = format!("idx_{}_set_path", table_name);
    let sql = format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} (backup_set_id, file_path)",
        index_name, table_name
    );
    if let Err(err) = conn.execute_batch(&sql) {
        log::warn!("unable to create index {}: {}", index_name, err);
    }
}

fn dedup_preserving_order<'a>(paths: &'a [String]) -> Vec<&'a str> {
    let mut seen = HashSet::new();
    paths
        .iter()
        .map(String::as_str)
        .filter(|path| !path.is_empty())
        .filter(|path| seen.insert(*path))
        .collect()
}

fn insert_paths_batched(
    conn: &Connection,
    tmp_table: &str,
    paths: &[&str],
) -> Result<(), Error> {
    let mut stmt = conn.prepare(&format!(
        "INSERT OR IGNORE INTO {} (file_path) VALUES (?1)",
        tmp_table
    ))?;
    for chunk in paths.chunks(INSERT_BATCH_SIZE) {
        for path in chunk {
            stmt.execute(params![path])?;
        }
    }
    Ok(())
}

/// Mark the given paths of one backup set as copied.
///
/// Idempotent: repeated calls with overlapping paths converge on the same
/// state. Accepts inputs up to around a million paths. Returns the number
/// of rows actually updated.
pub fn mark_files_queued_tx(
    conn: &mut Connection,
    table_name: &str,
    backup_set_id: i64,
    paths: &[String],
    now: i64,
) -> Result<usize, Error> {
    let unique = dedup_preserving_order(paths);
    if unique.is_empty() {
        return Ok(0);
    }

    ensure_index_exists(conn, table_name);

    let tmp_table = format!(
        "tmp_file_paths_{}",
        TMP_TABLE_SEQ.fetch_add(1, Ordering::SeqCst)
    );

    let result = (|| -> Result<usize, Error> {
        let tx = conn.transaction()?;
        tx.execute_batch(&format!(
            "CREATE TEMP TABLE {} (file_path TEXT NOT NULL PRIMARY KEY)",
            tmp_table
        ))?;

        // array-expansion fast path; batched multi-row inserts as fallback
        let json = serde_json::to_string(&unique)?;
        let inserted = tx.execute(
            &format!(
                "INSERT OR IGNORE INTO {} (file_path)
                 SELECT j.value FROM json_each(?1) AS j",
                tmp_table
            ),
            params![json],
        );
        if let Err(err) = inserted {
            log::debug!("array-expansion insert failed, falling back to batches: {}", err);
            insert_paths_batched(&tx, &tmp_table, &unique)?;
        }

        let updated = tx.execute(
            &format!(
                "UPDATE {table} SET
                     is_copy_success = 1,
                     copy_status_at = ?1,
                     updated_at = ?1
                 FROM {tmp} AS tmp
                 WHERE {table}.backup_set_id = ?2
                   AND {table}.file_path = tmp.file_path
                   AND ({table}.is_copy_success IS NOT 1)",
                table = table_name,
                tmp = tmp_table
            ),
            params![now, backup_set_id],
        )?;

        tx.commit()?;
        Ok(updated)
    })();

    // transient table cleanup, best effort even on error
    let _ = conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", tmp_table));

    result.map_err(|err| format_err!("mark_files_queued on {} failed: {}", table_name, err))
}

fn verify_chunk(
    conn: &Connection,
    table_name: &str,
    backup_set_id: i64,
    paths: &[&str],
) -> Result<bool, Error> {
    let json = serde_json::to_string(paths)?;
    let pending: Option<i64> = conn
        .query_row(
            &format!(
                "SELECT 1 FROM {}
                 WHERE backup_set_id = ?1
                   AND file_path IN (SELECT j.value FROM json_each(?2) AS j)
                   AND (is_copy_success IS NOT 1)
                 LIMIT 1",
                table_name
            ),
            params![backup_set_id, json],
            |row| row.get(0),
        )
        .optional()?;
    Ok(pending.is_none())
}

fn verify_count_fallback(
    conn: &Connection,
    table_name: &str,
    backup_set_id: i64,
    paths: &[&str],
) -> Result<bool, Error> {
    let json = serde_json::to_string(paths)?;
    let count: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM {}
             WHERE backup_set_id = ?1
               AND file_path IN (SELECT j.value FROM json_each(?2) AS j)
               AND (is_copy_success IS NOT 1)",
            table_name
        ),
        params![backup_set_id, json],
        |row| row.get(0),
    )?;
    Ok(count == 0)
}

/// True iff no row for the given set and paths remains unmarked.
///
/// Answers in one scan for small inputs; larger inputs are chunked and
/// short-circuit on the first mismatch. A failing fast path falls back to
/// a full `COUNT(*)`.
pub fn verify_files_queued_tx(
    conn: &Connection,
    table_name: &str,
    backup_set_id: i64,
    paths: &[String],
) -> Result<bool, Error> {
    let unique = dedup_preserving_order(paths);
    if unique.is_empty() {
        return Ok(true);
    }

    let fast_path = (|| -> Result<bool, Error> {
        if unique.len() <= VERIFY_FAST_PATH_LIMIT {
            return verify_chunk(conn, table_name, backup_set_id, &unique);
        }
        for chunk in unique.chunks(VERIFY_CHUNK_SIZE) {
            if !verify_chunk(conn, table_name, backup_set_id, chunk)? {
                return Ok(false);
            }
        }
        Ok(true)
    })();

    match fast_path {
        Ok(result) => Ok(result),
        Err(err) => {
            log::warn!("fast verification failed, falling back to COUNT: {}", err);
            verify_count_fallback(conn, table_name, backup_set_id, &unique)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::INVENTORY_COLUMNS;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(&format!("CREATE TABLE backup_files_000001 ({})", INVENTORY_COLUMNS))
            .unwrap();
        let mut stmt = conn
            .prepare(
                "INSERT INTO backup_files_000001 (backup_set_id, file_path, file_size)
                 VALUES (?1, ?2, ?3)",
            )
            .unwrap();
        for (set, path) in [
            (7, "/data/a.txt"),
            (7, "/data/b.txt"),
            (7, "/data/c.bin"),
            (8, "/data/a.txt"),
        ] {
            stmt.execute(params![set, path, 100]).unwrap();
        }
        drop(stmt);
        conn
    }

    fn flags(conn: &Connection, set: i64) -> Vec<(String, Option<bool>)> {
        let mut stmt = conn
            .prepare(
                "SELECT file_path, is_copy_success FROM backup_files_000001
                 WHERE backup_set_id = ?1 ORDER BY id",
            )
            .unwrap();
        stmt.query_map(params![set], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn test_mark_is_idempotent() -> Result<(), Error> {
        let mut conn = setup();
        let paths = vec!["/data/a.txt".to_string(), "/data/b.txt".to_string()];

        let first = mark_files_queued_tx(&mut conn, "backup_files_000001", 7, &paths, 1000)?;
        assert_eq!(first, 2);
        let state_after_first = flags(&conn, 7);

        let second = mark_files_queued_tx(&mut conn, "backup_files_000001", 7, &paths, 2000)?;
        assert_eq!(second, 0);
        assert_eq!(flags(&conn, 7), state_after_first);
        Ok(())
    }

    #[test]
    fn test_mark_only_touches_matching_set() -> Result<(), Error> {
        let mut conn = setup();
        let paths = vec!["/data/a.txt".to_string()];
        mark_files_queued_tx(&mut conn, "backup_files_000001", 7, &paths, 1000)?;

        // same path under another backup set stays unset
        assert_eq!(flags(&conn, 8), vec![("/data/a.txt".to_string(), None)]);
        Ok(())
    }

    #[test]
    fn test_empty_input_is_a_noop() -> Result<(), Error> {
        let mut conn = setup();
        assert_eq!(
            mark_files_queued_tx(&mut conn, "backup_files_000001", 7, &[], 1000)?,
            0
        );
        assert_eq!(
            mark_files_queued_tx(
                &mut conn,
                "backup_files_000001",
                7,
                &[String::new(), String::new()],
                1000
            )?,
            0
        );
        Ok(())
    }

    #[test]
    fn test_duplicate_paths_count_once() -> Result<(), Error> {
        let mut conn = setup();
        let paths = vec![
            "/data/a.txt".to_string(),
            "/data/a.txt".to_string(),
            "/data/c.bin".to_string(),
        ];
        let updated = mark_files_queued_tx(&mut conn, "backup_files_000001", 7, &paths, 1000)?;
        assert_eq!(updated, 2);
        Ok(())
    }

    #[test]
    fn test_verify_reflects_mark_state() -> Result<(), Error> {
        let mut conn = setup();
        let all = vec![
            "/data/a.txt".to_string(),
            "/data/b.txt".to_string(),
            "/data/c.bin".to_string(),
        ];
        assert!(!verify_files_queued_tx(&conn, "backup_files_000001", 7, &all)?);

        mark_files_queued_tx(&mut conn, "backup_files_000001", 7, &all[..2].to_vec(), 1000)?;
        assert!(!verify_files_queued_tx(&conn, "backup_files_000001", 7, &all)?);
        assert!(verify_files_queued_tx(
            &conn,
            "backup_files_000001",
            7,
            &all[..2].to_vec()
        )?);

        mark_files_queued_tx(&mut conn, "backup_files_000001", 7, &all, 1000)?;
        assert!(verify_files_queued_tx(&conn, "backup_files_000001", 7, &all)?);
        Ok(())
    }

    #[test]
    fn test_verify_empty_is_true() -> Result<(), Error> {
        let conn = setup();
        assert!(verify_files_queued_tx(&conn, "backup_files_000001", 7, &[])?);
        Ok(())
    }

    #[test]
    fn test_paths_missing_from_inventory_are_ignored() -> Result<(), Error> {
        let mut conn = setup();
        let paths = vec!["/data/not-scanned.txt".to_string()];
        assert_eq!(
            mark_files_queued_tx(&mut conn, "backup_files_000001", 7, &paths, 1000)?,
            0
        );
        // verification over unknown paths finds no unmarked rows either
        assert!(verify_files_queued_tx(&conn, "backup_files_000001", 7, &paths)?);
        Ok(())
    }
}
