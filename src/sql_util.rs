//! Low-level SQLite helpers shared by [`crate::migration`] and
//! [`crate::storage`]. Contains no business logic — ported from
//! `sqlite3_utils.py`'s `ddl_transaction`/`foreign_keys_off`/
//! `require_version` family and adapted to the `sqlite` crate's API, in the
//! style of `radicle`'s `node/db.rs`.

use sqlite::Connection;

use crate::error::Error;

/// Run `body` inside an explicit `BEGIN;` / `COMMIT;` transaction,
/// `ROLLBACK;`ing on error. Shared by the migration framework and by every
/// multi-statement write in the storage engine (`add_or_update_entries`,
/// `remove_feed`'s cascade, ...), the way `radicle::sql::transaction` is
/// shared across its COB stores.
pub fn transaction<T>(
    db: &Connection,
    body: impl FnOnce(&Connection) -> Result<T, Error>,
) -> Result<T, Error> {
    db.execute("BEGIN;")?;
    match body(db) {
        Ok(value) => {
            db.execute("COMMIT;")?;
            Ok(value)
        }
        Err(err) => {
            // A rollback failure would mask the original error; it is not
            // expected to happen since we always reach this inside an
            // open transaction.
            let _ = db.execute("ROLLBACK;");
            Err(err)
        }
    }
}

/// Alias kept for the migration framework, which always wraps DDL; the
/// underlying mechanics (explicit `BEGIN`/`COMMIT`/`ROLLBACK`) are identical
/// because the driver's implicit transaction handling around DDL statements
/// is unreliable across SQLite versions.
pub fn ddl_transaction<T>(
    db: &Connection,
    body: impl FnOnce(&Connection) -> Result<T, Error>,
) -> Result<T, Error> {
    transaction(db, body)
}

/// Run `body` with `PRAGMA foreign_keys` temporarily disabled, restoring the
/// previous value unconditionally on exit.
///
/// SQLite refuses to toggle `foreign_keys` inside a transaction, so this
/// must be called outside of [`ddl_transaction`] (the migration framework
/// nests them the other way around: `foreign_keys_off` wraps
/// `ddl_transaction`, never the reverse).
pub fn foreign_keys_off<T>(
    db: &Connection,
    body: impl FnOnce(&Connection) -> Result<T, Error>,
) -> Result<T, Error> {
    let previous = get_bool_pragma(db, "foreign_keys")?;

    db.execute("PRAGMA foreign_keys = OFF;")?;
    let result = body(db);
    db.execute(format!(
        "PRAGMA foreign_keys = {};",
        if previous { "ON" } else { "OFF" }
    ))?;

    result
}

/// Check for outstanding foreign-key violations.
pub fn foreign_key_check(db: &Connection) -> Result<(), Error> {
    let mut violations = false;
    db.iterate("PRAGMA foreign_key_check;", |_row| {
        violations = true;
        true
    })?;
    if violations {
        return Err(Error::Integrity("FOREIGN KEY constraint failed".into()));
    }
    Ok(())
}

pub fn get_int_pragma(db: &Connection, pragma: &str) -> Result<i64, Error> {
    let mut value = 0i64;
    db.iterate(format!("PRAGMA {pragma};"), |row| {
        if let Some((_, Some(v))) = row.first() {
            value = v.parse().unwrap_or(0);
        }
        true
    })?;
    Ok(value)
}

pub fn set_int_pragma(db: &Connection, pragma: &str, value: i64) -> Result<(), Error> {
    db.execute(format!("PRAGMA {pragma} = {value};"))?;
    Ok(())
}

fn get_bool_pragma(db: &Connection, pragma: &str) -> Result<bool, Error> {
    Ok(get_int_pragma(db, pragma)? != 0)
}

/// Count the number of entries in `sqlite_master`, i.e. whether the database
/// has any user-created objects at all.
pub fn table_count(db: &Connection) -> Result<i64, Error> {
    let mut count = 0i64;
    db.iterate("SELECT count(*) FROM sqlite_master;", |row| {
        if let Some((_, Some(v))) = row.first() {
            count = v.parse().unwrap_or(0);
        }
        true
    })?;
    Ok(count)
}

/// Parse `SELECT sqlite_version();` and fail with [`Error::Requirement`] if
/// it is older than `minimum` (a `(major, minor, patch)` tuple).
pub fn require_version(db: &Connection, minimum: (u32, u32, u32)) -> Result<(), Error> {
    let mut version = String::new();
    db.iterate("SELECT sqlite_version();", |row| {
        if let Some((_, Some(v))) = row.first() {
            version = v.to_string();
        }
        true
    })?;

    let parts: Vec<u32> = version.split('.').filter_map(|p| p.parse().ok()).collect();
    let found = (
        parts.first().copied().unwrap_or(0),
        parts.get(1).copied().unwrap_or(0),
        parts.get(2).copied().unwrap_or(0),
    );

    if found < minimum {
        return Err(Error::Requirement(format!(
            "at least SQLite version {}.{}.{} required, {} installed",
            minimum.0, minimum.1, minimum.2, version
        )));
    }
    Ok(())
}

/// Probe for required SQL functions by executing known-good sentinel
/// statements; a function is considered present iff its statement runs
/// without an "no such function" error.
pub fn require_functions(db: &Connection, names: &[&str]) -> Result<(), Error> {
    let mut missing = Vec::new();
    for name in names {
        let sql = function_test(name)
            .unwrap_or_else(|| panic!("no sentinel statement registered for function {name}"));
        match db.execute(sql) {
            Ok(()) => {}
            Err(err) => {
                let lower = err.message.as_deref().unwrap_or_default().to_lowercase();
                if lower.contains("no such") {
                    missing.push(*name);
                } else {
                    return Err(err.into());
                }
            }
        }
    }
    if !missing.is_empty() {
        missing.sort_unstable();
        return Err(Error::Requirement(format!(
            "required SQLite functions missing: {missing:?}"
        )));
    }
    Ok(())
}

fn function_test(name: &str) -> Option<&'static str> {
    Some(match name {
        "json_array_length" => "SELECT json_array_length('[]');",
        "json" => "SELECT json(1);",
        "json_object" => "SELECT json_object('key', 1);",
        "json_group_array" => "SELECT json_group_array(1);",
        "json_each" => "SELECT * FROM json_each('[1]');",
        _ => return None,
    })
}
