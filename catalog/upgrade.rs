// Part of Keystone NVR, a venue recording appliance.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Forward-only, idempotent schema migrations.
//!
//! On startup the catalog asserts the schema is current and applies any
//! missing steps (§4.B). There is one step per schema version; add a new
//! `fn vN_to_vM` here and append it to `STEPS` when the schema changes.

use base::{bail, Error, ErrorKind};
use rusqlite::Connection;

use crate::EXPECTED_SCHEMA_VERSION;

type Step = fn(&rusqlite::Transaction) -> rusqlite::Result<()>;

/// No upgrade steps yet: `schema.sql` creates the database directly at
/// `EXPECTED_SCHEMA_VERSION`. The first real migration will be
/// `v1_to_v2::run` appended here.
const STEPS: &[Step] = &[];

pub fn init_schema(conn: &mut Connection) -> Result<(), Error> {
    conn.execute_batch(include_str!("schema.sql"))
        .map_err(|e| base::Error::wrap(ErrorKind::Invariant, "creating catalog schema", e))
}

pub fn current_version(conn: &Connection) -> Result<Option<i32>, Error> {
    let exists: bool = conn
        .query_row(
            "select count(*) from sqlite_master where type = 'table' and name = 'version'",
            [],
            |row| row.get::<_, i64>(0).map(|n| n > 0),
        )
        .map_err(|e| base::Error::wrap(ErrorKind::Internal, "checking for version table", e))?;
    if !exists {
        return Ok(None);
    }
    let version = conn
        .query_row("select version from version where id = 0", [], |row| {
            row.get::<_, i32>(0)
        })
        .map_err(|e| base::Error::wrap(ErrorKind::Internal, "reading schema version", e))?;
    Ok(Some(version))
}

/// Ensures `conn`'s schema exists and is at `EXPECTED_SCHEMA_VERSION`,
/// creating it fresh or running any missing upgrade steps.
pub fn ensure_current(conn: &mut Connection) -> Result<(), Error> {
    match current_version(conn)? {
        None => init_schema(conn),
        Some(v) if v == EXPECTED_SCHEMA_VERSION => Ok(()),
        Some(v) if v > EXPECTED_SCHEMA_VERSION => {
            bail!(
                Invariant,
                "catalog schema version {v} is newer than this build expects \
                 ({EXPECTED_SCHEMA_VERSION}); refusing to run against it"
            )
        }
        Some(v) => {
            let start = v as usize;
            if STEPS.len() < (EXPECTED_SCHEMA_VERSION as usize) - 1 {
                bail!(
                    Invariant,
                    "no upgrade path from schema version {v} to {EXPECTED_SCHEMA_VERSION}"
                );
            }
            for (i, step) in STEPS.iter().enumerate().skip(start.saturating_sub(1)) {
                let tx = conn
                    .transaction()
                    .map_err(|e| base::Error::wrap(ErrorKind::Internal, "starting upgrade tx", e))?;
                step(&tx).map_err(|e| {
                    base::Error::wrap(ErrorKind::Invariant, format!("upgrading to v{}", i + 2), e)
                })?;
                tx.execute("update version set version = ?1 where id = 0", [i as i64 + 2])
                    .map_err(|e| base::Error::wrap(ErrorKind::Internal, "bumping version", e))?;
                tx.commit()
                    .map_err(|e| base::Error::wrap(ErrorKind::Internal, "committing upgrade", e))?;
            }
            Ok(())
        }
    }
}
