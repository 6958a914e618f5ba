// src/cli/migrate.rs — Database migration command
//
// Migrations run automatically when the SQLite store opens. This command
// gives visibility and a way to step back during development.

use std::path::PathBuf;

use rusqlite::Connection;

use crate::infra::config::{Config, StorageBackend};
use crate::infra::paths;
use crate::store::schema;

fn db_path(config: &Config) -> PathBuf {
    config
        .storage
        .path
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(paths::db_path)
}

/// Show migration status, roll back the newest migration, or apply pending ones.
pub fn run_migrate(config: &Config, status_only: bool, rollback: bool) -> anyhow::Result<()> {
    if config.storage.backend == StorageBackend::Memory {
        println!("Storage backend is `memory`; nothing to migrate.");
        return Ok(());
    }

    let db_path = db_path(config);
    if !db_path.exists() && (status_only || rollback) {
        println!("No database found at: {}", db_path.display());
        return Ok(());
    }
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(&db_path)?;

    if status_only {
        return show_migration_status(&conn, &db_path);
    }

    if rollback {
        let current = current_version_or_zero(&conn)?;
        if current == 0 {
            println!("No migrations to roll back.");
            return Ok(());
        }
        println!("Rolling back migration v{current}. Data in its tables is dropped.");
        schema::rollback_to(&conn, current - 1)?;
        return show_migration_status(&conn, &db_path);
    }

    println!("Running database migrations...");
    schema::run_migrations(&conn)?;
    println!("Migrations complete.");
    show_migration_status(&conn, &db_path)
}

fn migrations_table_exists(conn: &Connection) -> anyhow::Result<bool> {
    Ok(conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='_migrations'",
        [],
        |row| row.get(0),
    )?)
}

fn current_version_or_zero(conn: &Connection) -> anyhow::Result<u32> {
    if !migrations_table_exists(conn)? {
        return Ok(0);
    }
    Ok(schema::current_version(conn)?)
}

fn show_migration_status(conn: &Connection, db_path: &std::path::Path) -> anyhow::Result<()> {
    if !migrations_table_exists(conn)? {
        println!("No migrations have been run yet.");
        return Ok(());
    }

    println!("Database: {}", db_path.display());
    println!("Current schema version: {}", schema::current_version(conn)?);
    println!();

    let mut stmt =
        conn.prepare("SELECT version, name, applied_at FROM _migrations ORDER BY version")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, u32>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;

    println!("Applied migrations:");
    for row in rows {
        let (version, name, applied_at) = row?;
        println!("  v{version}: {name} (applied {applied_at})");
    }
    Ok(())
}
