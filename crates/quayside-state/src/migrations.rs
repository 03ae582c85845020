//! SurrealDB schema migrations and initialization
//!
//! Defines the Quayside tables with their indexes. Every statement is a
//! `DEFINE ... IF NOT EXISTS`-style definition, so initialization is safe to
//! repeat on each connection.

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all Quayside tables in SurrealDB
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing Quayside SurrealDB schema");

    init_runs_table(db).await?;
    init_run_events_table(db).await?;
    init_scan_reports_table(db).await?;
    init_deployments_table(db).await?;

    info!("Quayside schema initialization complete");
    Ok(())
}

/// Initialize `runs` table
///
/// Schema:
/// ```text
/// TABLE runs {
///   run_id:        STRING (unique)
///   spec_digest:   STRING (indexed)
///   git_sha:       STRING? (indexed)
///   pipeline:      STRING
///   trigger:       STRING
///   tags:          OBJECT
///   status:        STRING (running | completed | failed | cancelled)
///   total_events:  INT
///   duration_ms:   INT
///   success:       BOOL
///   created_at:    DATETIME (indexed)
///   completed_at:  DATETIME?
/// }
/// ```
///
/// Status transitions (running → terminal) are enforced by the ledger.
async fn init_runs_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing runs table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS runs AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_run_id ON TABLE runs COLUMNS run_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_spec_digest ON TABLE runs COLUMNS spec_digest;
        DEFINE INDEX IF NOT EXISTS idx_git_sha ON TABLE runs COLUMNS git_sha;
        DEFINE INDEX IF NOT EXISTS idx_created_at ON TABLE runs COLUMNS created_at;
    "#;

    db.query(sql).await?;
    info!("runs table initialized");
    Ok(())
}

/// Initialize `run_events` table
///
/// `(run_id, seq)` is unique, so a replayed append can never duplicate an
/// event.
async fn init_run_events_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing run_events table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS run_events AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_run_id_seq ON TABLE run_events COLUMNS run_id, seq UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_run_id ON TABLE run_events COLUMNS run_id;
        DEFINE INDEX IF NOT EXISTS idx_kind ON TABLE run_events COLUMNS kind;
    "#;

    db.query(sql).await?;
    info!("run_events table initialized");
    Ok(())
}

/// Initialize `scan_reports` table
///
/// One row per image digest; `max_severity` backs severity queries.
async fn init_scan_reports_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing scan_reports table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS scan_reports AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_image_digest ON TABLE scan_reports COLUMNS image_digest UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_max_severity ON TABLE scan_reports COLUMNS max_severity;
    "#;

    db.query(sql).await?;
    info!("scan_reports table initialized");
    Ok(())
}

/// Initialize `deployments` table (append-only)
async fn init_deployments_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing deployments table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS deployments AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_environment ON TABLE deployments COLUMNS environment;
        DEFINE INDEX IF NOT EXISTS idx_environment_deployed_at ON TABLE deployments COLUMNS environment, deployed_at;
    "#;

    db.query(sql).await?;
    info!("deployments table initialized");
    Ok(())
}
