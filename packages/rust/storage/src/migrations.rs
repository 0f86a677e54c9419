//! SQL migration definitions for the vaultgate state database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as one batch.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: documents, work units, artifacts, staging, vault, index, WAL",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Ingested source documents (immutable)
CREATE TABLE IF NOT EXISTS source_documents (
    fingerprint   TEXT PRIMARY KEY,
    original_path TEXT NOT NULL,
    blob_ref      TEXT NOT NULL,
    size_bytes    INTEGER NOT NULL,
    ingested_at   TEXT NOT NULL
);

-- One row per phase attempt
CREATE TABLE IF NOT EXISTS work_units (
    id          TEXT PRIMARY KEY,
    document    TEXT NOT NULL,
    phase       INTEGER NOT NULL CHECK (phase IN (1, 2)),
    subject     TEXT NOT NULL,
    attempt     INTEGER NOT NULL,
    status      TEXT NOT NULL CHECK (status IN ('queued','running','staged','approved','rejected','failed')),
    input_ref   TEXT NOT NULL,
    note        TEXT,
    error       TEXT,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    UNIQUE(subject, phase, attempt)
);

CREATE INDEX IF NOT EXISTS idx_work_units_document ON work_units(document);
CREATE INDEX IF NOT EXISTS idx_work_units_status ON work_units(phase, status);

-- At most one running unit per (subject, phase)
CREATE UNIQUE INDEX IF NOT EXISTS idx_work_units_one_running
    ON work_units(subject, phase) WHERE status = 'running';

-- Phase outputs
CREATE TABLE IF NOT EXISTS artifacts (
    id           TEXT PRIMARY KEY,
    work_unit_id TEXT NOT NULL,
    document     TEXT NOT NULL,
    phase        INTEGER NOT NULL,
    ordinal      INTEGER NOT NULL,
    fingerprint  TEXT NOT NULL,
    payload_ref  TEXT NOT NULL,
    title        TEXT,
    category     TEXT,
    created_at   TEXT NOT NULL,
    UNIQUE(work_unit_id, ordinal)
);

CREATE INDEX IF NOT EXISTS idx_artifacts_document ON artifacts(document);

-- Current bucket of every staged artifact (exactly one row per artifact)
CREATE TABLE IF NOT EXISTS staging (
    artifact_id TEXT PRIMARY KEY,
    phase       INTEGER NOT NULL,
    bucket      TEXT NOT NULL CHECK (bucket IN ('pending','approved','rejected')),
    note        TEXT,
    updated_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_staging_bucket ON staging(phase, bucket);

-- Completed promotions (phase 1: target is a phase-2 work unit, phase 2: a vault id)
CREATE TABLE IF NOT EXISTS promotions (
    artifact_id TEXT PRIMARY KEY,
    phase       INTEGER NOT NULL,
    target      TEXT NOT NULL,
    op_id       TEXT NOT NULL,
    promoted_at TEXT NOT NULL
);

-- Permanent vault registry (content-addressed, immutable)
CREATE TABLE IF NOT EXISTS vault_artifacts (
    id                 TEXT PRIMARY KEY,
    source_artifact_id TEXT NOT NULL,
    document           TEXT NOT NULL,
    category           TEXT NOT NULL,
    title              TEXT NOT NULL,
    slug               TEXT NOT NULL,
    path               TEXT NOT NULL,
    fingerprint        TEXT NOT NULL,
    supersedes         TEXT,
    created_at         TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_vault_slug ON vault_artifacts(category, slug);

-- Derived vector entries (one per vault artifact)
CREATE TABLE IF NOT EXISTS index_entries (
    vault_artifact_id TEXT PRIMARY KEY,
    index_partition   TEXT NOT NULL CHECK (index_partition IN ('chunk','artifact')),
    model             TEXT NOT NULL,
    dims              INTEGER NOT NULL,
    embedding         BLOB NOT NULL,
    content_hash      TEXT NOT NULL,
    indexed_at        TEXT NOT NULL
);

-- Durable log: append-only begin and terminal records
CREATE TABLE IF NOT EXISTS wal_entries (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    op_id       TEXT NOT NULL,
    kind        TEXT NOT NULL,
    target      TEXT NOT NULL,
    detail      TEXT,
    event       TEXT NOT NULL CHECK (event IN ('begin','completed','failed')),
    reason      TEXT,
    recorded_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_wal_one_begin
    ON wal_entries(op_id) WHERE event = 'begin';
CREATE UNIQUE INDEX IF NOT EXISTS idx_wal_one_terminal
    ON wal_entries(op_id) WHERE event <> 'begin';
CREATE INDEX IF NOT EXISTS idx_wal_kind_target ON wal_entries(kind, target);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Operation owners and process leases",
            sql: r#"
ALTER TABLE wal_entries ADD COLUMN owner TEXT;

-- One row per read-write process; an expired or missing lease means the
-- process is gone and its in-doubt operations can be recovered.
CREATE TABLE IF NOT EXISTS leases (
    owner       TEXT PRIMARY KEY,
    pid         INTEGER NOT NULL,
    acquired_at TEXT NOT NULL,
    expires_at  TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
