//! SQL schema for the job store.
//!
//! Timestamps are unix seconds. `machine_id`/`gpu_id` default to -1 for
//! rows nobody has claimed yet.

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS session (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    arch        TEXT    NOT NULL,
    num_cu      INTEGER NOT NULL,
    rocm_v      TEXT    NOT NULL,
    miopen_v    TEXT    NOT NULL,
    docker      TEXT    NOT NULL,
    reason      TEXT,
    created_at  INTEGER NOT NULL,
    UNIQUE (arch, num_cu, rocm_v, miopen_v, docker)
);

CREATE TABLE IF NOT EXISTS machine (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    hostname           TEXT    NOT NULL,
    port               INTEGER NOT NULL DEFAULT 22,
    user               TEXT    NOT NULL,
    keyfile            TEXT,
    arch               TEXT    NOT NULL,
    num_cu             INTEGER NOT NULL DEFAULT 64,
    avail_gpus         TEXT    NOT NULL DEFAULT '',
    sclk               INTEGER,
    mclk               INTEGER,
    available          INTEGER NOT NULL DEFAULT 0,
    ipmi_ip            TEXT,
    ipmi_port          INTEGER,
    ipmi_user          TEXT,
    ipmi_password      TEXT,
    ipmi_inaccessible  INTEGER NOT NULL DEFAULT 0,
    remarks            TEXT
);

CREATE TABLE IF NOT EXISTS job (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    session        INTEGER NOT NULL REFERENCES session(id),
    config         INTEGER NOT NULL,
    solver         INTEGER,
    state          TEXT    NOT NULL DEFAULT 'new',
    valid          INTEGER NOT NULL DEFAULT 1,
    reason         TEXT    NOT NULL DEFAULT '',
    fin_step       TEXT    NOT NULL DEFAULT 'not_fin',
    retries        INTEGER NOT NULL DEFAULT 0,
    result         TEXT,
    cache_loc      TEXT,
    machine_id     INTEGER NOT NULL DEFAULT -1,
    gpu_id         INTEGER NOT NULL DEFAULT -1,
    compile_start  INTEGER,
    compile_end    INTEGER,
    eval_start     INTEGER,
    eval_end       INTEGER,
    insert_ts      INTEGER NOT NULL,
    update_ts      INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS job_claim_idx ON job (session, state, valid, id);
CREATE INDEX IF NOT EXISTS job_owner_idx ON job (machine_id, gpu_id, state);
";

/// Columns selected whenever a full `Job` row is read.
pub const JOB_COLUMNS: &str = "id, session, config, solver, state, valid, reason, fin_step, \
     retries, result, cache_loc, machine_id, gpu_id, compile_start, compile_end, \
     eval_start, eval_end";

/// Prefix of the per-job kernel cache directory assigned at `*_start`.
pub const CACHE_PREFIX: &str = "~/.cache/miopen_";
