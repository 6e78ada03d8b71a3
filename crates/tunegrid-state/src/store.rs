//! JobStore — SQLite persistence for sessions, machines, and jobs.
//!
//! One `JobStore` per OS process; every process opens the same database
//! file. Writes that must serialize across processes run in
//! `BEGIN IMMEDIATE` transactions so the write lock is taken up front and
//! contention surfaces as [`StateError::Busy`] instead of a stale snapshot.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params, params_from_iter};
use tracing::{debug, info};

use crate::claim::{ClaimMode, ClaimSelector, WorkerTag};
use crate::error::{StateError, StateResult};
use crate::schema::{CACHE_PREFIX, JOB_COLUMNS, SCHEMA};
use crate::types::*;

/// Thread-safe handle on the shared job database.
#[derive(Clone)]
pub struct JobStore {
    conn: Arc<Mutex<Connection>>,
}

impl JobStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path, busy_timeout: Duration) -> StateResult<Self> {
        let conn = Connection::open(path).map_err(|e| StateError::Open(e.to_string()))?;
        conn.busy_timeout(busy_timeout)
            .map_err(|e| StateError::Open(e.to_string()))?;
        // WAL lets readers proceed while a claim holds the write lock.
        let mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(|e| StateError::Open(e.to_string()))?;
        let store = Self::init(conn)?;
        debug!(?path, journal_mode = %mode, "job store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| StateError::Open(e.to_string()))?;
        let store = Self::init(conn)?;
        debug!("in-memory job store opened");
        Ok(store)
    }

    fn init(conn: Connection) -> StateResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| StateError::Open(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| StateError::Open(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> StateResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StateError::Query("job store mutex poisoned".to_string()))
    }

    // ── Sessions ───────────────────────────────────────────────────

    /// Return the id of the session matching this tuple, creating it if needed.
    pub fn get_or_insert_session(&self, session: &TuningSession) -> StateResult<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO session (arch, num_cu, rocm_v, miopen_v, docker, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session.arch,
                session.num_cu,
                session.rocm_v,
                session.miopen_v,
                session.docker,
                session.reason,
                epoch_secs(),
            ],
        )?;
        let id = conn.query_row(
            "SELECT id FROM session
             WHERE arch = ?1 AND num_cu = ?2 AND rocm_v = ?3 AND miopen_v = ?4 AND docker = ?5",
            params![
                session.arch,
                session.num_cu,
                session.rocm_v,
                session.miopen_v,
                session.docker,
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_session(&self, id: i64) -> StateResult<Option<TuningSession>> {
        let conn = self.lock()?;
        let session = conn
            .query_row(
                "SELECT id, arch, num_cu, rocm_v, miopen_v, docker, reason FROM session WHERE id = ?1",
                params![id],
                |row| {
                    Ok(TuningSession {
                        id: row.get(0)?,
                        arch: row.get(1)?,
                        num_cu: row.get(2)?,
                        rocm_v: row.get(3)?,
                        miopen_v: row.get(4)?,
                        docker: row.get(5)?,
                        reason: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(session)
    }

    // ── Machines ───────────────────────────────────────────────────

    /// Insert a machine; the record's `id` is ignored and the new id returned.
    pub fn insert_machine(&self, machine: &MachineRecord) -> StateResult<i64> {
        let conn = self.lock()?;
        let ipmi = machine.ipmi.as_ref();
        conn.execute(
            "INSERT INTO machine (hostname, port, user, keyfile, arch, num_cu, avail_gpus, sclk, mclk,
                                  available, ipmi_ip, ipmi_port, ipmi_user, ipmi_password,
                                  ipmi_inaccessible, remarks)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                machine.hostname,
                machine.port,
                machine.user,
                machine.keyfile,
                machine.arch,
                machine.num_cu,
                machine.avail_gpus_column(),
                machine.sclk,
                machine.mclk,
                machine.available,
                ipmi.map(|i| i.ip.as_str()),
                ipmi.and_then(|i| i.port),
                ipmi.map(|i| i.user.as_str()),
                ipmi.map(|i| i.password.as_str()),
                machine.ipmi_inaccessible,
                machine.remarks,
            ],
        )?;
        let id = conn.last_insert_rowid();
        info!(machine_id = id, hostname = %machine.hostname, "machine registered");
        Ok(id)
    }

    pub fn get_machine(&self, id: i64) -> StateResult<Option<MachineRecord>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {MACHINE_COLUMNS} FROM machine WHERE id = ?1");
        let machine = conn.query_row(&sql, params![id], map_machine).optional()?;
        Ok(machine)
    }

    /// List machines, optionally only those flagged `available`.
    pub fn list_machines(&self, only_available: bool) -> StateResult<Vec<MachineRecord>> {
        let conn = self.lock()?;
        let sql = if only_available {
            format!("SELECT {MACHINE_COLUMNS} FROM machine WHERE available = 1 ORDER BY id")
        } else {
            format!("SELECT {MACHINE_COLUMNS} FROM machine ORDER BY id")
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], map_machine)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ── Jobs ───────────────────────────────────────────────────────

    /// Insert one job in state `new`.
    pub fn insert_job(&self, job: &NewJob) -> StateResult<i64> {
        Ok(self.insert_jobs(std::slice::from_ref(job))?[0])
    }

    /// Insert a batch of `new` jobs in one transaction, returning their ids in order.
    pub fn insert_jobs(&self, jobs: &[NewJob]) -> StateResult<Vec<i64>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = epoch_secs();
        let mut ids = Vec::with_capacity(jobs.len());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO job (session, config, solver, reason, fin_step, insert_ts, update_ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            )?;
            for job in jobs {
                stmt.execute(params![
                    job.session,
                    job.config,
                    job.solver,
                    job.reason,
                    job.fin_step,
                    now
                ])?;
                ids.push(tx.last_insert_rowid());
            }
        }
        tx.commit()?;
        debug!(count = ids.len(), "jobs inserted");
        Ok(ids)
    }

    pub fn get_job(&self, id: i64) -> StateResult<Option<Job>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {JOB_COLUMNS} FROM job WHERE id = ?1");
        let job = conn.query_row(&sql, params![id], map_job).optional()?;
        Ok(job)
    }

    /// Atomically move up to `batch` eligible rows from `source` to `target`,
    /// oldest id first, stamping them with `tag`.
    ///
    /// Returns the number of rows captured (or, under [`ClaimMode::DryRun`],
    /// the number that would be). Zero means the queue is drained for this
    /// selector; no row is written in that case.
    pub fn claim(
        &self,
        source: JobState,
        target: JobState,
        batch: u32,
        selector: &ClaimSelector,
        tag: WorkerTag,
        mode: ClaimMode,
    ) -> StateResult<usize> {
        if batch == 0 {
            return Ok(0);
        }

        let mut conn = self.lock()?;

        if mode == ClaimMode::DryRun {
            let mut params = Vec::new();
            let predicate = selector.predicate(source, &mut params);
            params.push(Value::Integer(i64::from(batch)));
            let sql = format!(
                "SELECT COUNT(*) FROM (SELECT id FROM job WHERE {predicate} ORDER BY id ASC LIMIT ?)"
            );
            let count: i64 = conn.query_row(&sql, params_from_iter(params), |row| row.get(0))?;
            return Ok(count as usize);
        }

        let now = epoch_secs();
        let stamp: String;
        let mut sets = vec!["state = ?", "machine_id = ?", "gpu_id = ?", "update_ts = ?"];
        let mut params = vec![
            Value::Text(target.as_str().to_string()),
            Value::Integer(tag.machine_id),
            Value::Integer(tag.gpu_id),
            Value::Integer(now),
        ];
        if let Some(column) = target.timestamp_column() {
            stamp = format!("{column} = ?");
            sets.push(&stamp);
            params.push(Value::Integer(now));
        }
        if target.allocates_cache() {
            sets.push("cache_loc = ? || lower(hex(randomblob(5)))");
            params.push(Value::Text(CACHE_PREFIX.to_string()));
        }

        // The outer `state = ?` re-checks the source under the write lock.
        params.push(Value::Text(source.as_str().to_string()));
        let predicate = selector.predicate(source, &mut params);
        params.push(Value::Integer(i64::from(batch)));

        let sql = format!(
            "UPDATE job SET {} WHERE state = ? AND id IN \
             (SELECT id FROM job WHERE {predicate} ORDER BY id ASC LIMIT ?)",
            sets.join(", ")
        );

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let claimed = tx.execute(&sql, params_from_iter(params))?;
        tx.commit()?;

        debug!(%tag, %source, %target, batch, claimed, "claim executed");
        Ok(claimed)
    }

    /// Rows in `state` owned by `tag`, oldest first.
    ///
    /// Safe to call repeatedly; it only reads this worker's own rows.
    pub fn claimed_jobs(&self, state: JobState, tag: WorkerTag) -> StateResult<Vec<Job>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM job
             WHERE state = ?1 AND machine_id = ?2 AND gpu_id = ?3
             ORDER BY id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![state.as_str(), tag.machine_id, tag.gpu_id], map_job)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Write back a state transition for a job still owned by `tag`.
    ///
    /// Returns `false` if the row no longer belongs to `tag` (it was
    /// requeued and re-claimed elsewhere) or has left `update.expect`, in
    /// which case nothing is written.
    pub fn finalize_job(&self, job_id: i64, tag: WorkerTag, update: &JobUpdate) -> StateResult<bool> {
        let stamp: String;
        let mut sets = vec!["update_ts = ?"];
        let now = epoch_secs();
        let mut params = vec![Value::Integer(now)];

        if let Some(state) = update.state {
            sets.push("state = ?");
            params.push(Value::Text(state.as_str().to_string()));
            if let Some(column) = state.timestamp_column() {
                stamp = format!("{column} = ?");
                sets.push(&stamp);
                params.push(Value::Integer(now));
            }
        }
        if let Some(result) = &update.result {
            sets.push("result = ?");
            params.push(Value::Text(result.clone()));
        }
        if update.increment_retries {
            sets.push("retries = retries + 1");
        }

        params.push(Value::Integer(job_id));
        params.push(Value::Integer(tag.machine_id));
        params.push(Value::Integer(tag.gpu_id));
        let mut sql = format!(
            "UPDATE job SET {} WHERE id = ? AND machine_id = ? AND gpu_id = ?",
            sets.join(", ")
        );
        if let Some(expect) = update.expect {
            sql.push_str(" AND state = ?");
            params.push(Value::Text(expect.as_str().to_string()));
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let updated = tx.execute(&sql, params_from_iter(params))?;
        tx.commit()?;

        debug!(job_id, %tag, state = ?update.state, updated, "job finalized");
        Ok(updated == 1)
    }

    /// Move every job `tag` holds in one of `states` back to its last
    /// known-good state (see [`JobState::requeue_target`]).
    ///
    /// Retries are not touched; running it twice is the same as once.
    pub fn requeue_in_flight(&self, tag: WorkerTag, states: &[JobState]) -> StateResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = epoch_secs();
        let mut moved = 0;
        for state in states {
            let Some(back_to) = state.requeue_target() else {
                continue;
            };
            moved += tx.execute(
                "UPDATE job SET state = ?1, update_ts = ?2
                 WHERE machine_id = ?3 AND gpu_id = ?4 AND state = ?5",
                params![back_to.as_str(), now, tag.machine_id, tag.gpu_id, state.as_str()],
            )?;
        }
        tx.commit()?;
        if moved > 0 {
            info!(%tag, moved, "in-flight jobs requeued");
        }
        Ok(moved)
    }

    /// Number of valid jobs per state for a session.
    pub fn count_by_state(&self, session: i64) -> StateResult<BTreeMap<JobState, u64>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT state, COUNT(*) FROM job WHERE session = ?1 AND valid = 1 GROUP BY state",
        )?;
        let rows = stmt.query_map(params![session], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let (state, count) = row?;
            let state = state.parse::<JobState>().map_err(StateError::Decode)?;
            counts.insert(state, count as u64);
        }
        Ok(counts)
    }
}

const MACHINE_COLUMNS: &str = "id, hostname, port, user, keyfile, arch, num_cu, avail_gpus, sclk, mclk, \
     available, ipmi_ip, ipmi_port, ipmi_user, ipmi_password, ipmi_inaccessible, remarks";

fn map_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let state: String = row.get(4)?;
    let state = state.parse::<JobState>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, Type::Text, e.into())
    })?;
    Ok(Job {
        id: row.get(0)?,
        session: row.get(1)?,
        config: row.get(2)?,
        solver: row.get(3)?,
        state,
        valid: row.get(5)?,
        reason: row.get(6)?,
        fin_step: row.get(7)?,
        retries: row.get(8)?,
        result: row.get(9)?,
        cache_loc: row.get(10)?,
        machine_id: row.get(11)?,
        gpu_id: row.get(12)?,
        compile_start: opt_secs(row, 13)?,
        compile_end: opt_secs(row, 14)?,
        eval_start: opt_secs(row, 15)?,
        eval_end: opt_secs(row, 16)?,
    })
}

fn map_machine(row: &Row<'_>) -> rusqlite::Result<MachineRecord> {
    let avail: String = row.get(7)?;
    let ipmi_ip: Option<String> = row.get(11)?;
    let ipmi_user: Option<String> = row.get(13)?;
    let ipmi_password: Option<String> = row.get(14)?;
    let ipmi = match (ipmi_ip, ipmi_user, ipmi_password) {
        (Some(ip), Some(user), Some(password)) => Some(IpmiCredentials {
            ip,
            port: row.get(12)?,
            user,
            password,
        }),
        _ => None,
    };
    Ok(MachineRecord {
        id: row.get(0)?,
        hostname: row.get(1)?,
        port: row.get(2)?,
        user: row.get(3)?,
        keyfile: row.get(4)?,
        arch: row.get(5)?,
        num_cu: row.get(6)?,
        avail_gpus: parse_gpu_list(&avail),
        sclk: row.get(8)?,
        mclk: row.get(9)?,
        available: row.get(10)?,
        ipmi,
        ipmi_inaccessible: row.get(15)?,
        remarks: row.get(16)?,
    })
}

fn opt_secs(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<u64>> {
    let v: Option<i64> = row.get(idx)?;
    Ok(v.map(|s| s.max(0) as u64))
}

/// Current Unix epoch in seconds.
fn epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session() -> TuningSession {
        TuningSession {
            id: 0,
            arch: "gfx90a".to_string(),
            num_cu: 104,
            rocm_v: "6.1.0".to_string(),
            miopen_v: "3.1.0".to_string(),
            docker: "miopentuna".to_string(),
            reason: None,
        }
    }

    fn test_machine(hostname: &str, available: bool) -> MachineRecord {
        MachineRecord {
            id: 0,
            hostname: hostname.to_string(),
            port: 22,
            user: "tuna".to_string(),
            keyfile: None,
            arch: "gfx90a".to_string(),
            num_cu: 104,
            avail_gpus: vec![0, 1, 2, 3],
            sclk: Some(7),
            mclk: None,
            available,
            ipmi: None,
            ipmi_inaccessible: false,
            remarks: None,
        }
    }

    fn seeded(n: usize) -> (JobStore, i64, Vec<i64>) {
        let store = JobStore::open_in_memory().unwrap();
        let session = store.get_or_insert_session(&test_session()).unwrap();
        let jobs: Vec<NewJob> = (0..n).map(|i| NewJob::new(session, i as i64 + 100)).collect();
        let ids = store.insert_jobs(&jobs).unwrap();
        (store, session, ids)
    }

    const ME: WorkerTag = WorkerTag {
        machine_id: 1,
        gpu_id: 0,
    };

    // ── Sessions / machines ────────────────────────────────────────

    #[test]
    fn session_tuple_is_unique() {
        let store = JobStore::open_in_memory().unwrap();
        let a = store.get_or_insert_session(&test_session()).unwrap();
        let b = store.get_or_insert_session(&test_session()).unwrap();
        assert_eq!(a, b);

        let mut other = test_session();
        other.num_cu = 110;
        let c = store.get_or_insert_session(&other).unwrap();
        assert_ne!(a, c);

        let fetched = store.get_session(a).unwrap().unwrap();
        assert_eq!(fetched.arch, "gfx90a");
        assert_eq!(fetched.num_cu, 104);
    }

    #[test]
    fn machine_put_and_list() {
        let store = JobStore::open_in_memory().unwrap();
        let a = store.insert_machine(&test_machine("node-a", true)).unwrap();
        store.insert_machine(&test_machine("node-b", false)).unwrap();

        let machine = store.get_machine(a).unwrap().unwrap();
        assert_eq!(machine.avail_gpus, vec![0, 1, 2, 3]);
        assert_eq!(machine.sclk, Some(7));
        assert!(machine.ipmi.is_none());

        assert_eq!(store.list_machines(false).unwrap().len(), 2);
        let available = store.list_machines(true).unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].hostname, "node-a");
    }

    #[test]
    fn machine_ipmi_roundtrip() {
        let store = JobStore::open_in_memory().unwrap();
        let mut record = test_machine("node-c", true);
        record.ipmi = Some(IpmiCredentials {
            ip: "10.0.0.9".to_string(),
            port: Some(623),
            user: "admin".to_string(),
            password: "secret".to_string(),
        });
        let id = store.insert_machine(&record).unwrap();
        let fetched = store.get_machine(id).unwrap().unwrap();
        assert_eq!(fetched.ipmi, record.ipmi);
    }

    // ── Claim ──────────────────────────────────────────────────────

    #[test]
    fn claim_takes_oldest_first() {
        let (store, session, ids) = seeded(6);
        let selector = ClaimSelector::new(session);

        let n = store
            .claim(JobState::New, JobState::CompileStart, 3, &selector, ME, ClaimMode::Commit)
            .unwrap();
        assert_eq!(n, 3);

        let mine = store.claimed_jobs(JobState::CompileStart, ME).unwrap();
        let got: Vec<i64> = mine.iter().map(|j| j.id).collect();
        assert_eq!(got, ids[..3].to_vec());
        for job in &mine {
            assert_eq!(job.machine_id, 1);
            assert_eq!(job.gpu_id, 0);
            assert!(job.compile_start.is_some());
            assert!(job.cache_loc.as_deref().unwrap().starts_with(CACHE_PREFIX));
        }
    }

    #[test]
    fn claim_exhaustion_returns_zero() {
        let (store, session, _) = seeded(2);
        let selector = ClaimSelector::new(session);
        let first = store
            .claim(JobState::New, JobState::CompileStart, 5, &selector, ME, ClaimMode::Commit)
            .unwrap();
        assert_eq!(first, 2);

        let again = store
            .claim(JobState::New, JobState::CompileStart, 5, &selector, ME, ClaimMode::Commit)
            .unwrap();
        assert_eq!(again, 0);
        assert_eq!(store.claimed_jobs(JobState::CompileStart, ME).unwrap().len(), 2);
    }

    #[test]
    fn claimed_jobs_never_shows_other_workers() {
        let (store, session, _) = seeded(4);
        let selector = ClaimSelector::new(session);
        let other = WorkerTag::new(1, 1);

        store
            .claim(JobState::New, JobState::CompileStart, 2, &selector, ME, ClaimMode::Commit)
            .unwrap();
        store
            .claim(JobState::New, JobState::CompileStart, 2, &selector, other, ClaimMode::Commit)
            .unwrap();

        let mine = store.claimed_jobs(JobState::CompileStart, ME).unwrap();
        let theirs = store.claimed_jobs(JobState::CompileStart, other).unwrap();
        assert_eq!(mine.len(), 2);
        assert_eq!(theirs.len(), 2);
        assert!(mine.iter().all(|j| theirs.iter().all(|t| t.id != j.id)));
    }

    #[test]
    fn dry_run_counts_without_writing() {
        let (store, session, _) = seeded(5);
        let selector = ClaimSelector::new(session);
        let n = store
            .claim(JobState::New, JobState::CompileStart, 3, &selector, ME, ClaimMode::DryRun)
            .unwrap();
        assert_eq!(n, 3);
        assert!(store.claimed_jobs(JobState::CompileStart, ME).unwrap().is_empty());
        assert_eq!(store.count_by_state(session).unwrap()[&JobState::New], 5);
    }

    #[test]
    fn claim_honors_selector_filters() {
        let store = JobStore::open_in_memory().unwrap();
        let session = store.get_or_insert_session(&test_session()).unwrap();
        let mut labeled = NewJob::new(session, 1);
        labeled.reason = "nightly".to_string();
        labeled.fin_step = "miopen_perf_compile,miopen_perf_eval".to_string();
        let plain = NewJob::new(session, 2);
        let ids = store.insert_jobs(&[plain, labeled]).unwrap();

        let selector = ClaimSelector::new(session)
            .with_reason("nightly")
            .with_fin_step("miopen_perf_eval");
        let n = store
            .claim(JobState::New, JobState::CompileStart, 10, &selector, ME, ClaimMode::Commit)
            .unwrap();
        assert_eq!(n, 1);
        let mine = store.claimed_jobs(JobState::CompileStart, ME).unwrap();
        assert_eq!(mine[0].id, ids[1]);
    }

    #[test]
    fn claim_skips_invalid_and_exhausted_rows() {
        let (store, session, ids) = seeded(3);
        {
            let conn = store.lock().unwrap();
            conn.execute("UPDATE job SET valid = 0 WHERE id = ?1", params![ids[0]])
                .unwrap();
            conn.execute("UPDATE job SET retries = 10 WHERE id = ?1", params![ids[1]])
                .unwrap();
        }
        let selector = ClaimSelector::new(session).with_max_retries(10);
        let n = store
            .claim(JobState::New, JobState::CompileStart, 3, &selector, ME, ClaimMode::Commit)
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(store.claimed_jobs(JobState::CompileStart, ME).unwrap()[0].id, ids[2]);
    }

    #[test]
    fn zero_batch_claims_nothing() {
        let (store, session, _) = seeded(2);
        let n = store
            .claim(
                JobState::New,
                JobState::CompileStart,
                0,
                &ClaimSelector::new(session),
                ME,
                ClaimMode::Commit,
            )
            .unwrap();
        assert_eq!(n, 0);
    }

    // ── Finalize / requeue ─────────────────────────────────────────

    #[test]
    fn finalize_success_stamps_end() {
        let (store, session, ids) = seeded(1);
        store
            .claim(JobState::New, JobState::CompileStart, 1, &ClaimSelector::new(session), ME, ClaimMode::Commit)
            .unwrap();

        assert!(store.finalize_job(ids[0], ME, &JobUpdate::to(JobState::Compiling)).unwrap());
        assert!(store.finalize_job(ids[0], ME, &JobUpdate::to(JobState::Compiled)).unwrap());

        let job = store.get_job(ids[0]).unwrap().unwrap();
        assert_eq!(job.state, JobState::Compiled);
        assert!(job.compile_end.is_some());
        assert_eq!(job.retries, 0);
    }

    #[test]
    fn finalize_failure_increments_retries() {
        let (store, session, ids) = seeded(1);
        store
            .claim(JobState::New, JobState::CompileStart, 1, &ClaimSelector::new(session), ME, ClaimMode::Commit)
            .unwrap();
        let update = JobUpdate::to(JobState::CompileError)
            .with_result("fin exited 1")
            .failed();
        assert!(store.finalize_job(ids[0], ME, &update).unwrap());

        let job = store.get_job(ids[0]).unwrap().unwrap();
        assert_eq!(job.state, JobState::CompileError);
        assert_eq!(job.retries, 1);
        assert_eq!(job.result.as_deref(), Some("fin exited 1"));
    }

    #[test]
    fn finalize_rejects_foreign_owner() {
        let (store, session, ids) = seeded(1);
        store
            .claim(JobState::New, JobState::CompileStart, 1, &ClaimSelector::new(session), ME, ClaimMode::Commit)
            .unwrap();
        let stranger = WorkerTag::new(9, 9);
        assert!(!store.finalize_job(ids[0], stranger, &JobUpdate::to(JobState::Errored)).unwrap());
        assert_eq!(store.get_job(ids[0]).unwrap().unwrap().state, JobState::CompileStart);
    }

    #[test]
    fn finalize_respects_expected_state() {
        let (store, session, ids) = seeded(1);
        store
            .claim(JobState::New, JobState::CompileStart, 1, &ClaimSelector::new(session), ME, ClaimMode::Commit)
            .unwrap();
        let start = JobUpdate::to(JobState::Compiling).from_state(JobState::CompileStart);
        assert!(store.finalize_job(ids[0], ME, &start).unwrap());
        // A second start from the same owner finds the row already moved.
        assert!(!store.finalize_job(ids[0], ME, &start).unwrap());
        assert_eq!(store.get_job(ids[0]).unwrap().unwrap().state, JobState::Compiling);
    }

    #[test]
    fn requeue_is_idempotent() {
        let (store, session, ids) = seeded(3);
        let selector = ClaimSelector::new(session);
        // Drive all three to compiled, then claim two for evaluation.
        store
            .claim(JobState::New, JobState::Compiled, 3, &selector, ME, ClaimMode::Commit)
            .unwrap();
        store
            .claim(JobState::Compiled, JobState::EvalStart, 2, &selector, ME, ClaimMode::Commit)
            .unwrap();
        store.finalize_job(ids[0], ME, &JobUpdate::to(JobState::Evaluating)).unwrap();

        let in_flight = [JobState::EvalStart, JobState::Evaluating];
        assert_eq!(store.requeue_in_flight(ME, &in_flight).unwrap(), 2);
        let once: Vec<Job> = ids.iter().map(|id| store.get_job(*id).unwrap().unwrap()).collect();

        assert_eq!(store.requeue_in_flight(ME, &in_flight).unwrap(), 0);
        let twice: Vec<Job> = ids.iter().map(|id| store.get_job(*id).unwrap().unwrap()).collect();

        let strip = |jobs: &[Job]| -> Vec<(JobState, u32)> {
            jobs.iter().map(|j| (j.state, j.retries)).collect()
        };
        assert_eq!(strip(&once), strip(&twice));
        assert!(once.iter().all(|j| j.state == JobState::Compiled && j.retries == 0));
    }

    #[test]
    fn requeue_leaves_other_workers_alone() {
        let (store, session, _) = seeded(2);
        let selector = ClaimSelector::new(session);
        let other = WorkerTag::new(2, 0);
        store
            .claim(JobState::New, JobState::CompileStart, 1, &selector, ME, ClaimMode::Commit)
            .unwrap();
        store
            .claim(JobState::New, JobState::CompileStart, 1, &selector, other, ClaimMode::Commit)
            .unwrap();

        assert_eq!(store.requeue_in_flight(ME, &[JobState::CompileStart]).unwrap(), 1);
        assert_eq!(store.claimed_jobs(JobState::CompileStart, other).unwrap().len(), 1);
    }

    #[test]
    fn count_by_state_groups() {
        let (store, session, _) = seeded(4);
        store
            .claim(JobState::New, JobState::CompileStart, 1, &ClaimSelector::new(session), ME, ClaimMode::Commit)
            .unwrap();
        let counts = store.count_by_state(session).unwrap();
        assert_eq!(counts[&JobState::New], 3);
        assert_eq!(counts[&JobState::CompileStart], 1);
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tuna.db");
        let id = {
            let store = JobStore::open(&path, Duration::from_secs(1)).unwrap();
            let session = store.get_or_insert_session(&test_session()).unwrap();
            store.insert_job(&NewJob::new(session, 7)).unwrap()
        };
        let store = JobStore::open(&path, Duration::from_secs(1)).unwrap();
        let job = store.get_job(id).unwrap().unwrap();
        assert_eq!(job.config, 7);
        assert_eq!(job.state, JobState::New);
        assert_eq!(job.machine_id, -1);
    }
}
