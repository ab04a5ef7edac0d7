//! redb-backed store for the action queue.
//!
//! # Table design
//!
//! `ACTIVE` holds Pending and InFlight entries under a 17-byte composite key:
//! ```text
//! [ priority: u8 | triggered_at_ms: u64 big-endian | sequence: u64 big-endian ]
//! ```
//! Big-endian encoding makes byte order equal claim order, so a single
//! in-order scan visits entries by (priority asc, triggered_at asc,
//! sequence asc) — the strict total order the claim selection requires.
//!
//! `DEDUP` maps `device \x1f action_type` to the active key holding that
//! slot, enforcing at most one outstanding entry per dedup key. `HISTORY`
//! keeps a bounded log of terminal actions keyed by completion time.
//!
//! Every mutation runs inside a single write transaction. redb write
//! transactions are mutually exclusive, which is what makes `claim_next`
//! safe under concurrent callers: two claimers serialize, and the second
//! sees the entry already InFlight.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use uuid::Uuid;

use crate::action::{ActionStatus, CandidateAction, Outcome, QueuedAction};
use crate::config::QueueConfig;
use crate::error::{FlowguardError, Result};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

/// Key: 17-byte composite (priority ++ triggered_at_ms BE ++ sequence BE)
/// Value: JSON-encoded QueuedAction (Pending or InFlight only)
const ACTIVE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("active_actions");

/// Key: dedup key string; Value: the ACTIVE key holding the slot
const DEDUP: TableDefinition<&str, &[u8]> = TableDefinition::new("dedup_index");

/// Key: 24-byte composite (completed_ms BE ++ uuid); Value: JSON QueuedAction
const HISTORY: TableDefinition<&[u8], &[u8]> = TableDefinition::new("action_history");

/// Counters ("sequence")
const META: TableDefinition<&str, u64> = TableDefinition::new("queue_meta");

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

fn claim_key(priority: u8, triggered_at: DateTime<Utc>, sequence: u64) -> [u8; 17] {
    let mut key = [0u8; 17];
    key[0] = priority;
    let ms = triggered_at.timestamp_millis().max(0) as u64;
    key[1..9].copy_from_slice(&ms.to_be_bytes());
    key[9..].copy_from_slice(&sequence.to_be_bytes());
    key
}

fn action_claim_key(action: &QueuedAction) -> [u8; 17] {
    claim_key(action.priority, action.triggered_at, action.sequence)
}

fn history_key(completed_at: DateTime<Utc>, id: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = completed_at.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

fn db_err(e: impl std::fmt::Display) -> FlowguardError {
    FlowguardError::QueueDb(e.to_string())
}

// ---------------------------------------------------------------------------
// ActionQueue
// ---------------------------------------------------------------------------

/// Durable priority queue of remediation actions.
pub struct ActionQueue {
    db: Database,
    config: QueueConfig,
}

impl ActionQueue {
    /// Open or create the queue database at `path`.
    pub fn open(path: &Path, config: QueueConfig) -> Result<Self> {
        let db = Database::create(path).map_err(db_err)?;
        // Ensure all tables exist before any reads
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(ACTIVE).map_err(db_err)?;
        wt.open_table(DEDUP).map_err(db_err)?;
        wt.open_table(HISTORY).map_err(db_err)?;
        wt.open_table(META).map_err(db_err)?;
        wt.commit().map_err(db_err)?;
        Ok(Self { db, config })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Enqueue
    // -----------------------------------------------------------------------

    /// Insert a candidate, coalescing with any outstanding entry for the
    /// same `(device, action_type)`.
    ///
    /// Returns the entry id and whether a new entry was created. A coalesced
    /// candidate refreshes the outstanding entry's parameters and takes the
    /// minimum (more urgent) of the two priorities; no second entry appears.
    pub fn enqueue(&self, candidate: CandidateAction) -> Result<(Uuid, bool)> {
        let dedup = candidate.dedup_key();
        let wt = self.db.begin_write().map_err(db_err)?;
        let outcome;
        {
            let mut active = wt.open_table(ACTIVE).map_err(db_err)?;
            let mut index = wt.open_table(DEDUP).map_err(db_err)?;

            let held = index
                .get(dedup.as_str())
                .map_err(db_err)?
                .map(|v| v.value().to_vec());

            if let Some(old_key) = held {
                let existing = active
                    .get(old_key.as_slice())
                    .map_err(db_err)?
                    .map(|v| serde_json::from_slice::<QueuedAction>(v.value()))
                    .transpose()?;
                if let Some(mut entry) = existing {
                    entry.parameters = candidate.parameters;
                    let new_priority = entry.priority.min(candidate.priority);
                    if new_priority != entry.priority {
                        // Priority improved: the claim key changes, so re-key.
                        active.remove(old_key.as_slice()).map_err(db_err)?;
                        entry.priority = new_priority;
                        let new_key = action_claim_key(&entry);
                        let value = serde_json::to_vec(&entry)?;
                        active
                            .insert(new_key.as_slice(), value.as_slice())
                            .map_err(db_err)?;
                        index
                            .insert(dedup.as_str(), new_key.as_slice())
                            .map_err(db_err)?;
                    } else {
                        let value = serde_json::to_vec(&entry)?;
                        active
                            .insert(old_key.as_slice(), value.as_slice())
                            .map_err(db_err)?;
                    }
                    outcome = (entry.id, false);
                    drop(active);
                    drop(index);
                    wt.commit().map_err(db_err)?;
                    return Ok(outcome);
                }
                // Stale index entry; fall through and create fresh.
                index.remove(dedup.as_str()).map_err(db_err)?;
            }

            let mut meta = wt.open_table(META).map_err(db_err)?;
            let sequence = meta
                .get("sequence")
                .map_err(db_err)?
                .map(|v| v.value())
                .unwrap_or(0);
            meta.insert("sequence", sequence + 1).map_err(db_err)?;

            let id = Uuid::new_v4();
            let entry = QueuedAction::from_candidate(candidate, id, sequence);
            let key = action_claim_key(&entry);
            let value = serde_json::to_vec(&entry)?;
            active
                .insert(key.as_slice(), value.as_slice())
                .map_err(db_err)?;
            index
                .insert(dedup.as_str(), key.as_slice())
                .map_err(db_err)?;
            outcome = (id, true);
        }
        wt.commit().map_err(db_err)?;
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Claim
    // -----------------------------------------------------------------------

    /// Atomically claim the most urgent eligible Pending entry.
    ///
    /// Eligible means `next_eligible_at <= now` and not past the pending
    /// TTL (stale entries are left for `sweep`). The winning entry becomes
    /// InFlight with a claim timestamp. The exclusive write transaction
    /// guarantees at most one caller claims any given entry.
    pub fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<QueuedAction>> {
        let ttl = Duration::seconds(self.config.pending_ttl_secs as i64);
        let wt = self.db.begin_write().map_err(db_err)?;
        let claimed;
        {
            let mut active = wt.open_table(ACTIVE).map_err(db_err)?;

            let mut found: Option<(Vec<u8>, QueuedAction)> = None;
            for entry in active.iter().map_err(db_err)? {
                let (k, v) = entry.map_err(db_err)?;
                let action: QueuedAction = serde_json::from_slice(v.value())?;
                if action.status != ActionStatus::Pending {
                    continue;
                }
                if action.next_eligible_at > now {
                    continue;
                }
                if action.triggered_at + ttl <= now {
                    continue;
                }
                found = Some((k.value().to_vec(), action));
                break;
            }

            claimed = match found {
                Some((key, mut action)) => {
                    action.status = ActionStatus::InFlight;
                    action.claimed_at = Some(now);
                    let value = serde_json::to_vec(&action)?;
                    active
                        .insert(key.as_slice(), value.as_slice())
                        .map_err(db_err)?;
                    Some(action)
                }
                None => None,
            };
        }
        wt.commit().map_err(db_err)?;
        Ok(claimed)
    }

    // -----------------------------------------------------------------------
    // Complete
    // -----------------------------------------------------------------------

    /// Record the dispatcher's verdict for a claimed action.
    ///
    /// Only an InFlight entry may be completed. Anything else means the
    /// claim bookkeeping broke; the entry is forced to terminal `Failed`
    /// (so it cannot wedge the dedup slot) and `InvariantViolation` is
    /// returned for the caller to surface loudly.
    pub fn complete(&self, id: Uuid, outcome: Outcome) -> Result<QueuedAction> {
        let now = Utc::now();
        let wt = self.db.begin_write().map_err(db_err)?;
        let result;
        {
            let mut active = wt.open_table(ACTIVE).map_err(db_err)?;
            let mut index = wt.open_table(DEDUP).map_err(db_err)?;
            let mut history = wt.open_table(HISTORY).map_err(db_err)?;

            let mut found: Option<(Vec<u8>, QueuedAction)> = None;
            for entry in active.iter().map_err(db_err)? {
                let (k, v) = entry.map_err(db_err)?;
                let action: QueuedAction = serde_json::from_slice(v.value())?;
                if action.id == id {
                    found = Some((k.value().to_vec(), action));
                    break;
                }
            }
            let (key, mut action) = found.ok_or(FlowguardError::ActionNotFound(id))?;

            if action.status != ActionStatus::InFlight {
                let detail = format!(
                    "complete({id}) on {:?} entry for {} / {}",
                    action.status, action.device, action.action_type
                );
                action.status = ActionStatus::Failed;
                action.last_error = Some(format!("invariant violation: {detail}"));
                action.completed_at = Some(now);
                Self::retire(&mut active, &mut index, &mut history, &key, &action)?;
                Self::prune_history(&mut history, self.config.history_limit)?;
                drop(active);
                drop(index);
                drop(history);
                wt.commit().map_err(db_err)?;
                return Err(FlowguardError::InvariantViolation(detail));
            }

            action.attempts += 1;
            match outcome {
                Outcome::Success(value) => {
                    action.status = ActionStatus::Succeeded;
                    action.completed_at = Some(now);
                    action.last_error = None;
                    action.result = Some(value);
                    Self::retire(&mut active, &mut index, &mut history, &key, &action)?;
                }
                Outcome::Retryable(reason) => {
                    action.last_error = Some(reason);
                    if action.attempts < self.config.max_attempts {
                        action.status = ActionStatus::Pending;
                        action.claimed_at = None;
                        action.next_eligible_at = now + self.backoff(action.attempts);
                        let value = serde_json::to_vec(&action)?;
                        active
                            .insert(key.as_slice(), value.as_slice())
                            .map_err(db_err)?;
                    } else {
                        action.status = ActionStatus::Failed;
                        action.completed_at = Some(now);
                        Self::retire(&mut active, &mut index, &mut history, &key, &action)?;
                    }
                }
                Outcome::Fatal(reason) => {
                    action.status = ActionStatus::Failed;
                    action.last_error = Some(reason);
                    action.completed_at = Some(now);
                    Self::retire(&mut active, &mut index, &mut history, &key, &action)?;
                }
            }
            Self::prune_history(&mut history, self.config.history_limit)?;
            result = action;
        }
        wt.commit().map_err(db_err)?;
        Ok(result)
    }

    /// Exponential retry delay: base doubling per attempt, capped, shaved
    /// by up to 10% jitter so retries from a burst don't land on the same
    /// tick. The cap is a hard upper bound, jitter included.
    fn backoff(&self, attempts: u32) -> Duration {
        let base = self.config.backoff_base_secs.max(1);
        let exp = attempts.saturating_sub(1).min(31);
        let secs = base
            .saturating_mul(1u64 << exp)
            .min(self.config.backoff_cap_secs);
        let millis = secs.saturating_mul(1000);
        let jitter = rand::thread_rng().gen_range(0..=millis / 10);
        Duration::milliseconds(millis.saturating_sub(jitter) as i64)
    }

    /// Move a terminal entry out of the active ordering and into history,
    /// releasing its dedup slot.
    fn retire(
        active: &mut redb::Table<&[u8], &[u8]>,
        index: &mut redb::Table<&str, &[u8]>,
        history: &mut redb::Table<&[u8], &[u8]>,
        key: &[u8],
        action: &QueuedAction,
    ) -> Result<()> {
        active.remove(key).map_err(db_err)?;
        index.remove(action.dedup_key().as_str()).map_err(db_err)?;
        let hkey = history_key(action.completed_at.unwrap_or_else(Utc::now), action.id);
        let value = serde_json::to_vec(action)?;
        history
            .insert(hkey.as_slice(), value.as_slice())
            .map_err(db_err)?;
        Ok(())
    }

    fn prune_history(history: &mut redb::Table<&[u8], &[u8]>, limit: u64) -> Result<()> {
        let len = history.len().map_err(db_err)?;
        if len <= limit {
            return Ok(());
        }
        let excess = (len - limit) as usize;
        let doomed: Vec<Vec<u8>> = history
            .iter()
            .map_err(db_err)?
            .take(excess)
            .map(|entry| entry.map(|(k, _)| k.value().to_vec()).map_err(db_err))
            .collect::<Result<_>>()?;
        for key in doomed {
            history.remove(key.as_slice()).map_err(db_err)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sweep / drain
    // -----------------------------------------------------------------------

    /// Expire Pending entries older than the TTL; the policy conditions
    /// that triggered them may no longer hold. Returns the expired actions
    /// so the caller can publish alerts.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<QueuedAction>> {
        let ttl = Duration::seconds(self.config.pending_ttl_secs as i64);
        let wt = self.db.begin_write().map_err(db_err)?;
        let mut expired = Vec::new();
        {
            let mut active = wt.open_table(ACTIVE).map_err(db_err)?;
            let mut index = wt.open_table(DEDUP).map_err(db_err)?;
            let mut history = wt.open_table(HISTORY).map_err(db_err)?;

            let mut stale: Vec<(Vec<u8>, QueuedAction)> = Vec::new();
            for entry in active.iter().map_err(db_err)? {
                let (k, v) = entry.map_err(db_err)?;
                let action: QueuedAction = serde_json::from_slice(v.value())?;
                if action.status == ActionStatus::Pending && action.triggered_at + ttl <= now {
                    stale.push((k.value().to_vec(), action));
                }
            }
            for (key, mut action) in stale {
                action.status = ActionStatus::Expired;
                action.completed_at = Some(now);
                Self::retire(&mut active, &mut index, &mut history, &key, &action)?;
                expired.push(action);
            }
            Self::prune_history(&mut history, self.config.history_limit)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(expired)
    }

    /// Shutdown drain: put InFlight claims back to Pending so nothing is
    /// left stuck. Returns the number of released entries.
    pub fn release_inflight(&self) -> Result<usize> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let mut released = 0;
        {
            let mut active = wt.open_table(ACTIVE).map_err(db_err)?;
            let mut inflight: Vec<(Vec<u8>, QueuedAction)> = Vec::new();
            for entry in active.iter().map_err(db_err)? {
                let (k, v) = entry.map_err(db_err)?;
                let action: QueuedAction = serde_json::from_slice(v.value())?;
                if action.status == ActionStatus::InFlight {
                    inflight.push((k.value().to_vec(), action));
                }
            }
            for (key, mut action) in inflight {
                action.status = ActionStatus::Pending;
                action.claimed_at = None;
                let value = serde_json::to_vec(&action)?;
                active
                    .insert(key.as_slice(), value.as_slice())
                    .map_err(db_err)?;
                released += 1;
            }
        }
        wt.commit().map_err(db_err)?;
        Ok(released)
    }

    /// Earliest instant a Pending entry becomes eligible, if any. The
    /// dispatcher sleeps until the sooner of this and its poll tick.
    ///
    /// Applies the same TTL filter as `claim_next`: an entry past the TTL
    /// is unclaimable and must not report immediate eligibility, or an
    /// idle worker would spin on a zero-length sleep until the next sweep.
    pub fn next_wake(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let ttl = Duration::seconds(self.config.pending_ttl_secs as i64);
        let rt = self.db.begin_read().map_err(db_err)?;
        let active = rt.open_table(ACTIVE).map_err(db_err)?;
        let mut earliest: Option<DateTime<Utc>> = None;
        for entry in active.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            let action: QueuedAction = serde_json::from_slice(v.value())?;
            if action.status != ActionStatus::Pending {
                continue;
            }
            if action.triggered_at + ttl <= now {
                continue;
            }
            if action.next_eligible_at <= now {
                return Ok(Some(now));
            }
            earliest = match earliest {
                Some(e) if e <= action.next_eligible_at => Some(e),
                _ => Some(action.next_eligible_at),
            };
        }
        Ok(earliest)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// All Pending and InFlight entries in claim order.
    pub fn list_active(&self) -> Result<Vec<QueuedAction>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let active = rt.open_table(ACTIVE).map_err(db_err)?;
        let mut result = Vec::new();
        for entry in active.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            result.push(serde_json::from_slice(v.value())?);
        }
        Ok(result)
    }

    /// Look up a single action in the active set or the history.
    pub fn get(&self, id: Uuid) -> Result<Option<QueuedAction>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let active = rt.open_table(ACTIVE).map_err(db_err)?;
        for entry in active.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            let action: QueuedAction = serde_json::from_slice(v.value())?;
            if action.id == id {
                return Ok(Some(action));
            }
        }
        let history = rt.open_table(HISTORY).map_err(db_err)?;
        for entry in history.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            let action: QueuedAction = serde_json::from_slice(v.value())?;
            if action.id == id {
                return Ok(Some(action));
            }
        }
        Ok(None)
    }

    /// Terminal actions, newest first, up to `limit`.
    pub fn history(&self, limit: usize) -> Result<Vec<QueuedAction>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let history = rt.open_table(HISTORY).map_err(db_err)?;
        let mut result = Vec::new();
        for entry in history.iter().map_err(db_err)?.rev() {
            if result.len() >= limit {
                break;
            }
            let (_, v) = entry.map_err(db_err)?;
            result.push(serde_json::from_slice(v.value())?);
        }
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
