//! Transaction lifecycle, WAL append, and crash recovery.
//!
//! A transaction stages records in memory. Commit writes the staged records
//! plus a COMMIT marker to the log and flushes before the transaction is
//! considered durable; everything without a COMMIT is discarded by
//! recovery. Effects on the mounted state flow through a [`ReplayTarget`]
//! capability passed per call, so this module never holds references back
//! into the filesystem.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::{FsResult, TransactionError};
use crate::wal::{self, WalOp, WalRecord, WalWriter};

/// Observable state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

/// An in-flight transaction.
#[derive(Debug)]
pub struct Transaction {
    pub id: u64,
    pub records: Vec<WalRecord>,
    pub start: Instant,
}

/// Capability through which staged records touch the mounted filesystem.
///
/// `apply` must be idempotent: replay may deliver the same record twice.
/// `undo` reverses an applied record using its before-image.
pub trait ReplayTarget {
    fn apply(&self, record: &WalRecord) -> FsResult<()>;
    fn undo(&self, record: &WalRecord) -> FsResult<()>;
}

/// Counters reported by [`TransactionManager::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnStats {
    pub active_transactions: u32,
    pub total_started: u64,
    pub staged_records: u64,
}

/// What recovery found in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryReport {
    pub committed_transactions: u32,
    pub applied_records: u32,
    pub discarded_transactions: u32,
    pub truncated_bytes: u64,
}

/// Owns the active-transaction map and the WAL writer.
pub struct TransactionManager {
    active: Mutex<HashMap<u64, Transaction>>,
    completed: Mutex<HashMap<u64, TxnState>>,
    next_id: AtomicU64,
    wal: Mutex<WalWriter>,
    timeout: Duration,
}

impl TransactionManager {
    /// Open the manager over the log at `wal_path`.
    pub fn open<P: AsRef<Path>>(wal_path: P, timeout: Duration) -> FsResult<TransactionManager> {
        let writer = WalWriter::open(wal_path)?;
        Ok(TransactionManager {
            active: Mutex::new(HashMap::new()),
            completed: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            wal: Mutex::new(writer),
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start a transaction. IDs increase monotonically and are never
    /// reused; the first staged record is the BEGIN marker.
    pub fn begin(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut begin = WalRecord::new(id, WalOp::Begin, 0, 0);
        begin.update_checksum();
        self.active.lock().insert(
            id,
            Transaction {
                id,
                records: vec![begin],
                start: Instant::now(),
            },
        );
        log::debug!("began transaction {}", id);
        id
    }

    /// Stage a record. The record's transaction id and checksum are set
    /// here; nothing reaches the log until commit.
    pub fn append(&self, tx_id: u64, mut record: WalRecord) -> FsResult<()> {
        let mut active = self.active.lock();
        let txn = match active.get_mut(&tx_id) {
            Some(txn) => txn,
            None => return Err(self.missing(tx_id).into()),
        };
        record.tx_id = tx_id;
        record.update_checksum();
        txn.records.push(record);
        Ok(())
    }

    /// True while the transaction is in the active map.
    pub fn is_active(&self, tx_id: u64) -> bool {
        self.active.lock().contains_key(&tx_id)
    }

    fn missing(&self, tx_id: u64) -> TransactionError {
        match self.completed.lock().get(&tx_id) {
            Some(TxnState::Aborted) => TransactionError::TransactionAborted(tx_id),
            _ => TransactionError::TransactionNotFound(tx_id),
        }
    }

    /// Make a transaction durable: write every staged record, then the
    /// COMMIT marker, then flush. Most staged effects were applied to the
    /// live state as they were staged; the frees staged as
    /// FREE_BLOCK/FREE_INODE were deferred and take effect only now, after
    /// the flush.
    ///
    /// Committing an already-committed transaction is a success no-op;
    /// committing an aborted one fails `TransactionAborted`.
    pub fn commit(&self, tx_id: u64, target: &dyn ReplayTarget) -> FsResult<()> {
        let txn = match self.active.lock().remove(&tx_id) {
            Some(txn) => txn,
            None => {
                return match self.completed.lock().get(&tx_id) {
                    Some(TxnState::Committed) => {
                        log::warn!("transaction {} already committed", tx_id);
                        Ok(())
                    }
                    Some(TxnState::Aborted) => {
                        Err(TransactionError::TransactionAborted(tx_id).into())
                    }
                    _ => Err(TransactionError::TransactionNotFound(tx_id).into()),
                };
            }
        };

        if let Err(err) = self.write_and_flush(&txn) {
            log::error!("commit of transaction {} failed: {}", tx_id, err);
            self.undo_all(&txn, target);
            self.append_terminator(tx_id, WalOp::Abort);
            self.completed.lock().insert(tx_id, TxnState::Aborted);
            return Err(err);
        }

        for record in &txn.records {
            if matches!(record.op, WalOp::FreeBlock | WalOp::FreeInode) {
                target.apply(record)?;
            }
        }
        self.completed.lock().insert(tx_id, TxnState::Committed);
        log::debug!(
            "committed transaction {} with {} records",
            tx_id,
            txn.records.len()
        );
        Ok(())
    }

    fn write_and_flush(&self, txn: &Transaction) -> FsResult<()> {
        let mut wal = self.wal.lock();
        for record in &txn.records {
            wal.append(record)?;
        }
        let mut commit = WalRecord::new(txn.id, WalOp::Commit, 0, 0);
        commit.update_checksum();
        wal.append(&commit)?;
        wal.flush()
    }

    fn undo_all(&self, txn: &Transaction, target: &dyn ReplayTarget) {
        for record in txn.records.iter().rev() {
            if let Err(err) = target.undo(record) {
                log::error!(
                    "undo of {:?} in transaction {} failed: {}",
                    record.op,
                    txn.id,
                    err
                );
            }
        }
    }

    fn append_terminator(&self, tx_id: u64, op: WalOp) {
        let mut record = WalRecord::new(tx_id, op, 0, 0);
        record.update_checksum();
        let mut wal = self.wal.lock();
        if let Err(err) = wal.append(&record).and_then(|_| wal.flush()) {
            log::warn!(
                "failed to append {:?} record for transaction {}: {}",
                op,
                tx_id,
                err
            );
        }
    }

    /// Abort a transaction, reversing its staged effects in reverse order.
    /// Rolling back an aborted transaction is a success no-op; rolling back
    /// a committed one fails `AlreadyCommitted`.
    pub fn rollback(&self, tx_id: u64, target: &dyn ReplayTarget) -> FsResult<()> {
        let txn = match self.active.lock().remove(&tx_id) {
            Some(txn) => txn,
            None => {
                return match self.completed.lock().get(&tx_id) {
                    Some(TxnState::Aborted) => {
                        log::warn!("transaction {} already aborted", tx_id);
                        Ok(())
                    }
                    Some(TxnState::Committed) => {
                        Err(TransactionError::AlreadyCommitted(tx_id).into())
                    }
                    _ => Err(TransactionError::TransactionNotFound(tx_id).into()),
                };
            }
        };

        self.undo_all(&txn, target);
        self.append_terminator(tx_id, WalOp::Abort);
        self.completed.lock().insert(tx_id, TxnState::Aborted);
        log::debug!(
            "rolled back transaction {} with {} records",
            tx_id,
            txn.records.len()
        );
        Ok(())
    }

    /// Abort every active transaction older than the configured timeout.
    /// Returns how many were reaped.
    pub fn sweep_expired(&self, now: Instant, target: &dyn ReplayTarget) -> usize {
        let expired: Vec<u64> = {
            let active = self.active.lock();
            active
                .values()
                .filter(|txn| now.duration_since(txn.start) > self.timeout)
                .map(|txn| txn.id)
                .collect()
        };
        for &tx_id in &expired {
            log::warn!("transaction {} expired, forcing abort", tx_id);
            if let Err(err) = self.rollback(tx_id, target) {
                log::error!("forced abort of transaction {} failed: {}", tx_id, err);
            }
        }
        expired.len()
    }

    /// Flush the log to durable storage.
    pub fn checkpoint(&self) -> FsResult<()> {
        self.wal.lock().flush()
    }

    /// Discard the log after its effects have been persisted elsewhere.
    pub fn reset_log(&self) -> FsResult<()> {
        self.wal.lock().reset()
    }

    /// Replay the log: apply transactions with a COMMIT marker in order,
    /// drop transactions with an ABORT marker, treat unterminated tails as
    /// implicitly aborted, and physically truncate a corrupt tail.
    pub fn recover(&self, target: &dyn ReplayTarget) -> FsResult<RecoveryReport> {
        let (path, log_len) = {
            let wal = self.wal.lock();
            let len = std::fs::metadata(wal.path())
                .map(|m| m.len())
                .unwrap_or(0);
            (wal.path().to_path_buf(), len)
        };
        let (records, good_len) = wal::scan(&path)?;

        let mut report = RecoveryReport::default();
        let mut staged: HashMap<u64, Vec<WalRecord>> = HashMap::new();
        let mut max_id = 0u64;
        for record in records {
            max_id = max_id.max(record.tx_id);
            match record.op {
                WalOp::Commit => {
                    if let Some(batch) = staged.remove(&record.tx_id) {
                        for staged_record in &batch {
                            target.apply(staged_record)?;
                            report.applied_records += 1;
                        }
                        report.committed_transactions += 1;
                    }
                }
                WalOp::Abort => {
                    if staged.remove(&record.tx_id).is_some() {
                        report.discarded_transactions += 1;
                    }
                }
                _ => staged.entry(record.tx_id).or_default().push(record),
            }
        }
        report.discarded_transactions += staged.len() as u32;

        if good_len < log_len {
            report.truncated_bytes = log_len - good_len;
            self.wal.lock().truncate(good_len)?;
        }

        // Never reuse an id that appears in the log.
        let floor = max_id + 1;
        self.next_id.fetch_max(floor, Ordering::SeqCst);

        log::info!(
            "recovery: {} transactions applied ({} records), {} discarded, {} bytes truncated",
            report.committed_transactions,
            report.applied_records,
            report.discarded_transactions,
            report.truncated_bytes
        );
        Ok(report)
    }

    pub fn active_count(&self) -> u32 {
        self.active.lock().len() as u32
    }

    pub fn stats(&self) -> TxnStats {
        let active = self.active.lock();
        TxnStats {
            active_transactions: active.len() as u32,
            total_started: self.next_id.load(Ordering::SeqCst) - 1,
            staged_records: active.values().map(|t| t.records.len() as u64).sum(),
        }
    }
}

/// RAII transaction scope: rolls back on drop unless committed.
pub struct TransactionGuard<'a> {
    mgr: &'a TransactionManager,
    target: &'a dyn ReplayTarget,
    id: u64,
    finished: bool,
}

impl<'a> TransactionGuard<'a> {
    pub fn begin(mgr: &'a TransactionManager, target: &'a dyn ReplayTarget) -> TransactionGuard<'a> {
        TransactionGuard {
            id: mgr.begin(),
            mgr,
            target,
            finished: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stage(&self, record: WalRecord) -> FsResult<()> {
        self.mgr.append(self.id, record)
    }

    pub fn commit(mut self) -> FsResult<()> {
        self.finished = true;
        self.mgr.commit(self.id, self.target)
    }

    pub fn abort(mut self) -> FsResult<()> {
        self.finished = true;
        self.mgr.rollback(self.id, self.target)
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(err) = self.mgr.rollback(self.id, self.target) {
                log::error!("rollback of abandoned transaction {} failed: {}", self.id, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FsError;
    use tempfile::TempDir;

    /// Target that records every apply/undo it sees.
    #[derive(Default)]
    struct TraceTarget {
        applied: Mutex<Vec<(WalOp, u32)>>,
        undone: Mutex<Vec<(WalOp, u32)>>,
    }

    impl ReplayTarget for TraceTarget {
        fn apply(&self, record: &WalRecord) -> FsResult<()> {
            self.applied.lock().push((record.op, record.block));
            Ok(())
        }

        fn undo(&self, record: &WalRecord) -> FsResult<()> {
            self.undone.lock().push((record.op, record.block));
            Ok(())
        }
    }

    fn manager(dir: &TempDir) -> TransactionManager {
        TransactionManager::open(dir.path().join("test.wal"), Duration::from_secs(30)).unwrap()
    }

    fn write_record(tx: u64, block: u32) -> WalRecord {
        WalRecord::new(tx, WalOp::WriteBlock, 1, block).with_images(vec![0], vec![1])
    }

    #[test]
    fn test_ids_monotonic() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let a = mgr.begin();
        let b = mgr.begin();
        assert!(b > a);
        assert_eq!(a, 1);
    }

    #[test]
    fn test_commit_releases_deferred_frees_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let target = TraceTarget::default();

        let tx = mgr.begin();
        mgr.append(tx, write_record(tx, 5)).unwrap();
        mgr.append(tx, WalRecord::new(tx, WalOp::FreeBlock, 0, 9)).unwrap();
        mgr.commit(tx, &target).unwrap();
        // Writes were applied eagerly at stage time; only the deferred
        // free flows through the target at commit.
        assert_eq!(*target.applied.lock(), vec![(WalOp::FreeBlock, 9)]);
        assert_eq!(mgr.active_count(), 0);

        // Second commit is a success no-op.
        mgr.commit(tx, &target).unwrap();
        assert_eq!(target.applied.lock().len(), 1);
    }

    #[test]
    fn test_rollback_undoes_in_reverse() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let target = TraceTarget::default();

        let tx = mgr.begin();
        mgr.append(tx, write_record(tx, 5)).unwrap();
        mgr.append(tx, write_record(tx, 6)).unwrap();
        mgr.rollback(tx, &target).unwrap();

        let undone = target.undone.lock();
        let blocks: Vec<u32> = undone
            .iter()
            .filter(|(op, _)| *op == WalOp::WriteBlock)
            .map(|(_, b)| *b)
            .collect();
        assert_eq!(blocks, vec![6, 5]);
        drop(undone);

        // Rollback again: success no-op. Commit after abort: error.
        mgr.rollback(tx, &target).unwrap();
        assert!(matches!(
            mgr.commit(tx, &target),
            Err(FsError::Transaction(TransactionError::TransactionAborted(_)))
        ));
    }

    #[test]
    fn test_rollback_after_commit_fails() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let target = TraceTarget::default();
        let tx = mgr.begin();
        mgr.commit(tx, &target).unwrap();
        assert!(matches!(
            mgr.rollback(tx, &target),
            Err(FsError::Transaction(TransactionError::AlreadyCommitted(_)))
        ));
    }

    #[test]
    fn test_append_to_unknown_or_finished() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let target = TraceTarget::default();

        assert!(matches!(
            mgr.append(99, write_record(99, 1)),
            Err(FsError::Transaction(TransactionError::TransactionNotFound(99)))
        ));

        let tx = mgr.begin();
        mgr.rollback(tx, &target).unwrap();
        assert!(matches!(
            mgr.append(tx, write_record(tx, 1)),
            Err(FsError::Transaction(TransactionError::TransactionAborted(_)))
        ));
    }

    #[test]
    fn test_recover_applies_only_committed() {
        let dir = TempDir::new().unwrap();
        let target = TraceTarget::default();
        {
            let mgr = manager(&dir);
            let committed = mgr.begin();
            mgr.append(committed, write_record(committed, 10)).unwrap();
            mgr.commit(committed, &target).unwrap();

            let dangling = mgr.begin();
            mgr.append(dangling, write_record(dangling, 20)).unwrap();
            // Dangling transaction never commits: nothing reaches the log.
        }

        let mgr = manager(&dir);
        let replay = TraceTarget::default();
        let report = mgr.recover(&replay).unwrap();
        assert_eq!(report.committed_transactions, 1);
        assert_eq!(report.discarded_transactions, 0);
        let applied = replay.applied.lock();
        assert!(applied.contains(&(WalOp::WriteBlock, 10)));
        assert!(!applied.contains(&(WalOp::WriteBlock, 20)));
    }

    #[test]
    fn test_recover_discards_aborted() {
        let dir = TempDir::new().unwrap();
        {
            let mgr = manager(&dir);
            let target = TraceTarget::default();
            let tx = mgr.begin();
            mgr.append(tx, write_record(tx, 7)).unwrap();
            // Rollback writes an ABORT marker; staged records never reach
            // the log, so recovery sees only the terminator.
            mgr.rollback(tx, &target).unwrap();
        }
        let mgr = manager(&dir);
        let replay = TraceTarget::default();
        let report = mgr.recover(&replay).unwrap();
        assert_eq!(report.committed_transactions, 0);
        assert!(replay.applied.lock().is_empty());
    }

    #[test]
    fn test_recover_truncates_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");
        {
            let mgr = TransactionManager::open(&path, Duration::from_secs(30)).unwrap();
            let target = TraceTarget::default();
            let tx = mgr.begin();
            mgr.append(tx, write_record(tx, 3)).unwrap();
            mgr.commit(tx, &target).unwrap();
        }
        // Tear the log mid-record.
        let len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let mgr = TransactionManager::open(&path, Duration::from_secs(30)).unwrap();
        let replay = TraceTarget::default();
        let report = mgr.recover(&replay).unwrap();
        // The commit marker was torn off, so the transaction is implicitly
        // aborted and the tail is gone.
        assert_eq!(report.committed_transactions, 0);
        assert_eq!(report.discarded_transactions, 1);
        assert!(report.truncated_bytes > 0);
        let after = std::fs::metadata(&path).unwrap().len();
        assert_eq!(after + report.truncated_bytes, len - 3);
    }

    #[test]
    fn test_recover_is_idempotent() {
        let dir = TempDir::new().unwrap();
        {
            let mgr = manager(&dir);
            let target = TraceTarget::default();
            let tx = mgr.begin();
            mgr.append(tx, write_record(tx, 4)).unwrap();
            mgr.commit(tx, &target).unwrap();
        }
        let mgr = manager(&dir);
        let replay = TraceTarget::default();
        let first = mgr.recover(&replay).unwrap();
        let second = mgr.recover(&replay).unwrap();
        assert_eq!(first.committed_transactions, second.committed_transactions);
        assert_eq!(first.applied_records, second.applied_records);
    }

    #[test]
    fn test_recovered_ids_not_reused() {
        let dir = TempDir::new().unwrap();
        {
            let mgr = manager(&dir);
            let target = TraceTarget::default();
            for _ in 0..3 {
                let tx = mgr.begin();
                mgr.commit(tx, &target).unwrap();
            }
        }
        let mgr = manager(&dir);
        let replay = TraceTarget::default();
        mgr.recover(&replay).unwrap();
        assert!(mgr.begin() > 3);
    }

    #[test]
    fn test_sweep_expires_old_transactions() {
        let dir = TempDir::new().unwrap();
        let mgr =
            TransactionManager::open(dir.path().join("test.wal"), Duration::from_millis(0)).unwrap();
        let target = TraceTarget::default();
        let tx = mgr.begin();
        mgr.append(tx, write_record(tx, 2)).unwrap();

        std::thread::sleep(Duration::from_millis(5));
        let reaped = mgr.sweep_expired(Instant::now(), &target);
        assert_eq!(reaped, 1);
        assert_eq!(mgr.active_count(), 0);

        // The reaped transaction's commit now fails.
        assert!(matches!(
            mgr.commit(tx, &target),
            Err(FsError::Transaction(TransactionError::TransactionAborted(_)))
        ));
    }

    #[test]
    fn test_guard_rolls_back_on_drop() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let target = TraceTarget::default();
        {
            let guard = TransactionGuard::begin(&mgr, &target);
            guard.stage(write_record(guard.id(), 9)).unwrap();
        }
        assert_eq!(mgr.active_count(), 0);
        assert!(target
            .undone
            .lock()
            .contains(&(WalOp::WriteBlock, 9)));

        let guard = TransactionGuard::begin(&mgr, &target);
        guard.commit().unwrap();
        assert_eq!(mgr.active_count(), 0);
    }

    #[test]
    fn test_stats() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let tx = mgr.begin();
        mgr.append(tx, write_record(tx, 1)).unwrap();
        let stats = mgr.stats();
        assert_eq!(stats.active_transactions, 1);
        assert_eq!(stats.total_started, 1);
        // BEGIN marker plus one staged write.
        assert_eq!(stats.staged_records, 2);
    }
}
