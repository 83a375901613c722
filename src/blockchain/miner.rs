use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError as EventTryRecvError};
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use utoipa::ToSchema;
use uuid::Uuid;

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::block::{hash_with_nonce, meets_target, Block};

/// Nonces hashed between two stop checks
pub const BATCH_SIZE: u64 = 10_000;

/// Minimum spacing between two progress messages
pub const REPORT_INTERVAL: Duration = Duration::from_millis(100);

/// Nonce window the progress heuristic wraps around
pub const PROGRESS_WINDOW: u64 = 10_000_000;

/// How many recent hashes the telemetry keeps
pub const RECENT_HASHES: usize = 5;

/// Errors that can occur while driving a mining session
#[derive(Debug, Error)]
pub enum MinerError {
    #[error("No signed transactions to mine")]
    NothingToMine,

    #[error("No miner selected to receive the block reward")]
    NoCurrentMiner,

    #[error("Mining is not running")]
    NotMining,

    #[error("Mining worker stopped without a result")]
    WorkerGone,
}

/// Periodic telemetry from the search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MiningProgress {
    pub current_nonce: u64,
    pub current_hash: String,
    pub hashes_processed: u64,
    /// Hashes per second over the last report window
    pub hash_rate: f64,
    /// `(nonce mod 10 000 000) / 10 000 000`, for display only
    pub progress: f64,
}

/// A nonce satisfying the target
#[derive(Debug, Clone, PartialEq)]
pub struct SolvedBlock {
    pub index: u64,
    pub nonce: u64,
    pub hash: String,
    pub hashes_processed: u64,
}

/// Messages sent by the worker, in order
#[derive(Debug, Clone, PartialEq)]
pub enum MinerEvent {
    Progress(MiningProgress),
    Solved(SolvedBlock),
}

/// Everything one search needs
#[derive(Debug, Clone)]
pub struct MiningJob {
    /// Candidate with `nonce = 0`
    pub block: Block,

    /// Required leading zero hex digits
    pub difficulty: usize,

    /// Pause after every batch; only slows the search down
    pub throttle: Duration,
}

/// Handle on a running proof-of-work search.
///
/// Dropping the session closes the stop channel, which also ends the worker.
#[derive(Debug)]
pub struct MiningSession {
    candidate: Block,
    difficulty: usize,
    started_at: i64,
    stop_tx: Option<oneshot::Sender<()>>,
    events: mpsc::UnboundedReceiver<MinerEvent>,
    handle: JoinHandle<()>,
}

/// Starts a search task. Must be called inside a tokio runtime.
pub fn spawn(job: MiningJob) -> MiningSession {
    let (stop_tx, stop_rx) = oneshot::channel();
    let (events_tx, events) = mpsc::unbounded_channel();

    let candidate = job.block.clone();
    let difficulty = job.difficulty;

    info!(
        "Mining block {} with {} transactions at difficulty {}",
        candidate.index,
        candidate.transactions.len(),
        difficulty
    );

    let handle = tokio::spawn(search(job, stop_rx, events_tx));

    MiningSession {
        candidate,
        difficulty,
        started_at: Utc::now().timestamp_millis(),
        stop_tx: Some(stop_tx),
        events,
        handle,
    }
}

impl MiningSession {
    /// The block being mined
    pub fn candidate(&self) -> &Block {
        &self.candidate
    }

    /// Difficulty the search runs at
    pub fn difficulty(&self) -> usize {
        self.difficulty
    }

    /// Start time in epoch milliseconds
    pub fn started_at(&self) -> i64 {
        self.started_at
    }

    /// Ids of the transactions locked by this candidate
    pub fn locked_ids(&self) -> Vec<Uuid> {
        self.candidate.transactions.iter().map(|tx| tx.id).collect()
    }

    /// Next message if one is ready; never blocks
    pub fn try_next_event(&mut self) -> Result<Option<MinerEvent>, MinerError> {
        match self.events.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(EventTryRecvError::Empty) => Ok(None),
            Err(EventTryRecvError::Disconnected) => Err(MinerError::WorkerGone),
        }
    }

    /// Waits for the next message; `None` once the worker has exited
    pub async fn next_event(&mut self) -> Option<MinerEvent> {
        self.events.recv().await
    }

    /// Asks the worker to halt before its next batch and discards any
    /// undelivered messages. The returned handle resolves once the worker
    /// thread has been released.
    pub fn stop(self) -> JoinHandle<()> {
        let MiningSession {
            candidate,
            stop_tx,
            handle,
            ..
        } = self;

        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(());
        }

        info!("Stopped mining block {}", candidate.index);
        handle
    }
}

fn stop_requested(stop_rx: &mut oneshot::Receiver<()>) -> bool {
    !matches!(stop_rx.try_recv(), Err(TryRecvError::Empty))
}

/// Result of hashing one batch of nonces
enum Batch {
    Solved { nonce: u64, hash: String },
    Exhausted { last_nonce: u64, last_hash: String },
}

/// Hashes `BATCH_SIZE` consecutive nonces from `start`
fn hash_batch(prefix: &str, start: u64, difficulty: usize) -> Batch {
    let mut last_hash = String::new();

    for nonce in start..start + BATCH_SIZE {
        let hash = hash_with_nonce(prefix, nonce);
        if meets_target(&hash, difficulty) {
            return Batch::Solved { nonce, hash };
        }
        last_hash = hash;
    }

    Batch::Exhausted {
        last_nonce: start + BATCH_SIZE - 1,
        last_hash,
    }
}

/// Sequential nonce search from 0. Batches run on the blocking pool; the stop
/// signal is checked between batches and wakes the task out of the throttle.
async fn search(
    job: MiningJob,
    mut stop_rx: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<MinerEvent>,
) {
    let index = job.block.index;
    let difficulty = job.difficulty;
    let prefix: Arc<str> = Arc::from(job.block.hash_prefix());
    let mut nonce: u64 = 0;
    let mut hashes_processed: u64 = 0;
    let mut window_start = Instant::now();
    let mut window_hashes: u64 = 0;

    loop {
        if stop_requested(&mut stop_rx) {
            debug!("Worker for block {} halted after {} hashes", index, hashes_processed);
            return;
        }

        let batch_prefix = Arc::clone(&prefix);
        let start = nonce;
        let batch = match tokio::task::spawn_blocking(move || hash_batch(&batch_prefix, start, difficulty)).await {
            Ok(batch) => batch,
            Err(err) => {
                warn!("Hashing batch for block {} did not complete: {}", index, err);
                return;
            }
        };

        match batch {
            Batch::Solved { nonce, hash } => {
                hashes_processed += nonce - start + 1;
                if !stop_requested(&mut stop_rx) {
                    let _ = events.send(MinerEvent::Solved(SolvedBlock {
                        index,
                        nonce,
                        hash,
                        hashes_processed,
                    }));
                }
                return;
            }
            Batch::Exhausted { last_nonce, last_hash } => {
                hashes_processed += BATCH_SIZE;
                window_hashes += BATCH_SIZE;
                nonce = last_nonce + 1;

                let elapsed = window_start.elapsed();
                if elapsed >= REPORT_INTERVAL {
                    let progress = MiningProgress {
                        current_nonce: last_nonce,
                        current_hash: last_hash,
                        hashes_processed,
                        hash_rate: window_hashes as f64 / elapsed.as_secs_f64(),
                        progress: (nonce % PROGRESS_WINDOW) as f64 / PROGRESS_WINDOW as f64,
                    };

                    if stop_requested(&mut stop_rx) || events.send(MinerEvent::Progress(progress)).is_err() {
                        return;
                    }

                    window_start = Instant::now();
                    window_hashes = 0;
                }
            }
        }

        if !job.throttle.is_zero() {
            tokio::select! {
                _ = &mut stop_rx => {
                    debug!("Worker for block {} stopped during throttle", index);
                    return;
                }
                _ = tokio::time::sleep(job.throttle) => {}
            }
        }
    }
}

/// A hash seen during the search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RecentHash {
    pub hash: String,
    pub nonce: u64,
}

/// Telemetry aggregated on the control side
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MiningStats {
    pub hash_rate: f64,
    pub total_hashes: u64,
    /// Epoch milliseconds, 0 when idle
    pub started_at: i64,
    pub current_nonce: u64,
    pub current_hash: Option<String>,
    pub progress: f64,
    /// Newest first
    pub recent_hashes: Vec<RecentHash>,
}

impl MiningStats {
    /// Fresh stats for a session starting at `started_at`
    pub fn starting(started_at: i64) -> Self {
        MiningStats {
            started_at,
            ..MiningStats::default()
        }
    }

    /// Folds a progress message in
    pub fn apply_progress(&mut self, progress: &MiningProgress) {
        if progress.hash_rate > 0.0 {
            self.hash_rate = progress.hash_rate;
        }
        self.total_hashes = progress.hashes_processed;
        self.current_nonce = progress.current_nonce;
        self.current_hash = Some(progress.current_hash.clone());
        self.progress = progress.progress;
        self.remember(&progress.current_hash, progress.current_nonce);
    }

    /// Folds the final result in
    pub fn apply_solved(&mut self, solved: &SolvedBlock) {
        self.total_hashes = solved.hashes_processed;
        self.current_nonce = solved.nonce;
        self.current_hash = Some(solved.hash.clone());
        self.progress = 1.0;
        self.remember(&solved.hash, solved.nonce);
    }

    fn remember(&mut self, hash: &str, nonce: u64) {
        if hash.is_empty() || self.recent_hashes.iter().any(|recent| recent.hash == hash) {
            return;
        }

        self.recent_hashes.insert(
            0,
            RecentHash {
                hash: hash.to_string(),
                nonce,
            },
        );
        self.recent_hashes.truncate(RECENT_HASHES);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::transaction::Transaction;

    fn job(difficulty: usize, throttle_ms: u64) -> MiningJob {
        let transactions = vec![Transaction::new("Alice", "Bob", 10.0)];
        MiningJob {
            block: Block::candidate(1, 1_700_000_000_000, transactions, "prev".to_string(), difficulty),
            difficulty,
            throttle: Duration::from_millis(throttle_ms),
        }
    }

    async fn wait_for_solution(session: &mut MiningSession) -> SolvedBlock {
        loop {
            match session.next_event().await {
                Some(MinerEvent::Solved(solved)) => return solved,
                Some(MinerEvent::Progress(_)) => continue,
                None => panic!("worker exited without a solution"),
            }
        }
    }

    #[tokio::test]
    async fn test_finds_smallest_qualifying_nonce() {
        let job = job(2, 0);
        let mut block = job.block.clone();
        let mut session = spawn(job);

        let solved = tokio::time::timeout(Duration::from_secs(30), wait_for_solution(&mut session))
            .await
            .expect("mining timed out");

        block.nonce = solved.nonce;
        assert_eq!(block.calculate_hash(), solved.hash);
        assert!(solved.hash.starts_with("00"));
        assert_eq!(solved.hashes_processed, solved.nonce + 1);

        let prefix = block.hash_prefix();
        for nonce in 0..solved.nonce {
            assert!(!meets_target(&hash_with_nonce(&prefix, nonce), 2));
        }

        // The worker ends on its own after a solution
        assert!(session.stop().await.is_ok());
    }

    #[tokio::test]
    async fn test_stop_releases_worker() {
        let session = spawn(job(10, 0));
        assert_eq!(session.locked_ids().len(), 1);

        let handle = session.stop();
        let joined = tokio::time::timeout(Duration::from_secs(10), handle).await;
        assert!(matches!(joined, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_stop_interrupts_throttle() {
        let session = spawn(job(10, 30_000));

        // Let the first batch finish so the worker is parked in the throttle
        tokio::time::sleep(Duration::from_millis(500)).await;

        let stopped_at = Instant::now();
        let joined = tokio::time::timeout(Duration::from_secs(5), session.stop()).await;

        assert!(matches!(joined, Ok(Ok(()))));
        assert!(stopped_at.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_dropping_session_ends_worker() {
        let session = spawn(job(10, 30_000));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let MiningSession { handle, stop_tx, .. } = session;
        drop(stop_tx);

        let joined = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(matches!(joined, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_reports_progress_while_searching() {
        let mut session = spawn(job(10, 5));

        let event = tokio::time::timeout(Duration::from_secs(30), session.next_event())
            .await
            .expect("no progress reported");

        match event {
            Some(MinerEvent::Progress(progress)) => {
                assert!(progress.hashes_processed >= BATCH_SIZE);
                assert!(progress.hash_rate > 0.0);
                assert!((0.0..1.0).contains(&progress.progress));
                assert_eq!(progress.current_hash.len(), 64);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        assert!(session.stop().await.is_ok());
    }

    #[tokio::test]
    async fn test_try_next_event_does_not_block() {
        let mut session = spawn(job(10, 50));
        assert!(matches!(session.try_next_event(), Ok(None)));
        assert!(session.stop().await.is_ok());
    }

    #[test]
    fn test_stats_keep_recent_distinct_hashes() {
        let mut stats = MiningStats::starting(42);

        for nonce in 0..8u64 {
            stats.apply_progress(&MiningProgress {
                current_nonce: nonce,
                current_hash: format!("hash-{}", nonce),
                hashes_processed: nonce * 10,
                hash_rate: 100.0,
                progress: 0.5,
            });
        }
        // Repeating a hash does not add it twice
        stats.apply_progress(&MiningProgress {
            current_nonce: 7,
            current_hash: "hash-7".to_string(),
            hashes_processed: 80,
            hash_rate: 0.0,
            progress: 0.5,
        });

        assert_eq!(stats.started_at, 42);
        assert_eq!(stats.recent_hashes.len(), RECENT_HASHES);
        assert_eq!(stats.recent_hashes[0].hash, "hash-7");
        assert_eq!(stats.recent_hashes[4].hash, "hash-3");
        assert_eq!(stats.hash_rate, 100.0);
        assert_eq!(stats.total_hashes, 80);
    }
}
