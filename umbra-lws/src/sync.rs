//! The scanning engine: chain synchronizer, scan workers and supervisor.
//!
//! The supervisor partitions the active account set across workers, each
//! worker streams blocks from its own daemon connection and commits scan
//! results through the store's conditional update. Any membership change,
//! reorg or worker exit tears the generation down and starts over; the
//! chain synchronizer reconciles the local tail with the daemon between
//! generations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::account::ScanAccount;
use crate::client::{
    GetBlocksRequest, GetBlocksResponse, GetHashesRequest, GetHashesResponse, NodeClient,
    GET_BLOCKS, GET_HASHES,
};
use crate::config::{
    ServerConfig, ACCOUNT_POLL_INTERVAL, BLOCK_POLL_INTERVAL, BLOCK_RPC_TIMEOUT,
    SHUTDOWN_QUANTUM, SYNC_RPC_TIMEOUT,
};
use crate::crypto::Hash;
use crate::db::data::{AccountId, AccountStatus, BlockHeight};
use crate::db::Storage;
use crate::error::{Error, ScanError};
use crate::scan::scan_transaction;

/// How many hashes of a sync reply seed the next probe list.
const SYNC_PROBE_REUSE: usize = 10;

/// Process-wide stop flag plus the fan-out topic every blocking wait
/// subscribes to.
#[derive(Clone)]
pub struct StopSignal {
    running: Arc<AtomicBool>,
    topic: Arc<watch::Sender<bool>>,
}

impl StopSignal {
    /// A fresh, un-fired signal.
    pub fn new() -> Self {
        let (topic, _) = watch::channel(false);
        StopSignal {
            running: Arc::new(AtomicBool::new(true)),
            topic: Arc::new(topic),
        }
    }

    /// Whether scanning should keep going.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Fire the stop flag and wake every subscribed wait.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let _ = self.topic.send(true);
    }

    /// Subscribe a blocking wait to the stop topic.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.topic.subscribe()
    }

    /// Resolve once the signal fires.
    pub async fn fired(&self) {
        let mut topic = self.subscribe();
        while self.is_running() && !*topic.borrow() {
            if topic.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleep for `wait`, checking the stop flag every shutdown quantum.
async fn checked_wait(stop: &StopSignal, wait: Duration) {
    let start = Instant::now();
    while stop.is_running() {
        let elapsed = start.elapsed();
        if elapsed >= wait {
            return;
        }
        tokio::time::sleep(SHUTDOWN_QUANTUM.min(wait - elapsed)).await;
    }
}

/// Align the local chain tail with the daemon.
///
/// Presents a probe list of locally known hashes and applies the returned
/// continuation until the daemon reports nothing newer than our tip.
/// Converges in a handful of round trips even across deep reorgs, as long
/// as one probe hash is still on the daemon's chain.
pub async fn sync_chain(client: &mut NodeClient, storage: &Storage) -> Result<(), Error> {
    tracing::info!("starting blockchain sync with daemon");

    let mut known_hashes = storage.start_read()?.get_chain_sync()?;
    loop {
        if known_hashes.is_empty() {
            return Err(Error::BadBlockchain);
        }

        let request = GetHashesRequest {
            start_height: 0,
            known_hashes: known_hashes.clone(),
        };
        client.send(GET_HASHES, &request).await?;
        let response: GetHashesResponse = client.receive(GET_HASHES, SYNC_RPC_TIMEOUT).await?;

        // a short reply, or one ending at our tip, means we are synced
        if response.hashes.len() <= 1 || response.hashes.last() == known_hashes.first() {
            return Ok(());
        }

        storage.sync_chain(BlockHeight(response.start_height), &response.hashes)?;

        // next probe: the newest hashes just applied, plus the old anchor
        let anchor = known_hashes.pop();
        known_hashes = response
            .hashes
            .iter()
            .rev()
            .take(SYNC_PROBE_REUSE)
            .copied()
            .collect();
        known_hashes.extend(anchor);
    }
}

/// Sort by scan height and split into at most `worker_count` even chunks,
/// so accounts far behind cluster together and do not stall fresh ones.
fn partition(mut users: Vec<ScanAccount>, worker_count: usize) -> Vec<Vec<ScanAccount>> {
    users.sort_by_key(|user| user.scan_height());
    let per_worker = users.len().div_ceil(worker_count.max(1));
    users
        .chunks(per_worker.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// One worker: stream blocks, scan, commit, repeat.
///
/// Returns `Ok` on every cooperative exit (abort, reorg, upstream reset,
/// account set modified underneath us); the supervisor restarts from a
/// fresh account enumeration. An `Err` is fatal for the generation.
async fn scan_loop(
    mut client: NodeClient,
    storage: Storage,
    mut users: Vec<ScanAccount>,
) -> Result<(), Error> {
    debug_assert!(!users.is_empty());
    debug_assert!(users.windows(2).all(|w| w[0].scan_height() <= w[1].scan_height()));

    // the daemon reserves start_height 0 for hash-list requests
    let mut request = GetBlocksRequest {
        start_height: users[0].scan_height().0.max(1),
        prune: false,
    };
    match client.send(GET_BLOCKS, &request).await {
        Ok(()) => {}
        Err(Error::AbortScan) => return Ok(()),
        Err(e) => return Err(e),
    }

    loop {
        let response: GetBlocksResponse =
            match client.receive(GET_BLOCKS, BLOCK_RPC_TIMEOUT).await {
                Ok(response) => response,
                Err(Error::AbortScan) => return Ok(()),
                Err(Error::DaemonConnectionFailure) => {
                    tracing::warn!("block retrieval timeout, retrying");
                    match client.send(GET_BLOCKS, &request).await {
                        Ok(()) => continue,
                        Err(Error::AbortScan) => return Ok(()),
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            };

        if response.blocks.is_empty() {
            return Err(ScanError::BadDaemonResponse("daemon returned zero blocks").into());
        }
        if response.start_height != request.start_height {
            tracing::warn!("daemon sent wrong blocks, resetting state");
            return Ok(());
        }

        // request the next span up front so the daemon works while we scan;
        // the one-block overlap carries the continuity check forward
        request.start_height = response.start_height + response.blocks.len() as u64 - 1;
        match client.send(GET_BLOCKS, &request).await {
            Ok(()) => {}
            Err(Error::AbortScan) => return Ok(()),
            Err(e) => return Err(e),
        }

        if response.blocks.len() <= 1 {
            // at the chain tip; wait for a new block
            match client.poll_wait(BLOCK_POLL_INTERVAL).await {
                Ok(()) => continue,
                Err(Error::AbortScan) => return Ok(()),
                Err(e) => return Err(e),
            }
        }

        if response.blocks.len() != response.output_indices.len() {
            return Err(
                ScanError::BadDaemonResponse("need same number of blocks and indices").into(),
            );
        }

        let expected = users[0].scan_height();
        let mut new_chain: Vec<Hash> = Vec::with_capacity(response.blocks.len() + 1);
        let skip = if response.start_height == 1 && expected.0 == 0 {
            // the daemon cannot serve the genesis block itself; anchor the
            // suffix with the locally stored genesis hash instead
            let anchor = storage
                .start_read()?
                .get_block_hash(BlockHeight(0))?
                .ok_or(Error::BadBlockchain)?;
            new_chain.push(anchor);
            0
        } else {
            // drop the overlap block; it is already committed
            new_chain.push(response.blocks[0].block.hash());
            1
        };

        let first_height = response.start_height + skip as u64;
        for (i, (entry, indices)) in response.blocks[skip..]
            .iter()
            .zip(&response.output_indices[skip..])
            .enumerate()
        {
            let height = BlockHeight(first_height + i as u64);
            let block = &entry.block;
            if block.tx_hashes.len() != entry.transactions.len() {
                return Err(
                    ScanError::BadDaemonResponse("need same number of txes and tx hashes").into(),
                );
            }
            let Some((miner_ids, tx_ids)) = indices.split_first() else {
                return Err(
                    ScanError::BadDaemonResponse("missing coinbase tx indices").into(),
                );
            };
            if tx_ids.len() != entry.transactions.len() {
                return Err(
                    ScanError::BadDaemonResponse("need same number of txes and indices").into(),
                );
            }

            scan_transaction(
                &mut users,
                height,
                block.timestamp,
                None,
                &block.miner_tx,
                miner_ids,
            )?;
            for ((tx_hash, tx), ids) in block
                .tx_hashes
                .iter()
                .zip(&entry.transactions)
                .zip(tx_ids)
            {
                scan_transaction(&mut users, height, block.timestamp, Some(*tx_hash), tx, ids)?;
            }

            new_chain.push(block.hash());
        }

        let scanned = new_chain.len() - 1;
        match storage.update(expected, &new_chain, &users) {
            Err(Error::BlockchainReorg) => {
                tracing::info!("blockchain reorg detected, resetting state");
                return Ok(());
            }
            Err(e) => return Err(e),
            Ok(updated) => {
                tracing::info!(
                    "processed {scanned} block(s) against {} account(s)",
                    users.len()
                );
                if updated != users.len() {
                    tracing::warn!(
                        "only updated {updated} account(s) out of {}, resetting",
                        users.len()
                    );
                    return Ok(());
                }
                let new_height = BlockHeight(expected.0 + new_chain.len() as u64 - 1);
                for user in &mut users {
                    user.committed(new_height);
                }
            }
        }
    }
}

/// Whether the set of active account ids differs from `active`.
fn active_set_changed(storage: &Storage, active: &[AccountId]) -> Result<bool, Error> {
    let reader = storage.start_read()?;
    let mut count = 0;
    for account in reader.get_accounts(AccountStatus::Active)? {
        let account = account?;
        count += 1;
        if active.binary_search(&account.id).is_err() {
            return Ok(true);
        }
    }
    Ok(count != active.len())
}

/// Outcome of one worker generation.
enum Generation {
    Restart,
    Stopped,
}

/// Run one generation of workers and watch for change.
///
/// Workers stop and are joined whenever the active account set changes, any
/// worker exits, or the global stop fires. Worker transport failures only
/// end the generation; scan and storage failures are escalated.
async fn check_loop(
    storage: &Storage,
    daemon_addr: &str,
    worker_count: usize,
    users: Vec<ScanAccount>,
    active: Vec<AccountId>,
    stop: &StopSignal,
) -> Result<Generation, Error> {
    let partitions = partition(users, worker_count);

    // every worker connection subscribes to this generation's stop topic;
    // connect them all before spawning anything so a refused connection
    // leaves no half-started generation behind
    let (generation_stop, _) = watch::channel(false);
    let mut clients = Vec::with_capacity(partitions.len());
    for _ in &partitions {
        clients.push(NodeClient::connect(daemon_addr, generation_stop.subscribe()).await?);
    }

    let total: usize = partitions.iter().map(Vec::len).sum();
    tracing::info!(
        "starting scan loops on {} worker(s) with {} account(s)",
        partitions.len(),
        total
    );

    let mut handles: Vec<JoinHandle<Result<(), Error>>> = Vec::with_capacity(partitions.len());
    for (chunk, client) in partitions.into_iter().zip(clients) {
        let storage = storage.clone();
        handles.push(tokio::spawn(scan_loop(client, storage, chunk)));
    }

    let mut last_check = Instant::now();
    loop {
        checked_wait(stop, Duration::from_secs(1)).await;
        if !stop.is_running() {
            break;
        }
        if handles.iter().any(JoinHandle::is_finished) {
            tracing::info!("scan worker exited, restarting");
            break;
        }
        if last_check.elapsed() >= ACCOUNT_POLL_INTERVAL {
            last_check = Instant::now();
            if active_set_changed(storage, &active)? {
                tracing::info!("change in active user accounts detected");
                break;
            }
        }
    }

    let _ = generation_stop.send(true);
    let mut failure = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!("scan worker failed: {e}");
                if failure.is_none() {
                    failure = Some(e);
                }
            }
            Err(e) => {
                tracing::error!("scan worker panicked: {e}");
                if failure.is_none() {
                    failure = Some(ScanError::BadDaemonResponse("scan worker panicked").into());
                }
            }
        }
    }

    match failure {
        // connection trouble is retried by the next generation
        Some(Error::Transport(e)) => {
            tracing::warn!("scan worker transport failure: {e}");
            Ok(Generation::Restart)
        }
        Some(Error::DaemonConnectionFailure) => Ok(Generation::Restart),
        Some(e) => {
            stop.stop();
            Err(e)
        }
        None if stop.is_running() => Ok(Generation::Restart),
        None => Ok(Generation::Stopped),
    }
}

/// Supervisor loop: enumerate active accounts, run worker generations, and
/// reconcile the chain tail between them. Returns when the stop signal
/// fires or a fatal error is escalated.
pub async fn run_scanner(
    storage: Storage,
    config: &ServerConfig,
    stop: StopSignal,
) -> Result<(), Error> {
    let worker_count = config.scan_workers.max(1);
    let mut sync_client: Option<NodeClient> = None;

    while stop.is_running() {
        tracing::info!("retrieving current active account list");
        let mut users = Vec::new();
        let mut active = Vec::new();
        {
            let reader = storage.start_read()?;
            for account in reader.get_accounts(AccountStatus::Active)? {
                let account = account?;
                let received = reader.get_received_ids(account.id)?;
                active.push(account.id);
                users.push(ScanAccount::new(&account, received));
            }
        }
        active.sort_unstable();

        if users.is_empty() {
            tracing::info!("no active accounts");
            checked_wait(&stop, ACCOUNT_POLL_INTERVAL).await;
        } else {
            match check_loop(
                &storage,
                &config.daemon_addr,
                worker_count,
                users,
                active,
                &stop,
            )
            .await
            {
                Ok(Generation::Restart) => {}
                Ok(Generation::Stopped) => return Ok(()),
                Err(Error::Transport(e)) => {
                    tracing::warn!("failed to connect to daemon at {}: {e}", config.daemon_addr);
                    checked_wait(&stop, ACCOUNT_POLL_INTERVAL).await;
                }
                Err(e) => return Err(e),
            }
        }

        if !stop.is_running() {
            return Ok(());
        }

        // absorb any reorg that happened while workers were down
        if sync_client.is_none() {
            sync_client = match NodeClient::connect(&config.daemon_addr, stop.subscribe()).await {
                Ok(client) => Some(client),
                Err(e) => {
                    tracing::warn!("failed to connect to daemon at {}: {e}", config.daemon_addr);
                    None
                }
            };
        }
        if let Some(client) = sync_client.as_mut() {
            match sync_chain(client, &storage).await {
                Ok(()) => {}
                Err(Error::AbortScan) => return Ok(()),
                Err(Error::DaemonConnectionFailure) => {
                    tracing::warn!("chain sync timed out, retrying later");
                    sync_client = None;
                }
                Err(Error::Transport(e)) => {
                    tracing::warn!("chain sync failed: {e}");
                    sync_client = None;
                }
                Err(e) => return Err(e),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::tests::random_keypair;
    use crate::db::data::{self, AccountAddress};

    fn user(id: u32, scan_height: u64) -> ScanAccount {
        let (_, spend_public) = random_keypair();
        let (view_secret, view_public) = random_keypair();
        let source = data::Account {
            id: AccountId(id),
            access: 0,
            address: AccountAddress {
                spend_public,
                view_public,
            },
            view_key: view_secret,
            scan_height: BlockHeight(scan_height),
            start_height: BlockHeight(scan_height),
            creation: 0,
        };
        ScanAccount::new(&source, Vec::new())
    }

    #[test]
    fn partitions_cover_and_cluster_by_height() {
        let users: Vec<_> = (0..10).map(|i| user(i, u64::from(100 - i))).collect();
        let partitions = partition(users, 4);

        assert_eq!(partitions.len(), 4);
        let mut seen: Vec<AccountId> = partitions
            .iter()
            .flatten()
            .map(ScanAccount::id)
            .collect();
        assert_eq!(seen.len(), 10);
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 10);

        // heights are ascending across the concatenated partitions
        let heights: Vec<_> = partitions
            .iter()
            .flatten()
            .map(|u| u.scan_height().0)
            .collect();
        assert!(heights.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn partition_handles_more_workers_than_accounts() {
        let users: Vec<_> = (0..3).map(|i| user(i, 10)).collect();
        let partitions = partition(users, 8);
        assert_eq!(partitions.len(), 3);
        assert!(partitions.iter().all(|p| p.len() == 1));
    }

    #[tokio::test]
    async fn stop_signal_wakes_checked_wait() {
        let stop = StopSignal::new();
        assert!(stop.is_running());

        let stop_clone = stop.clone();
        let waiter = tokio::spawn(async move {
            checked_wait(&stop_clone, Duration::from_secs(60)).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.stop();
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("wait should end promptly after stop")
            .unwrap();
        assert!(!stop.is_running());
    }
}
