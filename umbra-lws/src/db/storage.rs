//! rocksdb-backed account store.
//!
//! Layout: seven column families, keyed big-endian so iteration order is
//! key order. Values are the packed records from [`crate::db::data`].
//!
//! - `blocks`: `height` → block hash. The local chain tail, contiguous
//!   from genesis.
//! - `accounts`: `(status, id)` → account record.
//! - `accounts_by_address`: `address` → `(status, id)` lookup.
//! - `accounts_by_height`: `(scan_height, id)` → status. Lets reorg
//!   rollback find affected accounts without a table scan.
//! - `outputs`: `(account_id, height, output_id)` → output record.
//! - `spends`: `(output_id, key_image)` → spend record.
//! - `requests`: `(kind, address)` → pending request record.
//!
//! Readers are rocksdb snapshots and see a consistent point-in-time view.
//! Writers serialize on an internal mutex and commit one `WriteBatch`, so a
//! failed write op leaves the store untouched.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, SnapshotWithThreadMode, WriteBatch,
};

use crate::account::ScanAccount;
use crate::config::Network;
use crate::crypto::{self, Hash, KeyImage, SecretKey};
use crate::db::data::{
    Account, AccountAddress, AccountId, AccountStatus, AccountTime, BlockHeight, BlockInfo,
    Output, OutputId, PendingRequest, RequestType, Spend,
};
use crate::error::{Error, StorageError};

type Db = DBWithThreadMode<MultiThreaded>;

const CF_BLOCKS: &str = "blocks";
const CF_ACCOUNTS: &str = "accounts";
const CF_ACCOUNTS_BY_ADDRESS: &str = "accounts_by_address";
const CF_ACCOUNTS_BY_HEIGHT: &str = "accounts_by_height";
const CF_OUTPUTS: &str = "outputs";
const CF_SPENDS: &str = "spends";
const CF_REQUESTS: &str = "requests";

const COLUMN_FAMILIES: [&str; 7] = [
    CF_BLOCKS,
    CF_ACCOUNTS,
    CF_ACCOUNTS_BY_ADDRESS,
    CF_ACCOUNTS_BY_HEIGHT,
    CF_OUTPUTS,
    CF_SPENDS,
    CF_REQUESTS,
];

/// How many contiguous tip hashes seed a chain sync probe list.
const SYNC_PROBE_RECENT: usize = 10;
/// Cap on the exponentially spaced part of the probe list.
const SYNC_PROBE_SPARSE_MAX: u32 = 64;

fn block_key(height: BlockHeight) -> [u8; 8] {
    height.0.to_be_bytes()
}

fn account_key(status: AccountStatus, id: AccountId) -> [u8; 5] {
    let mut key = [0; 5];
    key[0] = status as u8;
    key[1..].copy_from_slice(&id.0.to_be_bytes());
    key
}

fn height_index_key(height: BlockHeight, id: AccountId) -> [u8; 12] {
    let mut key = [0; 12];
    key[..8].copy_from_slice(&height.0.to_be_bytes());
    key[8..].copy_from_slice(&id.0.to_be_bytes());
    key
}

fn output_key(account: AccountId, height: BlockHeight, id: OutputId) -> [u8; 20] {
    let mut key = [0; 20];
    key[..4].copy_from_slice(&account.0.to_be_bytes());
    key[4..12].copy_from_slice(&height.0.to_be_bytes());
    key[12..].copy_from_slice(&id.0.to_be_bytes());
    key
}

fn spend_key(source: OutputId, key_image: &KeyImage) -> [u8; 40] {
    let mut key = [0; 40];
    key[..8].copy_from_slice(&source.0.to_be_bytes());
    key[8..].copy_from_slice(&key_image.0);
    key
}

fn request_key(kind: RequestType, address: &AccountAddress) -> [u8; 65] {
    let mut key = [0; 65];
    key[0] = kind as u8;
    key[1..].copy_from_slice(&address.to_bytes());
    key
}

fn decode_account(bytes: &[u8]) -> Result<Account, Error> {
    Account::read(bytes).map_err(|_| StorageError::CorruptRecord(CF_ACCOUNTS).into())
}

fn decode_output(bytes: &[u8]) -> Result<Output, Error> {
    Output::read(bytes).map_err(|_| StorageError::CorruptRecord(CF_OUTPUTS).into())
}

fn decode_spend(bytes: &[u8]) -> Result<Spend, Error> {
    Spend::read(bytes).map_err(|_| StorageError::CorruptRecord(CF_SPENDS).into())
}

fn decode_request(bytes: &[u8]) -> Result<PendingRequest, Error> {
    PendingRequest::read(bytes).map_err(|_| StorageError::CorruptRecord(CF_REQUESTS).into())
}

fn decode_hash(bytes: &[u8]) -> Result<Hash, Error> {
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| StorageError::CorruptRecord(CF_BLOCKS))?;
    Ok(Hash(bytes))
}

fn decode_lookup(bytes: &[u8]) -> Result<(AccountStatus, AccountId), Error> {
    if bytes.len() != 5 {
        return Err(StorageError::CorruptRecord(CF_ACCOUNTS_BY_ADDRESS).into());
    }
    let status = AccountStatus::from_u8(bytes[0])
        .ok_or(StorageError::CorruptRecord(CF_ACCOUNTS_BY_ADDRESS))?;
    let id = AccountId(u32::from_be_bytes(bytes[1..5].try_into().expect("4 bytes")));
    Ok((status, id))
}

fn lookup_value(status: AccountStatus, id: AccountId) -> [u8; 5] {
    account_key(status, id)
}

fn encode_account(account: &Account) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(Account::ENCODED_LEN);
    account.write(&mut bytes).expect("vec write cannot fail");
    bytes
}

/// Seconds since epoch, constrained to the storage range.
fn current_time() -> Result<AccountTime, Error> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| Error::SystemClockInvalidRange)?;
    AccountTime::try_from(now.as_secs()).map_err(|_| Error::SystemClockInvalidRange)
}

struct StorageInner {
    db: Db,
    writer: Mutex<()>,
    create_queue_max: usize,
    network: Network,
}

impl StorageInner {
    fn cf(&self, name: &'static str) -> Result<Arc<BoundColumnFamily<'_>>, Error> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::MissingTable(name).into())
    }
}

/// Handle to the durable account store. Clones share the database.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<StorageInner>,
}

impl Storage {
    /// Open (or create) the store at `path`.
    ///
    /// A fresh store is anchored at the network's genesis hash; an existing
    /// store whose genesis does not match fails with `BadBlockchain`.
    pub fn open(
        path: &Path,
        network: Network,
        create_queue_max: usize,
    ) -> Result<Storage, Error> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect::<Vec<_>>();
        let db =
            Db::open_cf_descriptors(&opts, path, descriptors).map_err(StorageError::Backend)?;

        let storage = Storage {
            inner: Arc::new(StorageInner {
                db,
                writer: Mutex::new(()),
                create_queue_max,
                network,
            }),
        };
        storage.check_genesis()?;
        Ok(storage)
    }

    fn check_genesis(&self) -> Result<(), Error> {
        let _guard = self.lock_writer();
        let cf = self.inner.cf(CF_BLOCKS)?;
        let genesis = self.inner.network.genesis_hash();
        match self
            .inner
            .db
            .get_cf(&cf, block_key(BlockHeight(0)))
            .map_err(StorageError::Backend)?
        {
            None => {
                let mut batch = WriteBatch::default();
                batch.put_cf(&cf, block_key(BlockHeight(0)), genesis.0);
                self.inner.db.write(batch).map_err(StorageError::Backend)?;
                Ok(())
            }
            Some(stored) if decode_hash(&stored)? == genesis => Ok(()),
            Some(_) => Err(Error::BadBlockchain),
        }
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.inner
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Begin a snapshot-isolated read.
    pub fn start_read(&self) -> Result<StorageReader<'_>, Error> {
        Ok(StorageReader {
            inner: &self.inner,
            snapshot: self.inner.db.snapshot(),
        })
    }

    fn last_block_direct(&self) -> Result<BlockInfo, Error> {
        let cf = self.inner.cf(CF_BLOCKS)?;
        let entry = self
            .inner
            .db
            .iterator_cf(&cf, IteratorMode::End)
            .next()
            .ok_or(StorageError::MissingRecord("chain tail"))?
            .map_err(StorageError::Backend)?;
        let (key, value) = entry;
        let height = BlockHeight(u64::from_be_bytes(
            key.as_ref()
                .try_into()
                .map_err(|_| StorageError::CorruptRecord(CF_BLOCKS))?,
        ));
        Ok(BlockInfo {
            height,
            hash: decode_hash(&value)?,
        })
    }

    fn block_hash_direct(&self, height: BlockHeight) -> Result<Option<Hash>, Error> {
        let cf = self.inner.cf(CF_BLOCKS)?;
        match self
            .inner
            .db
            .get_cf(&cf, block_key(height))
            .map_err(StorageError::Backend)?
        {
            Some(bytes) => Ok(Some(decode_hash(&bytes)?)),
            None => Ok(None),
        }
    }

    fn find_account_direct(
        &self,
        address: &AccountAddress,
    ) -> Result<Option<(AccountStatus, Account)>, Error> {
        let by_address = self.inner.cf(CF_ACCOUNTS_BY_ADDRESS)?;
        let Some(lookup) = self
            .inner
            .db
            .get_cf(&by_address, address.to_bytes())
            .map_err(StorageError::Backend)?
        else {
            return Ok(None);
        };
        let (status, id) = decode_lookup(&lookup)?;
        let accounts = self.inner.cf(CF_ACCOUNTS)?;
        let record = self
            .inner
            .db
            .get_cf(&accounts, account_key(status, id))
            .map_err(StorageError::Backend)?
            .ok_or(StorageError::MissingRecord("account for address lookup"))?;
        Ok(Some((status, decode_account(&record)?)))
    }

    fn next_account_id(&self) -> Result<AccountId, Error> {
        let cf = self.inner.cf(CF_ACCOUNTS)?;
        let mut best = 0u32;
        for entry in self.inner.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = entry.map_err(StorageError::Backend)?;
            if key.len() != 5 {
                return Err(StorageError::CorruptRecord(CF_ACCOUNTS).into());
            }
            let id = u32::from_be_bytes(key[1..5].try_into().expect("4 bytes"));
            best = best.max(id);
        }
        Ok(AccountId(best + 1))
    }

    /// Truncate the local chain to the common ancestor implied by `hashes`
    /// and append the replacement suffix.
    ///
    /// `hashes[0]` must match the stored hash at `start_height`; any account
    /// whose scan height falls beyond the divergence point is rolled back to
    /// the last surviving height, and its outputs and spends above that
    /// point are deleted.
    pub fn sync_chain(&self, start_height: BlockHeight, hashes: &[Hash]) -> Result<(), Error> {
        if hashes.is_empty() {
            return Err(Error::BadBlockchain);
        }
        let _guard = self.lock_writer();

        let anchor = self
            .block_hash_direct(start_height)?
            .ok_or(Error::BadBlockchain)?;
        if anchor != hashes[0] {
            return Err(Error::BadBlockchain);
        }

        let mut batch = WriteBatch::default();
        let blocks = self.inner.cf(CF_BLOCKS)?;

        // walk forward until the replacement chain diverges from the stored one
        let mut append_from = None;
        for (offset, hash) in hashes.iter().enumerate().skip(1) {
            let height = BlockHeight(start_height.0 + offset as u64);
            match self.block_hash_direct(height)? {
                Some(stored) if stored == *hash => continue,
                Some(_) => {
                    self.truncate_chain(&mut batch, height)?;
                    append_from = Some((offset, height));
                    break;
                }
                None => {
                    append_from = Some((offset, height));
                    break;
                }
            }
        }

        if let Some((offset, height)) = append_from {
            for (i, hash) in hashes[offset..].iter().enumerate() {
                batch.put_cf(&blocks, block_key(BlockHeight(height.0 + i as u64)), hash.0);
            }
        }

        self.inner.db.write(batch).map_err(StorageError::Backend)?;
        Ok(())
    }

    /// Delete stored blocks at and above `fork` and roll back every account
    /// scanned past it.
    fn truncate_chain(&self, batch: &mut WriteBatch, fork: BlockHeight) -> Result<(), Error> {
        let blocks = self.inner.cf(CF_BLOCKS)?;
        let from = block_key(fork);
        for entry in self
            .inner
            .db
            .iterator_cf(&blocks, IteratorMode::From(&from, Direction::Forward))
        {
            let (key, _) = entry.map_err(StorageError::Backend)?;
            batch.delete_cf(&blocks, key);
        }
        self.rollback_accounts(batch, fork)
    }

    fn rollback_accounts(&self, batch: &mut WriteBatch, fork: BlockHeight) -> Result<(), Error> {
        let accounts = self.inner.cf(CF_ACCOUNTS)?;
        let by_height = self.inner.cf(CF_ACCOUNTS_BY_HEIGHT)?;
        let outputs = self.inner.cf(CF_OUTPUTS)?;
        let spends = self.inner.cf(CF_SPENDS)?;

        let new_height = BlockHeight(fork.0.max(1) - 1);
        let from = height_index_key(fork, AccountId(0));
        for entry in self
            .inner
            .db
            .iterator_cf(&by_height, IteratorMode::From(&from, Direction::Forward))
        {
            let (key, value) = entry.map_err(StorageError::Backend)?;
            if key.len() != 12 {
                return Err(StorageError::CorruptRecord(CF_ACCOUNTS_BY_HEIGHT).into());
            }
            let id = AccountId(u32::from_be_bytes(key[8..12].try_into().expect("4 bytes")));
            let status = AccountStatus::from_u8(value.first().copied().unwrap_or(u8::MAX))
                .ok_or(StorageError::CorruptRecord(CF_ACCOUNTS_BY_HEIGHT))?;

            let record = self
                .inner
                .db
                .get_cf(&accounts, account_key(status, id))
                .map_err(StorageError::Backend)?
                .ok_or(StorageError::MissingRecord("account for height index"))?;
            let mut account = decode_account(&record)?;
            account.scan_height = new_height;
            account.start_height = account.start_height.min(new_height);
            batch.put_cf(&accounts, account_key(status, id), encode_account(&account));

            batch.delete_cf(&by_height, key);
            batch.put_cf(&by_height, height_index_key(new_height, id), [status as u8]);

            // drop outputs received past the fork, and spends observed past
            // the fork against any of the account's outputs
            let prefix = id.0.to_be_bytes();
            for entry in self
                .inner
                .db
                .iterator_cf(&outputs, IteratorMode::From(&prefix, Direction::Forward))
            {
                let (out_key, out_value) = entry.map_err(StorageError::Backend)?;
                if out_key.len() != 20 || out_key[..4] != prefix {
                    break;
                }
                let output = decode_output(&out_value)?;
                let spend_prefix = output.id.0.to_be_bytes();
                for entry in self.inner.db.iterator_cf(
                    &spends,
                    IteratorMode::From(&spend_prefix, Direction::Forward),
                ) {
                    let (spend_key_bytes, spend_value) = entry.map_err(StorageError::Backend)?;
                    if spend_key_bytes.len() != 40 || spend_key_bytes[..8] != spend_prefix {
                        break;
                    }
                    let spend = decode_spend(&spend_value)?;
                    if output.height >= fork || spend.height >= fork {
                        batch.delete_cf(&spends, spend_key_bytes);
                    }
                }
                if output.height >= fork {
                    batch.delete_cf(&outputs, out_key);
                }
            }
        }
        Ok(())
    }

    /// Conditionally commit one scan round.
    ///
    /// `chain[i]` is the block hash at height `expected.0 + i`, with
    /// `chain[0]` overlapping the already-stored tail. If the stored hash at
    /// the deepest shared height disagrees with `chain`, nothing is written
    /// and `BlockchainReorg` is returned. On success the new tail hashes are
    /// appended, every account's matched outputs and spends are inserted,
    /// and each account still at its snapshot height advances to the end of
    /// `chain`. Returns how many accounts advanced.
    pub fn update(
        &self,
        expected: BlockHeight,
        chain: &[Hash],
        users: &[ScanAccount],
    ) -> Result<usize, Error> {
        if chain.is_empty() {
            return Err(Error::BadBlockchain);
        }
        let _guard = self.lock_writer();

        let tail = self.last_block_direct()?;
        if tail.height < expected {
            return Err(Error::BadBlockchain);
        }
        let last_update = BlockHeight(expected.0 + chain.len() as u64 - 1);
        let last_same = tail.height.min(last_update);
        let offset = (last_same.0 - expected.0) as usize;
        let stored = self
            .block_hash_direct(last_same)?
            .ok_or(StorageError::MissingRecord("tail hash"))?;
        if stored != chain[offset] {
            return Err(Error::BlockchainReorg);
        }

        let mut batch = WriteBatch::default();
        let blocks = self.inner.cf(CF_BLOCKS)?;
        for (i, hash) in chain[offset + 1..].iter().enumerate() {
            batch.put_cf(
                &blocks,
                block_key(BlockHeight(last_same.0 + 1 + i as u64)),
                hash.0,
            );
        }

        let accounts = self.inner.cf(CF_ACCOUNTS)?;
        let by_height = self.inner.cf(CF_ACCOUNTS_BY_HEIGHT)?;
        let outputs = self.inner.cf(CF_OUTPUTS)?;
        let spends = self.inner.cf(CF_SPENDS)?;

        let mut updated = 0;
        for user in users {
            // the account is usually still active; fall back to an address
            // lookup when its status changed mid-scan
            let active_key = account_key(AccountStatus::Active, user.id());
            let found = match self
                .inner
                .db
                .get_cf(&accounts, active_key)
                .map_err(StorageError::Backend)?
            {
                Some(record) => Some((AccountStatus::Active, decode_account(&record)?)),
                None => self.find_account_direct(user.address())?,
            };
            let Some((status, mut account)) = found else {
                continue;
            };
            if account.id != user.id() || account.scan_height != user.scan_height() {
                continue;
            }

            let previous_height = account.scan_height;
            account.scan_height = last_update;
            batch.put_cf(
                &accounts,
                account_key(status, account.id),
                encode_account(&account),
            );
            batch.delete_cf(&by_height, height_index_key(previous_height, account.id));
            batch.put_cf(
                &by_height,
                height_index_key(last_update, account.id),
                [status as u8],
            );

            for output in user.outputs() {
                let mut value = Vec::with_capacity(Output::ENCODED_LEN);
                output.write(&mut value).expect("vec write cannot fail");
                batch.put_cf(
                    &outputs,
                    output_key(account.id, output.height, output.id),
                    value,
                );
            }
            for (source, spend) in user.spends() {
                let mut value = Vec::with_capacity(Spend::ENCODED_LEN);
                spend.write(&mut value).expect("vec write cannot fail");
                batch.put_cf(&spends, spend_key(*source, &spend.key_image), value);
            }

            updated += 1;
        }

        self.inner.db.write(batch).map_err(StorageError::Backend)?;
        Ok(updated)
    }

    fn put_new_account(
        &self,
        batch: &mut WriteBatch,
        account: &Account,
    ) -> Result<(), Error> {
        let verified = crypto::secret_key_to_public_key(&account.view_key)
            .ok_or(Error::BadViewKey)?;
        if verified != account.address.view_public {
            return Err(Error::BadViewKey);
        }
        if self.find_account_direct(&account.address)?.is_some() {
            return Err(Error::AccountExists);
        }

        let accounts = self.inner.cf(CF_ACCOUNTS)?;
        let by_address = self.inner.cf(CF_ACCOUNTS_BY_ADDRESS)?;
        let by_height = self.inner.cf(CF_ACCOUNTS_BY_HEIGHT)?;
        batch.put_cf(
            &by_address,
            account.address.to_bytes(),
            lookup_value(AccountStatus::Active, account.id),
        );
        batch.put_cf(
            &by_height,
            height_index_key(account.scan_height, account.id),
            [AccountStatus::Active as u8],
        );
        batch.put_cf(
            &accounts,
            account_key(AccountStatus::Active, account.id),
            encode_account(account),
        );
        Ok(())
    }

    /// Register a new active account, scanning from the current chain tip.
    pub fn add_account(&self, address: AccountAddress, key: SecretKey) -> Result<(), Error> {
        let _guard = self.lock_writer();
        let now = current_time()?;
        let height = self.last_block_direct()?.height;
        let account = Account {
            id: self.next_account_id()?,
            access: now,
            address,
            view_key: key,
            scan_height: height,
            start_height: height,
            creation: now,
        };
        let mut batch = WriteBatch::default();
        self.put_new_account(&mut batch, &account)?;
        self.inner.db.write(batch).map_err(StorageError::Backend)?;
        Ok(())
    }

    /// Queue a request to create the account, to be accepted or rejected by
    /// an operator.
    pub fn creation_request(
        &self,
        address: AccountAddress,
        key: SecretKey,
    ) -> Result<(), Error> {
        if self.inner.create_queue_max == 0 {
            return Err(Error::CreateQueueMax);
        }
        let _guard = self.lock_writer();
        let now = current_time()?;

        if self.find_account_direct(&address)?.is_some() {
            return Err(Error::AccountExists);
        }

        let requests = self.inner.cf(CF_REQUESTS)?;
        let mut pending = 0;
        let prefix = [RequestType::Create as u8];
        for entry in self
            .inner
            .db
            .iterator_cf(&requests, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, _) = entry.map_err(StorageError::Backend)?;
            if key.first() != Some(&(RequestType::Create as u8)) {
                break;
            }
            pending += 1;
        }
        if pending >= self.inner.create_queue_max {
            return Err(Error::CreateQueueMax);
        }

        let request_key = request_key(RequestType::Create, &address);
        if self
            .inner
            .db
            .get_cf(&requests, request_key)
            .map_err(StorageError::Backend)?
            .is_some()
        {
            return Err(Error::DuplicateRequest);
        }

        let request = PendingRequest {
            address,
            view_key: key,
            start_height: self.last_block_direct()?.height,
            creation: now,
        };
        let mut value = Vec::new();
        request.write(&mut value).expect("vec write cannot fail");
        let mut batch = WriteBatch::default();
        batch.put_cf(&requests, request_key, value);
        self.inner.db.write(batch).map_err(StorageError::Backend)?;
        Ok(())
    }

    /// Queue a request to re-scan an existing account from `height`.
    pub fn import_request(
        &self,
        address: AccountAddress,
        height: BlockHeight,
    ) -> Result<(), Error> {
        let _guard = self.lock_writer();
        let now = current_time()?;
        if self.find_account_direct(&address)?.is_none() {
            return Err(Error::NoSuchAccount);
        }

        let requests = self.inner.cf(CF_REQUESTS)?;
        let request_key = request_key(RequestType::ImportScan, &address);
        if self
            .inner
            .db
            .get_cf(&requests, request_key)
            .map_err(StorageError::Backend)?
            .is_some()
        {
            return Err(Error::DuplicateRequest);
        }

        let request = PendingRequest {
            address,
            view_key: SecretKey::from_bytes([0; 32]),
            start_height: height,
            creation: now,
        };
        let mut value = Vec::new();
        request.write(&mut value).expect("vec write cannot fail");
        let mut batch = WriteBatch::default();
        batch.put_cf(&requests, request_key, value);
        self.inner.db.write(batch).map_err(StorageError::Backend)?;
        Ok(())
    }

    /// Accept pending requests of `kind` for `addresses`. Returns the
    /// addresses actually consumed; addresses with no pending request, or
    /// whose account state no longer permits the action, are skipped.
    pub fn accept_requests(
        &self,
        kind: RequestType,
        addresses: &[AccountAddress],
    ) -> Result<Vec<AccountAddress>, Error> {
        let _guard = self.lock_writer();
        let now = current_time()?;
        let requests = self.inner.cf(CF_REQUESTS)?;

        let mut accepted = Vec::with_capacity(addresses.len());
        let mut batch = WriteBatch::default();
        let mut next_id = self.next_account_id()?;

        for address in addresses {
            let request_key = request_key(kind, address);
            let Some(value) = self
                .inner
                .db
                .get_cf(&requests, request_key)
                .map_err(StorageError::Backend)?
            else {
                continue;
            };
            let request = decode_request(&value)?;
            batch.delete_cf(&requests, request_key);

            match kind {
                RequestType::Create => {
                    let account = Account {
                        id: next_id,
                        access: now,
                        address: *address,
                        view_key: request.view_key,
                        scan_height: request.start_height,
                        start_height: request.start_height,
                        creation: request.creation,
                    };
                    match self.put_new_account(&mut batch, &account) {
                        Ok(()) => {
                            next_id = AccountId(next_id.0 + 1);
                            accepted.push(*address);
                        }
                        Err(Error::AccountExists) | Err(Error::BadViewKey) => continue,
                        Err(e) => return Err(e),
                    }
                }
                RequestType::ImportScan => {
                    match self.change_height(&mut batch, address, request.start_height) {
                        Ok(()) => accepted.push(*address),
                        Err(Error::NoSuchAccount) => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        self.inner.db.write(batch).map_err(StorageError::Backend)?;
        Ok(accepted)
    }

    /// Drop pending requests of `kind` for `addresses`. Returns the
    /// addresses that had one.
    pub fn reject_requests(
        &self,
        kind: RequestType,
        addresses: &[AccountAddress],
    ) -> Result<Vec<AccountAddress>, Error> {
        let _guard = self.lock_writer();
        let requests = self.inner.cf(CF_REQUESTS)?;

        let mut rejected = Vec::new();
        let mut batch = WriteBatch::default();
        for address in addresses {
            let request_key = request_key(kind, address);
            if self
                .inner
                .db
                .get_cf(&requests, request_key)
                .map_err(StorageError::Backend)?
                .is_some()
            {
                batch.delete_cf(&requests, request_key);
                rejected.push(*address);
            }
        }
        self.inner.db.write(batch).map_err(StorageError::Backend)?;
        Ok(rejected)
    }

    /// Move `addresses` to `status`. Returns the addresses found.
    pub fn change_status(
        &self,
        status: AccountStatus,
        addresses: &[AccountAddress],
    ) -> Result<Vec<AccountAddress>, Error> {
        let _guard = self.lock_writer();
        let accounts = self.inner.cf(CF_ACCOUNTS)?;
        let by_address = self.inner.cf(CF_ACCOUNTS_BY_ADDRESS)?;
        let by_height = self.inner.cf(CF_ACCOUNTS_BY_HEIGHT)?;

        let mut changed = Vec::with_capacity(addresses.len());
        let mut batch = WriteBatch::default();
        for address in addresses {
            let Some((current, account)) = self.find_account_direct(address)? else {
                continue;
            };
            if current != status {
                batch.delete_cf(&accounts, account_key(current, account.id));
                batch.put_cf(
                    &accounts,
                    account_key(status, account.id),
                    encode_account(&account),
                );
                batch.put_cf(
                    &by_address,
                    address.to_bytes(),
                    lookup_value(status, account.id),
                );
                batch.put_cf(
                    &by_height,
                    height_index_key(account.scan_height, account.id),
                    [status as u8],
                );
            }
            changed.push(*address);
        }
        self.inner.db.write(batch).map_err(StorageError::Backend)?;
        Ok(changed)
    }

    fn change_height(
        &self,
        batch: &mut WriteBatch,
        address: &AccountAddress,
        height: BlockHeight,
    ) -> Result<(), Error> {
        let (status, mut account) = self
            .find_account_direct(address)?
            .ok_or(Error::NoSuchAccount)?;
        let previous_height = account.scan_height;
        account.scan_height = account.scan_height.min(height);
        account.start_height = account.start_height.min(height);

        let accounts = self.inner.cf(CF_ACCOUNTS)?;
        let by_height = self.inner.cf(CF_ACCOUNTS_BY_HEIGHT)?;
        batch.put_cf(
            &accounts,
            account_key(status, account.id),
            encode_account(&account),
        );
        batch.delete_cf(&by_height, height_index_key(previous_height, account.id));
        batch.put_cf(
            &by_height,
            height_index_key(account.scan_height, account.id),
            [status as u8],
        );
        Ok(())
    }

    /// Roll the scan height of `addresses` back to `height`. Returns the
    /// addresses found.
    pub fn rescan(
        &self,
        height: BlockHeight,
        addresses: &[AccountAddress],
    ) -> Result<Vec<AccountAddress>, Error> {
        let _guard = self.lock_writer();
        let mut updated = Vec::with_capacity(addresses.len());
        let mut batch = WriteBatch::default();
        for address in addresses {
            match self.change_height(&mut batch, address, height) {
                Ok(()) => updated.push(*address),
                Err(Error::NoSuchAccount) => continue,
                Err(e) => return Err(e),
            }
        }
        self.inner.db.write(batch).map_err(StorageError::Backend)?;
        Ok(updated)
    }

    /// Touch an account's last access time.
    pub fn update_access_time(&self, address: &AccountAddress) -> Result<(), Error> {
        let _guard = self.lock_writer();
        let now = current_time()?;
        let (status, mut account) = self
            .find_account_direct(address)?
            .ok_or(Error::NoSuchAccount)?;
        account.access = now;
        let accounts = self.inner.cf(CF_ACCOUNTS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(
            &accounts,
            account_key(status, account.id),
            encode_account(&account),
        );
        self.inner.db.write(batch).map_err(StorageError::Backend)?;
        Ok(())
    }
}

/// Snapshot-isolated read handle.
pub struct StorageReader<'a> {
    inner: &'a StorageInner,
    snapshot: SnapshotWithThreadMode<'a, Db>,
}

impl<'a> StorageReader<'a> {
    /// Accounts in `status`, ordered by id.
    pub fn get_accounts(
        &self,
        status: AccountStatus,
    ) -> Result<impl Iterator<Item = Result<Account, Error>> + '_, Error> {
        let cf = self.inner.cf(CF_ACCOUNTS)?;
        let prefix = [status as u8];
        let iter = self
            .snapshot
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        Ok(iter
            .take_while(move |entry| match entry {
                Ok((key, _)) => key.first() == Some(&(status as u8)),
                Err(_) => true,
            })
            .map(|entry| {
                let (_, value) = entry.map_err(StorageError::Backend)?;
                decode_account(&value)
            }))
    }

    /// Look up an account by address.
    pub fn get_account(
        &self,
        address: &AccountAddress,
    ) -> Result<(AccountStatus, Account), Error> {
        let by_address = self.inner.cf(CF_ACCOUNTS_BY_ADDRESS)?;
        let lookup = self
            .snapshot
            .get_cf(&by_address, address.to_bytes())
            .map_err(StorageError::Backend)?
            .ok_or(Error::NoSuchAccount)?;
        let (status, id) = decode_lookup(&lookup)?;
        let accounts = self.inner.cf(CF_ACCOUNTS)?;
        let record = self
            .snapshot
            .get_cf(&accounts, account_key(status, id))
            .map_err(StorageError::Backend)?
            .ok_or(StorageError::MissingRecord("account for address lookup"))?;
        Ok((status, decode_account(&record)?))
    }

    /// Outputs received by an account, ordered by `(height, id)`.
    pub fn get_outputs(
        &self,
        account: AccountId,
    ) -> Result<impl Iterator<Item = Result<Output, Error>> + '_, Error> {
        let cf = self.inner.cf(CF_OUTPUTS)?;
        let prefix = account.0.to_be_bytes();
        let iter = self
            .snapshot
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        Ok(iter
            .take_while(move |entry| match entry {
                Ok((key, _)) => key.len() == 20 && key[..4] == prefix,
                Err(_) => true,
            })
            .map(|entry| {
                let (_, value) = entry.map_err(StorageError::Backend)?;
                decode_output(&value)
            }))
    }

    /// Global ids of all outputs received by an account, in ascending order.
    pub fn get_received_ids(&self, account: AccountId) -> Result<Vec<OutputId>, Error> {
        let cf = self.inner.cf(CF_OUTPUTS)?;
        let prefix = account.0.to_be_bytes();
        let mut ids = Vec::new();
        for entry in self
            .snapshot
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, _) = entry.map_err(StorageError::Backend)?;
            if key.len() != 20 || key[..4] != prefix {
                break;
            }
            ids.push(OutputId(u64::from_be_bytes(
                key[12..20].try_into().expect("8 bytes"),
            )));
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Spends recorded against one received output.
    pub fn get_spends(
        &self,
        source: OutputId,
    ) -> Result<impl Iterator<Item = Result<Spend, Error>> + '_, Error> {
        let cf = self.inner.cf(CF_SPENDS)?;
        let prefix = source.0.to_be_bytes();
        let iter = self
            .snapshot
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        Ok(iter
            .take_while(move |entry| match entry {
                Ok((key, _)) => key.len() == 40 && key[..8] == prefix,
                Err(_) => true,
            })
            .map(|entry| {
                let (_, value) = entry.map_err(StorageError::Backend)?;
                decode_spend(&value)
            }))
    }

    /// The newest block of the local chain tail.
    pub fn get_last_block(&self) -> Result<BlockInfo, Error> {
        let cf = self.inner.cf(CF_BLOCKS)?;
        let entry = self
            .snapshot
            .iterator_cf(&cf, IteratorMode::End)
            .next()
            .ok_or(StorageError::MissingRecord("chain tail"))?
            .map_err(StorageError::Backend)?;
        let (key, value) = entry;
        let height = BlockHeight(u64::from_be_bytes(
            key.as_ref()
                .try_into()
                .map_err(|_| StorageError::CorruptRecord(CF_BLOCKS))?,
        ));
        Ok(BlockInfo {
            height,
            hash: decode_hash(&value)?,
        })
    }

    /// Stored hash at `height`, if the tail covers it.
    pub fn get_block_hash(&self, height: BlockHeight) -> Result<Option<Hash>, Error> {
        let cf = self.inner.cf(CF_BLOCKS)?;
        match self
            .snapshot
            .get_cf(&cf, block_key(height))
            .map_err(StorageError::Backend)?
        {
            Some(bytes) => Ok(Some(decode_hash(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Probe list for chain synchronization: the ten newest tail hashes,
    /// exponentially spaced older ones, and the genesis hash, newest first.
    pub fn get_chain_sync(&self) -> Result<Vec<Hash>, Error> {
        let cf = self.inner.cf(CF_BLOCKS)?;
        let mut hashes = Vec::with_capacity(SYNC_PROBE_RECENT + 12);
        let mut anchor = BlockHeight(0);
        for entry in self
            .snapshot
            .iterator_cf(&cf, IteratorMode::End)
            .take(SYNC_PROBE_RECENT)
        {
            let (key, value) = entry.map_err(StorageError::Backend)?;
            anchor = BlockHeight(u64::from_be_bytes(
                key.as_ref()
                    .try_into()
                    .map_err(|_| StorageError::CorruptRecord(CF_BLOCKS))?,
            ));
            hashes.push(decode_hash(&value)?);
        }

        for i in 1..=SYNC_PROBE_SPARSE_MAX {
            let offset = 2u64 << i;
            if anchor.0 < offset {
                break;
            }
            let height = BlockHeight(anchor.0 - offset);
            let hash = self
                .get_block_hash(height)?
                .ok_or(StorageError::MissingRecord("probe hash"))?;
            hashes.push(hash);
        }

        if anchor.0 != 0 {
            let genesis = self
                .get_block_hash(BlockHeight(0))?
                .ok_or(StorageError::MissingRecord("genesis hash"))?;
            if hashes.last() != Some(&genesis) {
                hashes.push(genesis);
            }
        }
        Ok(hashes)
    }

    /// All pending operator requests.
    pub fn get_requests(
        &self,
    ) -> Result<impl Iterator<Item = Result<(RequestType, PendingRequest), Error>> + '_, Error>
    {
        let cf = self.inner.cf(CF_REQUESTS)?;
        let iter = self.snapshot.iterator_cf(&cf, IteratorMode::Start);
        Ok(iter.map(|entry| {
            let (key, value) = entry.map_err(StorageError::Backend)?;
            let kind = key
                .first()
                .and_then(|byte| RequestType::from_u8(*byte))
                .ok_or(StorageError::CorruptRecord(CF_REQUESTS))?;
            Ok((kind, decode_request(&value)?))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::tests::random_keypair;
    use crate::crypto::keccak256;
    use crate::db::data::{PackedExtra, PaymentId};

    fn open_store() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path(), Network::Testnet, 4).unwrap();
        (dir, storage)
    }

    fn test_address() -> (AccountAddress, SecretKey) {
        let (view_secret, view_public) = random_keypair();
        let (_, spend_public) = random_keypair();
        (
            AccountAddress {
                spend_public,
                view_public,
            },
            view_secret,
        )
    }

    fn chain_hash(n: u64) -> Hash {
        Hash(keccak256(&n.to_le_bytes()))
    }

    fn forked_hash(n: u64) -> Hash {
        Hash(keccak256(&[&n.to_le_bytes()[..], b"fork"].concat()))
    }

    /// Extend the tail from genesis up to `to`, inclusive.
    fn extend_chain(storage: &Storage, from: u64, to: u64) {
        let mut hashes = vec![if from == 0 {
            Network::Testnet.genesis_hash()
        } else {
            chain_hash(from)
        }];
        hashes.extend((from + 1..=to).map(chain_hash));
        storage.sync_chain(BlockHeight(from), &hashes).unwrap();
    }

    fn sample_output(height: u64, id: u64) -> Output {
        Output {
            height: BlockHeight(height),
            id: OutputId(id),
            amount: 1_000_000,
            timestamp: 0,
            unlock_time: 0,
            ring_size: 10,
            index: 0,
            tx_hash: Hash([1; 32]),
            tx_prefix_hash: Hash([2; 32]),
            tx_public: crate::crypto::PublicKey([3; 32]),
            ringct_mask: Hash::default(),
            extra: PackedExtra::pack(0, 0),
            payment_id: PaymentId::None,
        }
    }

    fn snapshot_of(storage: &Storage, address: &AccountAddress) -> ScanAccount {
        let reader = storage.start_read().unwrap();
        let (_, account) = reader.get_account(address).unwrap();
        let received = reader.get_received_ids(account.id).unwrap();
        ScanAccount::new(&account, received)
    }

    #[test]
    fn fresh_store_is_anchored_at_genesis() {
        let (_dir, storage) = open_store();
        let reader = storage.start_read().unwrap();
        let tail = reader.get_last_block().unwrap();
        assert_eq!(tail.height, BlockHeight(0));
        assert_eq!(tail.hash, Network::Testnet.genesis_hash());
        assert_eq!(reader.get_chain_sync().unwrap().len(), 1);
    }

    #[test]
    fn add_account_and_look_up() {
        let (_dir, storage) = open_store();
        let (address, view_secret) = test_address();
        storage.add_account(address, view_secret).unwrap();

        let reader = storage.start_read().unwrap();
        let (status, account) = reader.get_account(&address).unwrap();
        assert_eq!(status, AccountStatus::Active);
        assert_eq!(account.id, AccountId(1));
        assert_eq!(account.scan_height, BlockHeight(0));

        let active: Vec<_> = reader
            .get_accounts(AccountStatus::Active)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(active.len(), 1);

        assert!(matches!(
            storage.add_account(address, view_secret),
            Err(Error::AccountExists)
        ));
    }

    #[test]
    fn mismatched_view_key_is_rejected() {
        let (_dir, storage) = open_store();
        let (address, _) = test_address();
        let (other_secret, _) = random_keypair();
        assert!(matches!(
            storage.add_account(address, other_secret),
            Err(Error::BadViewKey)
        ));
    }

    #[test]
    fn update_appends_chain_and_records_output_and_spend() {
        let (_dir, storage) = open_store();
        extend_chain(&storage, 0, 50);
        let (address, view_secret) = test_address();
        storage.add_account(address, view_secret).unwrap();

        let mut user = snapshot_of(&storage, &address);
        assert_eq!(user.scan_height(), BlockHeight(50));

        user.add_output(sample_output(60, 777));
        user.check_spends(BlockHeight(70), &KeyImage([9; 32]), &[777]);

        let mut chain = vec![chain_hash(50)];
        chain.extend((51..=100).map(chain_hash));
        let updated = storage.update(BlockHeight(50), &chain, &[user]).unwrap();
        assert_eq!(updated, 1);

        let reader = storage.start_read().unwrap();
        assert_eq!(reader.get_last_block().unwrap().height, BlockHeight(100));
        let (_, account) = reader.get_account(&address).unwrap();
        assert_eq!(account.scan_height, BlockHeight(100));

        let outputs: Vec<_> = reader
            .get_outputs(account.id)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].id, OutputId(777));

        let spends: Vec<_> = reader
            .get_spends(OutputId(777))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(spends.len(), 1);
        assert_eq!(spends[0].key_image, KeyImage([9; 32]));
    }

    #[test]
    fn conflicting_commit_fails_and_writes_nothing() {
        let (_dir, storage) = open_store();
        extend_chain(&storage, 0, 50);
        let (address, view_secret) = test_address();
        storage.add_account(address, view_secret).unwrap();

        // winner extends the tail to 100
        let winner = snapshot_of(&storage, &address);
        let mut chain = vec![chain_hash(50)];
        chain.extend((51..=100).map(chain_hash));
        assert_eq!(storage.update(BlockHeight(50), &chain, &[winner]).unwrap(), 1);

        // reconstruct the pre-commit snapshot a losing worker would hold
        let loser = {
            let reader = storage.start_read().unwrap();
            let (_, mut account) = reader.get_account(&address).unwrap();
            account.scan_height = BlockHeight(50);
            ScanAccount::new(&account, Vec::new())
        };
        let mut bad_output = loser.clone();
        bad_output.add_output(sample_output(60, 555));
        let mut forked = vec![chain_hash(50)];
        forked.extend((51..=80).map(forked_hash));
        assert!(matches!(
            storage.update(BlockHeight(50), &forked, &[bad_output]),
            Err(Error::BlockchainReorg)
        ));

        // the winner's post-state is untouched
        let reader = storage.start_read().unwrap();
        assert_eq!(reader.get_last_block().unwrap().height, BlockHeight(100));
        assert_eq!(
            reader.get_block_hash(BlockHeight(80)).unwrap(),
            Some(chain_hash(80))
        );
        let (_, account) = reader.get_account(&address).unwrap();
        assert_eq!(account.scan_height, BlockHeight(100));
        let outputs: Vec<_> = reader
            .get_outputs(account.id)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert!(outputs.is_empty());
    }

    #[test]
    fn stale_snapshot_is_skipped() {
        let (_dir, storage) = open_store();
        extend_chain(&storage, 0, 50);
        let (address, view_secret) = test_address();
        storage.add_account(address, view_secret).unwrap();
        let user = snapshot_of(&storage, &address);

        // scan height moved underneath the worker
        storage.rescan(BlockHeight(10), &[address]).unwrap();

        let mut chain = vec![chain_hash(50)];
        chain.extend((51..=60).map(chain_hash));
        let updated = storage.update(BlockHeight(50), &chain, &[user]).unwrap();
        assert_eq!(updated, 0);

        let reader = storage.start_read().unwrap();
        let (_, account) = reader.get_account(&address).unwrap();
        assert_eq!(account.scan_height, BlockHeight(10));
    }

    #[test]
    fn hidden_account_still_commits_by_address() {
        let (_dir, storage) = open_store();
        extend_chain(&storage, 0, 50);
        let (address, view_secret) = test_address();
        storage.add_account(address, view_secret).unwrap();
        let user = snapshot_of(&storage, &address);

        storage
            .change_status(AccountStatus::Hidden, &[address])
            .unwrap();

        let mut chain = vec![chain_hash(50)];
        chain.extend((51..=60).map(chain_hash));
        assert_eq!(storage.update(BlockHeight(50), &chain, &[user]).unwrap(), 1);

        let reader = storage.start_read().unwrap();
        let (status, account) = reader.get_account(&address).unwrap();
        assert_eq!(status, AccountStatus::Hidden);
        assert_eq!(account.scan_height, BlockHeight(60));
    }

    #[test]
    fn reorg_truncates_tail_and_rolls_back_accounts() {
        let (_dir, storage) = open_store();
        extend_chain(&storage, 0, 50);
        let (address, view_secret) = test_address();
        storage.add_account(address, view_secret).unwrap();

        let mut user = snapshot_of(&storage, &address);
        user.add_output(sample_output(60, 777));
        user.add_output(sample_output(98, 888));
        user.check_spends(BlockHeight(99), &KeyImage([9; 32]), &[777]);
        let mut chain = vec![chain_hash(50)];
        chain.extend((51..=100).map(chain_hash));
        assert_eq!(storage.update(BlockHeight(50), &chain, &[user]).unwrap(), 1);

        // upstream replaces everything past 95
        let mut replacement = vec![chain_hash(95)];
        replacement.extend((96..=110).map(forked_hash));
        storage.sync_chain(BlockHeight(95), &replacement).unwrap();

        let reader = storage.start_read().unwrap();
        assert_eq!(reader.get_last_block().unwrap().height, BlockHeight(110));
        assert_eq!(
            reader.get_block_hash(BlockHeight(96)).unwrap(),
            Some(forked_hash(96))
        );
        assert_eq!(
            reader.get_block_hash(BlockHeight(95)).unwrap(),
            Some(chain_hash(95))
        );

        let (_, account) = reader.get_account(&address).unwrap();
        assert_eq!(account.scan_height, BlockHeight(95));

        // the output at 98 and the spend at 99 are gone, the output at 60 stays
        let outputs: Vec<_> = reader
            .get_outputs(account.id)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].id, OutputId(777));
        let spends: Vec<_> = reader
            .get_spends(OutputId(777))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert!(spends.is_empty());
    }

    #[test]
    fn creation_requests_enforce_caps_and_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path(), Network::Testnet, 2).unwrap();

        let (address, view_secret) = test_address();
        storage.creation_request(address, view_secret).unwrap();
        assert!(matches!(
            storage.creation_request(address, view_secret),
            Err(Error::DuplicateRequest)
        ));

        let (second, second_key) = test_address();
        storage.creation_request(second, second_key).unwrap();
        let (third, third_key) = test_address();
        assert!(matches!(
            storage.creation_request(third, third_key),
            Err(Error::CreateQueueMax)
        ));

        // accepting consumes the request and creates the account
        let accepted = storage
            .accept_requests(RequestType::Create, &[address])
            .unwrap();
        assert_eq!(accepted, vec![address]);
        let reader = storage.start_read().unwrap();
        assert!(reader.get_account(&address).is_ok());
        drop(reader);
        assert!(matches!(
            storage.creation_request(address, view_secret),
            Err(Error::AccountExists)
        ));

        // rejecting just drops the request
        let rejected = storage
            .reject_requests(RequestType::Create, &[second, third])
            .unwrap();
        assert_eq!(rejected, vec![second]);
        let reader = storage.start_read().unwrap();
        assert_eq!(reader.get_requests().unwrap().count(), 0);
    }

    #[test]
    fn import_request_rolls_back_on_accept() {
        let (_dir, storage) = open_store();
        extend_chain(&storage, 0, 50);
        let (address, view_secret) = test_address();
        storage.add_account(address, view_secret).unwrap();

        assert!(matches!(
            storage.import_request(test_address().0, BlockHeight(0)),
            Err(Error::NoSuchAccount)
        ));

        storage.import_request(address, BlockHeight(5)).unwrap();
        let accepted = storage
            .accept_requests(RequestType::ImportScan, &[address])
            .unwrap();
        assert_eq!(accepted, vec![address]);

        let reader = storage.start_read().unwrap();
        let (_, account) = reader.get_account(&address).unwrap();
        assert_eq!(account.scan_height, BlockHeight(5));
        assert_eq!(account.start_height, BlockHeight(5));
    }
}
