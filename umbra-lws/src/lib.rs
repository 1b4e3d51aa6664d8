#![warn(missing_docs)]
#![doc = r#"
# Umbra Light-Wallet Server

Backend engine for light wallets on the umbra network. Wallets register
their view keys and public addresses; the server scans every block from a
trusted full node, detects which outputs belong to which account, decodes
confidential amounts, matches key images against received outputs for spend
detection, and serves balances, history and unspent outputs over a small
REST API. Wallets never download the chain themselves.

## Architecture

- [`db`] — the durable account store: accounts, outputs, spends and the
  local chain tail, with snapshot readers and a serialized writer whose
  commits are conditional on chain continuity.
- [`client`] — the message-oriented connection to the full node, with
  timeouts and abort signalling on every blocking point.
- [`sync`] — the scanning engine: a chain synchronizer that reconciles the
  local tail with the daemon (truncating on reorg), scan workers that
  stream and scan blocks, and a supervisor that partitions active accounts
  across workers and restarts them on any membership change.
- [`scan`] — the per-transaction viewkey scan itself.
- [`rest`] — the wallet-facing API.

The engine trusts the daemon for block data but verifies chain continuity
on every commit: a commit whose chain suffix no longer matches the stored
tail fails without writing, the worker exits, and the synchronizer
reconciles before scanning resumes.
"#]

pub mod account;
pub mod address;
pub mod chain;
pub mod client;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod rest;
pub mod scan;
pub mod sync;

pub use error::Error;
