//! Message-oriented connection to the full node.
//!
//! Requests and responses are JSON bodies in length-delimited frames over a
//! TCP socket. Every blocking point also watches the scanner's stop topic,
//! so a fired abort unwinds the caller within one poll.

use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::chain::{Block, Transaction};
use crate::config::SEND_TIMEOUT;
use crate::crypto::Hash;
use crate::error::{Error, TransportError};

/// Request body for `get_blocks_fast`.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetBlocksRequest {
    pub start_height: u64,
    pub prune: bool,
}

/// One block paired with its non-miner transactions, ordered by the
/// block's `tx_hashes`.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockEntry {
    pub block: Block,
    pub transactions: Vec<Transaction>,
}

/// Response body for `get_blocks_fast`. `output_indices[i]` holds one
/// sub-vector per transaction of block `i` (miner transaction first), each
/// listing the global ids of that transaction's outputs in order.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetBlocksResponse {
    pub start_height: u64,
    pub blocks: Vec<BlockEntry>,
    pub output_indices: Vec<Vec<Vec<u64>>>,
}

/// Request body for `get_hashes_fast`.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetHashesRequest {
    pub start_height: u64,
    /// Probe list of locally known hashes, newest first.
    pub known_hashes: Vec<Hash>,
}

/// Response body for `get_hashes_fast`: the chain continuation from the
/// first hash of `known_hashes` the daemon recognizes.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetHashesResponse {
    pub start_height: u64,
    pub hashes: Vec<Hash>,
}

#[derive(Serialize)]
struct RequestEnvelope<'a, T> {
    method: &'static str,
    params: &'a T,
}

#[derive(Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct ResponseEnvelope<T> {
    method: String,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    error: Option<String>,
}

/// Connection to the daemon plus a subscription to the stop topic.
pub struct NodeClient {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    stop: watch::Receiver<bool>,
}

impl NodeClient {
    /// Connect to the daemon's message socket.
    pub async fn connect(addr: &str, stop: watch::Receiver<bool>) -> Result<Self, Error> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(TransportError::Io)?;
        Ok(NodeClient {
            framed: Framed::new(stream, LengthDelimitedCodec::new()),
            stop,
        })
    }

    fn check_stopped(&self) -> Result<(), Error> {
        if *self.stop.borrow() {
            return Err(Error::AbortScan);
        }
        Ok(())
    }

    /// Resolve once the stop topic fires (or its sender is gone).
    async fn stop_fired(stop: &mut watch::Receiver<bool>) {
        loop {
            if *stop.borrow() {
                return;
            }
            if stop.changed().await.is_err() {
                return;
            }
        }
    }

    /// Send one request frame. Aborts promptly if the stop topic fires and
    /// maps a send that cannot complete within the send timeout to
    /// `DaemonConnectionFailure`.
    pub async fn send<T: Serialize>(
        &mut self,
        method: &'static str,
        params: &T,
    ) -> Result<(), Error> {
        self.check_stopped()?;
        let body = serde_json::to_vec(&RequestEnvelope { method, params })
            .map_err(TransportError::Json)?;
        tokio::select! {
            sent = self.framed.send(Bytes::from(body)) => {
                sent.map_err(TransportError::Io)?;
                Ok(())
            }
            _ = Self::stop_fired(&mut self.stop) => Err(Error::AbortScan),
            _ = tokio::time::sleep(SEND_TIMEOUT) => Err(Error::DaemonConnectionFailure),
        }
    }

    /// Receive the response to `method`, waiting at most `timeout`.
    ///
    /// Returns `AbortScan` if the stop topic fires first and
    /// `DaemonConnectionFailure` on timeout, leaving the request pending so
    /// an idempotent caller may re-send it.
    pub async fn receive<T: DeserializeOwned>(
        &mut self,
        method: &'static str,
        timeout: Duration,
    ) -> Result<T, Error> {
        self.check_stopped()?;
        let frame = tokio::select! {
            frame = self.framed.next() => frame,
            _ = Self::stop_fired(&mut self.stop) => return Err(Error::AbortScan),
            _ = tokio::time::sleep(timeout) => return Err(Error::DaemonConnectionFailure),
        };
        let frame = frame
            .ok_or(TransportError::ConnectionClosed)?
            .map_err(TransportError::Io)?;
        let envelope: ResponseEnvelope<T> =
            serde_json::from_slice(&frame).map_err(TransportError::Json)?;
        if envelope.method != method {
            return Err(TransportError::UnexpectedResponse {
                got: envelope.method,
                expected: method,
            }
            .into());
        }
        if let Some(message) = envelope.error {
            return Err(TransportError::ErrorReply(message).into());
        }
        envelope
            .result
            .ok_or_else(|| TransportError::ErrorReply("empty result".into()).into())
    }

    /// Sleep for `timeout` or until the stop topic fires, whichever is
    /// first. Used between idle block polls.
    pub async fn poll_wait(&mut self, timeout: Duration) -> Result<(), Error> {
        self.check_stopped()?;
        tokio::select! {
            _ = Self::stop_fired(&mut self.stop) => Err(Error::AbortScan),
            _ = tokio::time::sleep(timeout) => Ok(()),
        }
    }
}

/// Method name of the block fetch request.
pub const GET_BLOCKS: &str = "get_blocks_fast";
/// Method name of the chain continuation request.
pub const GET_HASHES: &str = "get_hashes_fast";
