//! Bitcoin Core JSON-RPC source.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

pub use reqwest::Client;
use reqwest::StatusCode;
pub use url::Url;

use super::{Error, FetchedBlock, Source};
use crate::{BlockHash, BlockRecord, Height, TransactionRecord};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const SATOSHIS_PER_COIN: f64 = 100_000_000.0;
// `RPC_INVALID_PARAMETER`, returned by `getblockhash` above the tip
const RPC_INVALID_PARAMETER: i64 = -8;

/// Invalid [`RpcConfig`] settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Url(#[from] url::ParseError),
    #[error("unsupported url scheme `{0}`")]
    Scheme(String),
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

/// Connection settings of a [`RpcSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcConfig {
    url: Url,
    user: String,
    password: String,
    timeout: Duration,
}

impl RpcConfig {
    /// Validate connection settings.
    ///
    /// A bare `host:port` endpoint is accepted and defaults to plain `http`.
    pub fn new(endpoint: &str, user: impl Into<String>, password: impl Into<String>) -> Result<Self, ConfigError> {
        let endpoint = endpoint.trim();
        let url = if endpoint.contains("://") {
            Url::parse(endpoint)?
        } else {
            Url::parse(&format!("http://{endpoint}"))?
        };

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::Scheme(url.scheme().to_owned()));
        }

        let user = user.into().trim().to_owned();
        let password = password.into().trim().to_owned();

        if user.is_empty() {
            return Err(ConfigError::Empty("rpc user"));
        }
        if password.is_empty() {
            return Err(ConfigError::Empty("rpc password"));
        }

        Ok(Self {
            url,
            user,
            password,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Build a new `RpcConfig` with a given per-request timeout.
    #[inline]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    #[inline]
    pub fn user(&self) -> &str {
        &self.user
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// A [`Source`] talking to a Bitcoin Core node over HTTP JSON-RPC.
#[derive(Debug)]
pub struct RpcSource {
    client: Client,
    config: RpcConfig,
    next_id: AtomicU64,
}

impl RpcSource {
    pub fn new(config: RpcConfig) -> Result<Self, Error> {
        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            config,
            next_id: AtomicU64::new(0),
        })
    }

    /// Replace the underlying HTTP client, e.g. to share a connection pool.
    #[inline]
    pub fn with_client(self, client: Client) -> Self {
        Self { client, ..self }
    }

    #[inline]
    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    async fn call<T: DeserializeOwned>(&self, method: &'static str, params: Value) -> Result<T, Error> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({ "jsonrpc": "1.0", "id": id, "method": method, "params": params });

        tracing::trace!("Calling rpc method {method} (id {id})");

        let resp = self
            .client
            .post(self.config.url.clone())
            .basic_auth(&self.config.user, Some(&self.config.password))
            .json(&request)
            .send()
            .await
            .map_err(|err| transport_error(err, method))?;

        // bitcoind reports RPC level errors with a JSON body on 404/500
        let resp = match resp.status() {
            status if status.is_success() => resp,
            StatusCode::NOT_FOUND | StatusCode::INTERNAL_SERVER_ERROR => resp,
            _ => resp.error_for_status()?,
        };

        let body = resp.bytes().await.map_err(|err| transport_error(err, method))?;

        decode(method, body)
    }
}

impl Source for RpcSource {
    fn best_height(&self) -> BoxFuture<'_, Result<Height, Error>> {
        self.call::<Height>("getblockcount", json!([])).boxed()
    }

    fn hash_at(&self, height: Height) -> BoxFuture<'_, Result<BlockHash, Error>> {
        async move {
            match self.call::<BlockHash>("getblockhash", json!([height])).await {
                Err(Error::Rpc {
                    code: RPC_INVALID_PARAMETER,
                    ..
                }) => Err(Error::HeightOutOfRange { height }),
                res => res,
            }
        }
        .boxed()
    }

    fn fetch_block<'a>(&'a self, hash: &'a str) -> BoxFuture<'a, Result<FetchedBlock, Error>> {
        async move {
            let block: VerboseBlock = self.call("getblock", json!([hash, 2])).await?;

            Ok(block.normalize(Utc::now()))
        }
        .boxed()
    }
}

fn transport_error(err: reqwest::Error, method: &'static str) -> Error {
    if err.is_timeout() {
        Error::Timeout { method }
    } else {
        Error::Reqwest(err)
    }
}

fn decode<T: DeserializeOwned>(method: &'static str, body: Bytes) -> Result<T, Error> {
    let response: Response<T> = serde_json::from_slice(&body)?;

    if let Some(ErrorObject { code, message }) = response.error {
        return Err(Error::Rpc { code, message });
    }

    response.result.ok_or(Error::EmptyResult { method })
}

#[derive(Debug, Deserialize)]
struct Response<T> {
    result: Option<T>,
    error: Option<ErrorObject>,
}

#[derive(Debug, Deserialize)]
struct ErrorObject {
    code: i64,
    message: String,
}

/// `getblock` result with verbosity 2.
#[derive(Debug, Deserialize)]
struct VerboseBlock {
    hash: String,
    height: Height,
    time: i64,
    size: u32,
    weight: u32,
    #[serde(rename = "previousblockhash", default)]
    previous_block_hash: Option<String>,
    #[serde(rename = "merkleroot")]
    merkle_root: String,
    nonce: u32,
    bits: String,
    difficulty: f64,
    tx: Vec<VerboseTransaction>,
}

#[derive(Debug, Deserialize)]
struct VerboseTransaction {
    txid: String,
    size: u32,
    vsize: u32,
    weight: u32,
    vin: Vec<serde::de::IgnoredAny>,
    vout: Vec<VerboseOutput>,
}

#[derive(Debug, Deserialize)]
struct VerboseOutput {
    value: f64,
}

impl VerboseBlock {
    fn normalize(self, processed_at: DateTime<Utc>) -> FetchedBlock {
        let timestamp = DateTime::from_timestamp(self.time, 0).unwrap_or_default();

        let transactions = self
            .tx
            .into_iter()
            .map(|tx| TransactionRecord {
                txid: tx.txid,
                block_hash: self.hash.clone(),
                block_height: self.height,
                size: tx.size,
                vsize: tx.vsize,
                weight: tx.weight,
                fee: 0,
                input_count: tx.vin.len(),
                output_count: tx.vout.len(),
                input_value: 0,
                output_value: tx.vout.iter().map(|out| (out.value * SATOSHIS_PER_COIN).round() as i64).sum(),
                timestamp,
                processed_at,
            })
            .collect::<Vec<_>>();

        let block = BlockRecord {
            hash: self.hash,
            height: self.height,
            timestamp,
            size: self.size,
            weight: self.weight,
            tx_count: transactions.len(),
            previous_block_hash: self.previous_block_hash,
            merkle_root: self.merkle_root,
            nonce: self.nonce,
            bits: self.bits,
            difficulty: self.difficulty,
            processed_at,
        };

        (block, transactions)
    }
}
