//! Narrow chain adapter interfaces and their JSON-RPC implementations.
//!
//! The core never talks raw RPC: it consumes `LongChain` (Solana),
//! `ShortChain` (Arbitrum), and `KeyService` (the external signing oracle).

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::utils::retry::{with_backoff, RetryPolicy};
use crate::venues::error::{VenueError, VenueResult};

/// Lamports per SOL.
const LAMPORTS_PER_SOL: Decimal = dec!(1000000000);
/// Wei per ETH as a decimal scale.
const WEI_DECIMALS: u32 = 18;

/// Solana-side chain operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LongChain: Send + Sync {
    /// Native SOL balance of the trading wallet.
    async fn get_native_balance(&self) -> VenueResult<Decimal>;
    /// SPL token balance for the given mint.
    async fn get_token_balance(&self, mint: &str) -> VenueResult<Decimal>;
    async fn get_latest_blockhash(&self) -> VenueResult<String>;
    /// Submit a signed transaction, returning the signature.
    async fn send_raw_transaction(&self, tx: &[u8]) -> VenueResult<String>;
    /// Poll until the signature is finalized or `max_wait` elapses.
    async fn confirm_signature(&self, sig: &str, max_wait: Duration) -> VenueResult<bool>;
    async fn health_check(&self) -> bool;
}

/// Arbitrum-side chain operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ShortChain: Send + Sync {
    /// Native ETH balance of the trading wallet.
    async fn get_native_balance(&self) -> VenueResult<Decimal>;
    /// ERC-20 balance for the given contract.
    async fn get_token_balance(&self, contract: &str) -> VenueResult<Decimal>;
    /// Submit a signed transaction, returning the hash.
    async fn send_raw_transaction(&self, tx: &[u8]) -> VenueResult<String>;
    /// Wait for a receipt; true when the transaction succeeded.
    async fn wait_for_receipt(&self, hash: &str, timeout: Duration) -> VenueResult<bool>;
    async fn health_check(&self) -> bool;
}

/// The external signing oracle. Holds no keys in-process.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyService: Send + Sync {
    /// Sign a serialized Solana transaction (ed25519 under the hood).
    async fn sign_transaction(&self, tx: &[u8]) -> VenueResult<Vec<u8>>;
    /// Sign an EIP-712 payload, returning the hex signature.
    async fn sign_typed_data(&self, domain: &Value, message: &Value) -> VenueResult<String>;
}

/// Solana JSON-RPC client implementing `LongChain`.
pub struct SolanaRpc {
    http: reqwest::Client,
    url: String,
    wallet: String,
    retry: RetryPolicy,
}

impl SolanaRpc {
    pub fn new(url: impl Into<String>, wallet: impl Into<String>) -> VenueResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| VenueError::Network(e.to_string()))?;

        Ok(Self {
            http,
            url: url.into(),
            wallet: wallet.into(),
            retry: RetryPolicy::default(),
        })
    }

    async fn rpc_call(&self, method: &str, params: Value) -> VenueResult<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response = self.http.post(&self.url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(VenueError::from_status(status, text));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| VenueError::Network(format!("invalid rpc response: {}", e)))?;

        if let Some(err) = payload.get("error") {
            return Err(VenueError::Client(format!("rpc error: {}", err)));
        }

        payload
            .get("result")
            .cloned()
            .ok_or_else(|| VenueError::Network("rpc response missing result".into()))
    }

    async fn rpc_call_with_retry(&self, method: &str, params: Value) -> VenueResult<Value> {
        with_backoff(&self.retry, method, || {
            self.rpc_call(method, params.clone())
        })
        .await
    }
}

#[async_trait]
impl LongChain for SolanaRpc {
    #[instrument(skip(self))]
    async fn get_native_balance(&self) -> VenueResult<Decimal> {
        let result = self
            .rpc_call_with_retry("getBalance", json!([self.wallet]))
            .await?;
        let lamports = result
            .get("value")
            .and_then(Value::as_u64)
            .ok_or_else(|| VenueError::Network("malformed getBalance response".into()))?;
        Ok(Decimal::from(lamports) / LAMPORTS_PER_SOL)
    }

    #[instrument(skip(self))]
    async fn get_token_balance(&self, mint: &str) -> VenueResult<Decimal> {
        let result = self
            .rpc_call_with_retry(
                "getTokenAccountsByOwner",
                json!([self.wallet, {"mint": mint}, {"encoding": "jsonParsed"}]),
            )
            .await?;

        // Sum ui amounts across all token accounts for the mint.
        let mut total = Decimal::ZERO;
        if let Some(accounts) = result.get("value").and_then(Value::as_array) {
            for account in accounts {
                let amount = account
                    .pointer("/account/data/parsed/info/tokenAmount/uiAmountString")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<Decimal>().ok())
                    .unwrap_or(Decimal::ZERO);
                total += amount;
            }
        }
        Ok(total)
    }

    #[instrument(skip(self))]
    async fn get_latest_blockhash(&self) -> VenueResult<String> {
        let result = self
            .rpc_call_with_retry("getLatestBlockhash", json!([{"commitment": "finalized"}]))
            .await?;
        result
            .pointer("/value/blockhash")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| VenueError::Network("malformed blockhash response".into()))
    }

    #[instrument(skip(self, tx))]
    async fn send_raw_transaction(&self, tx: &[u8]) -> VenueResult<String> {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(tx);
        // Submission is not retried blindly: a duplicate send can double-spend
        // the intent. Transient failures surface to the caller's stage logic.
        let result = self
            .rpc_call("sendTransaction", json!([encoded, {"encoding": "base64"}]))
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| VenueError::Network("malformed sendTransaction response".into()))
    }

    #[instrument(skip(self))]
    async fn confirm_signature(&self, sig: &str, max_wait: Duration) -> VenueResult<bool> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let result = self
                .rpc_call_with_retry("getSignatureStatuses", json!([[sig]]))
                .await?;

            let status = result.pointer("/value/0");
            if let Some(status) = status.filter(|s| !s.is_null()) {
                if status.get("err").map(|e| !e.is_null()).unwrap_or(false) {
                    return Err(VenueError::Rejected(format!(
                        "transaction {} failed on chain",
                        sig
                    )));
                }
                let level = status
                    .get("confirmationStatus")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                if level == "confirmed" || level == "finalized" {
                    debug!(sig, level, "signature confirmed");
                    return Ok(true);
                }
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(sig, "confirmation timed out");
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn health_check(&self) -> bool {
        self.rpc_call("getHealth", json!([]))
            .await
            .map(|v| v.as_str() == Some("ok"))
            .unwrap_or(false)
    }
}

/// Arbitrum JSON-RPC client implementing `ShortChain`.
pub struct ArbitrumRpc {
    http: reqwest::Client,
    url: String,
    wallet: String,
    retry: RetryPolicy,
}

impl ArbitrumRpc {
    pub fn new(url: impl Into<String>, wallet: impl Into<String>) -> VenueResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| VenueError::Network(e.to_string()))?;

        Ok(Self {
            http,
            url: url.into(),
            wallet: wallet.into(),
            retry: RetryPolicy::default(),
        })
    }

    async fn rpc_call(&self, method: &str, params: Value) -> VenueResult<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response = self.http.post(&self.url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(VenueError::from_status(status, text));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| VenueError::Network(format!("invalid rpc response: {}", e)))?;

        if let Some(err) = payload.get("error") {
            return Err(VenueError::Client(format!("rpc error: {}", err)));
        }

        payload
            .get("result")
            .cloned()
            .ok_or_else(|| VenueError::Network("rpc response missing result".into()))
    }

    async fn rpc_call_with_retry(&self, method: &str, params: Value) -> VenueResult<Value> {
        with_backoff(&self.retry, method, || {
            self.rpc_call(method, params.clone())
        })
        .await
    }

    fn parse_quantity(hex_value: &str, decimals: u32) -> VenueResult<Decimal> {
        let trimmed = hex_value.trim_start_matches("0x");
        let raw = i128::from_str_radix(trimmed, 16)
            .map_err(|e| VenueError::Network(format!("bad hex quantity: {}", e)))?;
        Decimal::try_from_i128_with_scale(raw, decimals)
            .map(|d| d.normalize())
            .map_err(|e| VenueError::Network(format!("quantity out of range: {}", e)))
    }
}

#[async_trait]
impl ShortChain for ArbitrumRpc {
    #[instrument(skip(self))]
    async fn get_native_balance(&self) -> VenueResult<Decimal> {
        let result = self
            .rpc_call_with_retry("eth_getBalance", json!([self.wallet, "latest"]))
            .await?;
        let hex_value = result
            .as_str()
            .ok_or_else(|| VenueError::Network("malformed eth_getBalance response".into()))?;
        Self::parse_quantity(hex_value, WEI_DECIMALS)
    }

    #[instrument(skip(self))]
    async fn get_token_balance(&self, contract: &str) -> VenueResult<Decimal> {
        // balanceOf(address) selector + left-padded wallet address.
        let wallet = self.wallet.trim_start_matches("0x");
        let data = format!("0x70a08231{:0>64}", wallet);
        let result = self
            .rpc_call_with_retry(
                "eth_call",
                json!([{"to": contract, "data": data}, "latest"]),
            )
            .await?;
        let hex_value = result
            .as_str()
            .ok_or_else(|| VenueError::Network("malformed eth_call response".into()))?;
        // USDC on Arbitrum carries 6 decimals.
        Self::parse_quantity(hex_value, 6)
    }

    #[instrument(skip(self, tx))]
    async fn send_raw_transaction(&self, tx: &[u8]) -> VenueResult<String> {
        let encoded = format!("0x{}", hex::encode(tx));
        let result = self
            .rpc_call("eth_sendRawTransaction", json!([encoded]))
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| VenueError::Network("malformed send response".into()))
    }

    #[instrument(skip(self))]
    async fn wait_for_receipt(&self, hash: &str, timeout: Duration) -> VenueResult<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let result = self
                .rpc_call_with_retry("eth_getTransactionReceipt", json!([hash]))
                .await?;

            if !result.is_null() {
                let ok = result.get("status").and_then(Value::as_str) == Some("0x1");
                if !ok {
                    return Err(VenueError::Rejected(format!("transaction {} reverted", hash)));
                }
                return Ok(true);
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn health_check(&self) -> bool {
        self.rpc_call("eth_blockNumber", json!([])).await.is_ok()
    }
}

/// HTTP-backed signer: forwards payloads to the external signing oracle,
/// authenticating each request with an HMAC over the body.
pub struct RemoteKeyService {
    http: reqwest::Client,
    url: String,
    api_key: String,
    api_secret: String,
}

impl RemoteKeyService {
    pub fn new(
        url: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> VenueResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| VenueError::Network(e.to_string()))?;

        Ok(Self {
            http,
            url: url.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        })
    }

    /// Authenticate a request body toward the oracle: HMAC-SHA256 over the
    /// raw bytes, keyed by the shared API secret.
    fn request_signature(&self, body: &[u8]) -> VenueResult<String> {
        use hmac::{Hmac, Mac};
        use sha2::Sha256;

        let digest = Hmac::<Sha256>::new_from_slice(self.api_secret.as_bytes())
            .map_err(|_| VenueError::Auth("signer API secret is not a usable HMAC key".into()))
            .map(|mut mac| {
                mac.update(body);
                mac.finalize().into_bytes()
            })?;
        Ok(hex::encode(digest))
    }

    async fn post_signing_request(&self, path: &str, body: Value) -> VenueResult<Value> {
        let raw = serde_json::to_vec(&body)
            .map_err(|e| VenueError::Client(format!("unserializable signing request: {}", e)))?;
        let signature = self.request_signature(&raw)?;

        let response = self
            .http
            .post(format!("{}{}", self.url, path))
            .header("X-Api-Key", &self.api_key)
            .header("X-Signature", signature)
            .body(raw)
            .header("Content-Type", "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(VenueError::from_status(status, text));
        }

        response
            .json()
            .await
            .map_err(|e| VenueError::Network(format!("invalid signer response: {}", e)))
    }
}

#[async_trait]
impl KeyService for RemoteKeyService {
    async fn sign_transaction(&self, tx: &[u8]) -> VenueResult<Vec<u8>> {
        let result = self
            .post_signing_request("/v1/sign/solana", json!({"transaction": hex::encode(tx)}))
            .await?;
        let signed = result
            .get("signed_transaction")
            .and_then(Value::as_str)
            .ok_or_else(|| VenueError::Auth("signer returned no transaction".into()))?;
        hex::decode(signed).map_err(|e| VenueError::Auth(format!("undecodable signature: {}", e)))
    }

    async fn sign_typed_data(&self, domain: &Value, message: &Value) -> VenueResult<String> {
        let result = self
            .post_signing_request(
                "/v1/sign/typed-data",
                json!({"domain": domain, "message": message}),
            )
            .await?;
        result
            .get("signature")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| VenueError::Auth("signer returned no signature".into()))
    }
}
