//! Polymarket CLOB (Central Limit Order Book) client for order execution.
//!
//! The core only depends on the [`ExchangeClient`] trait: book snapshots,
//! FOK/GTC submission, cancellation, status lookup and collateral balance.
//! [`ClobClient`] is the HTTP implementation; it signs orders with EIP-712
//! and authenticates writes with the L2 HMAC headers.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use alloy_primitives::{Address, U256};
use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE as BASE64_URL_SAFE};
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::RwLock;
use tracing::debug;

use crate::models::Side;
use crate::trading::Credentials;

use super::error::ApiError;
use super::retry::RetryPolicy;
use super::types::{BalanceResponse, OrderBook};

/// CLOB API base URL
pub const CLOB_URL: &str = "https://clob.polymarket.com";

/// Polymarket CTF Exchange contract on Polygon
pub const CTF_EXCHANGE: &str = "0x4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E";
/// Neg Risk CTF Exchange for multi-outcome markets
pub const NEG_RISK_CTF_EXCHANGE: &str = "0xC5d563A36AE78145C45a50134d48A1215220f80a";

const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";
/// USDC and outcome tokens both use 6 decimals
const TOKEN_DECIMALS: u32 = 6;

type HmacSha256 = Hmac<Sha256>;

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    /// Good-til-cancelled limit order
    Gtc,
    /// Fill-or-kill market order
    Fok,
}

/// What the core asks the exchange to do.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub token_id: String,
    pub side: Side,
    /// Limit price (0 to 1)
    pub price: Decimal,
    /// Size in shares
    pub shares: Decimal,
    pub order_type: OrderType,
}

/// Venue-reported order state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    /// Fully matched on submission
    Matched,
    /// Resting on the book
    Live,
    /// Accepted, matching delayed
    Delayed,
    /// Not matched (FOK miss)
    Unmatched,
    Cancelled,
    Unknown,
}

impl OrderState {
    pub fn parse(raw: &str) -> Self {
        match raw.to_lowercase().as_str() {
            "matched" | "filled" => OrderState::Matched,
            "live" | "open" => OrderState::Live,
            "delayed" => OrderState::Delayed,
            "unmatched" => OrderState::Unmatched,
            "cancelled" | "canceled" => OrderState::Cancelled,
            _ => OrderState::Unknown,
        }
    }
}

/// Result of a successful submission.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: String,
    pub state: OrderState,
    pub transaction_hash: Option<String>,
}

/// Fill progress of a submitted order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderFill {
    pub state: OrderState,
    pub size_matched: Decimal,
    pub original_size: Decimal,
}

/// The exchange capabilities the copy pipeline consumes.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Order book snapshot for one outcome token.
    async fn order_book(&self, token_id: &str) -> Result<OrderBook, ApiError>;

    /// Best-effort metadata fetch so a following submission is faster.
    async fn prewarm(&self, _token_id: &str) -> Result<(), ApiError> {
        Ok(())
    }

    /// Sign and submit an order.
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, ApiError>;

    /// Fill progress for a previously submitted order.
    async fn order_status(&self, order_id: &str) -> Result<OrderFill, ApiError>;

    /// Cancel a resting order; `Ok(false)` when the venue refused.
    async fn cancel_order(&self, order_id: &str) -> Result<bool, ApiError>;

    /// Free collateral (USDC).
    async fn collateral_balance(&self) -> Result<Decimal, ApiError>;
}

/// Order submission response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostOrderResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error_msg: String,
    #[serde(rename = "orderID", default)]
    order_id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    transactions_hashes: Vec<String>,
}

/// Order status response
#[derive(Debug, Clone, Deserialize)]
struct OrderStatusResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    original_size: Decimal,
    #[serde(default)]
    size_matched: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
struct NegRiskResponse {
    #[serde(default)]
    neg_risk: bool,
}

/// Signed order ready for submission
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignedOrder {
    salt: u64,
    maker: String,
    signer: String,
    taker: String,
    token_id: String,
    maker_amount: String,
    taker_amount: String,
    side: String,
    expiration: String,
    nonce: String,
    fee_rate_bps: String,
    signature_type: u8,
    signature: String,
}

/// Order submission request body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct OrderPayload {
    order: SignedOrder,
    owner: String,
    order_type: OrderType,
}

#[derive(Debug, Clone, Serialize)]
struct CancelPayload<'a> {
    #[serde(rename = "orderID")]
    order_id: &'a str,
}

/// CLOB API client for executing trades on Polymarket.
pub struct ClobClient {
    http: Client,
    base_url: String,
    signer: Option<PrivateKeySigner>,
    credentials: Credentials,
    chain_id: u64,
    retry: RetryPolicy,
    neg_risk: RwLock<HashMap<String, bool>>,
}

impl ClobClient {
    /// Create a trading client.
    ///
    /// # Arguments
    /// * `credentials` - private key (hex, with or without 0x) and L2 API credentials
    /// * `chain_id` - Polygon chain ID (137 for mainnet, 80002 for Amoy testnet)
    pub fn new(credentials: Credentials, chain_id: u64) -> anyhow::Result<Self> {
        let pk = credentials
            .private_key
            .strip_prefix("0x")
            .unwrap_or(&credentials.private_key);
        let signer = PrivateKeySigner::from_str(pk).context("Invalid private key")?;

        let mut client = Self::read_only()?;
        client.signer = Some(signer);
        client.credentials = credentials;
        client.chain_id = chain_id;
        Ok(client)
    }

    /// Client that can read books but refuses to trade (paper mode).
    pub fn read_only() -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: CLOB_URL.to_string(),
            signer: None,
            credentials: Credentials::default(),
            chain_id: 137,
            retry: RetryPolicy::default(),
            neg_risk: RwLock::new(HashMap::new()),
        })
    }

    /// Get the wallet address.
    pub fn address(&self) -> Option<Address> {
        self.signer.as_ref().map(|s| s.address())
    }

    fn signer(&self) -> Result<&PrivateKeySigner, ApiError> {
        self.signer
            .as_ref()
            .ok_or_else(|| ApiError::Rejected("read-only client cannot trade".to_string()))
    }

    fn checksum_address(&self) -> Result<String, ApiError> {
        Ok(self.signer()?.address().to_checksum(None))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        authenticated: bool,
    ) -> Result<T, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.get(&url);
        if authenticated {
            let request_path = path.split('?').next().unwrap_or(path);
            request = request.headers(self.l2_headers(Method::GET, request_path, "")?);
        }
        let resp = request.send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, &text));
        }

        resp.json()
            .await
            .map_err(|e| ApiError::Other(anyhow!("Failed to parse {}: {}", path, e)))
    }

    async fn is_neg_risk(&self, token_id: &str) -> Result<bool, ApiError> {
        if let Some(flag) = self.neg_risk.read().await.get(token_id) {
            return Ok(*flag);
        }
        let resp: NegRiskResponse = self
            .get_json(&format!("/neg-risk?token_id={}", token_id), false)
            .await?;
        self.neg_risk
            .write()
            .await
            .insert(token_id.to_string(), resp.neg_risk);
        Ok(resp.neg_risk)
    }

    /// Build a signed order for submission.
    async fn build_signed_order(&self, order: &OrderRequest) -> Result<SignedOrder, ApiError> {
        let maker = self.checksum_address()?;
        let neg_risk = self.is_neg_risk(&order.token_id).await?;

        // BUY: maker pays USDC, receives shares. SELL: maker gives shares, receives USDC.
        let usdc = order.shares * order.price;
        let (maker_amount, taker_amount) = match order.side {
            Side::Buy => (to_base_units(usdc), to_base_units(order.shares)),
            Side::Sell => (to_base_units(order.shares), to_base_units(usdc)),
        };

        let salt = (uuid::Uuid::new_v4().as_u128() as u64) >> 11;
        let fields = OrderFields {
            salt: salt.to_string(),
            maker: maker.clone(),
            signer: maker.clone(),
            taker: ZERO_ADDRESS.to_string(),
            token_id: order.token_id.clone(),
            maker_amount,
            taker_amount,
            expiration: "0".to_string(),
            nonce: "0".to_string(),
            fee_rate_bps: "0".to_string(),
            side: match order.side {
                Side::Buy => 0,
                Side::Sell => 1,
            },
        };

        let exchange = if neg_risk { NEG_RISK_CTF_EXCHANGE } else { CTF_EXCHANGE };
        let signature = self.sign_order(&fields, exchange).await?;

        Ok(SignedOrder {
            salt,
            maker: fields.maker,
            signer: fields.signer,
            taker: fields.taker,
            token_id: fields.token_id,
            maker_amount: fields.maker_amount,
            taker_amount: fields.taker_amount,
            side: order.side.as_str().to_string(),
            expiration: fields.expiration,
            nonce: fields.nonce,
            fee_rate_bps: fields.fee_rate_bps,
            signature_type: 0,
            signature,
        })
    }

    /// Sign an order using EIP-712 typed data.
    async fn sign_order(&self, fields: &OrderFields, exchange: &str) -> Result<String, ApiError> {
        let struct_hash = fields.struct_hash()?;
        let domain_hash = domain_separator(self.chain_id, exchange)?;

        // keccak256("\x19\x01" + domainSeparator + structHash)
        let mut message = vec![0x19, 0x01];
        message.extend_from_slice(&domain_hash);
        message.extend_from_slice(&struct_hash);
        let digest = alloy_primitives::keccak256(&message);

        let signature = self
            .signer()?
            .sign_hash(&digest)
            .await
            .map_err(|e| ApiError::Other(anyhow!("Failed to sign order: {}", e)))?;

        Ok(format!("0x{}", hex::encode(signature.as_bytes())))
    }

    /// L2 headers: HMAC-SHA256 over `timestamp + method + path + body`.
    fn l2_headers(&self, method: Method, path: &str, body: &str) -> Result<HeaderMap, ApiError> {
        let timestamp = Utc::now().timestamp().to_string();
        let signature = hmac_signature(
            &self.credentials.api_secret,
            &format!("{}{}{}{}", timestamp, method.as_str(), path, body),
        )?;

        let mut headers = HeaderMap::new();
        let pairs = [
            ("poly_address", self.checksum_address()?),
            ("poly_signature", signature),
            ("poly_timestamp", timestamp),
            ("poly_api_key", self.credentials.api_key.clone()),
            ("poly_passphrase", self.credentials.api_passphrase.clone()),
        ];
        for (name, value) in pairs {
            let value = HeaderValue::from_str(&value)
                .map_err(|e| ApiError::Other(anyhow!("Invalid header {}: {}", name, e)))?;
            headers.insert(HeaderName::from_static(name), value);
        }
        Ok(headers)
    }

    async fn submit(&self, order: &OrderRequest) -> Result<OrderAck, ApiError> {
        let payload = OrderPayload {
            order: self.build_signed_order(order).await?,
            owner: self.credentials.api_key.clone(),
            order_type: order.order_type,
        };
        let body = serde_json::to_string(&payload)
            .map_err(|e| ApiError::Other(anyhow!("Failed to encode order: {}", e)))?;

        let resp = self
            .http
            .post(format!("{}/order", self.base_url))
            .headers(self.l2_headers(Method::POST, "/order", &body)?)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, &text));
        }

        let parsed: PostOrderResponse = resp
            .json()
            .await
            .map_err(|e| ApiError::Other(anyhow!("Failed to parse order response: {}", e)))?;

        if !parsed.success || parsed.order_id.is_empty() {
            let msg = if parsed.error_msg.is_empty() {
                format!("order not accepted (status {})", parsed.status)
            } else {
                parsed.error_msg
            };
            return Err(ApiError::from_message(&msg));
        }

        Ok(OrderAck {
            order_id: parsed.order_id,
            state: OrderState::parse(&parsed.status),
            transaction_hash: parsed.transactions_hashes.into_iter().next(),
        })
    }
}

#[async_trait]
impl ExchangeClient for ClobClient {
    async fn order_book(&self, token_id: &str) -> Result<OrderBook, ApiError> {
        let path = format!("/book?token_id={}", token_id);
        self.retry.run("order_book", || self.get_json(&path, false)).await
    }

    async fn prewarm(&self, token_id: &str) -> Result<(), ApiError> {
        self.is_neg_risk(token_id).await.map(|_| ())
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, ApiError> {
        debug!(
            token = %order.token_id,
            side = %order.side,
            price = %order.price,
            shares = %order.shares,
            order_type = ?order.order_type,
            "Submitting order"
        );
        // Submissions are not idempotent; never retried here.
        self.submit(order).await
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderFill, ApiError> {
        let path = format!("/data/order/{}", order_id);
        let resp: OrderStatusResponse = self
            .retry
            .run("order_status", || self.get_json(&path, true))
            .await?;
        Ok(OrderFill {
            state: OrderState::parse(&resp.status),
            size_matched: resp.size_matched,
            original_size: resp.original_size,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<bool, ApiError> {
        let body = serde_json::to_string(&CancelPayload { order_id })
            .map_err(|e| ApiError::Other(e.into()))?;
        let resp = self
            .http
            .delete(format!("{}/order", self.base_url))
            .headers(self.l2_headers(Method::DELETE, "/order", &body)?)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::FORBIDDEN {
            let text = resp.text().await.unwrap_or_default();
            return Err(ApiError::from_status(reqwest::StatusCode::FORBIDDEN, &text));
        }
        Ok(resp.status().is_success())
    }

    async fn collateral_balance(&self) -> Result<Decimal, ApiError> {
        let resp: BalanceResponse = self
            .retry
            .run("balance", || {
                self.get_json("/balance-allowance?asset_type=COLLATERAL&signature_type=0", true)
            })
            .await?;
        let raw = Decimal::from_str(&resp.balance)
            .map_err(|e| ApiError::Other(anyhow!("Bad balance {}: {}", resp.balance, e)))?;
        Ok(raw / Decimal::from(10u64.pow(TOKEN_DECIMALS)))
    }
}

/// Order fields in EIP-712 encoding order.
struct OrderFields {
    salt: String,
    maker: String,
    signer: String,
    taker: String,
    token_id: String,
    maker_amount: String,
    taker_amount: String,
    expiration: String,
    nonce: String,
    fee_rate_bps: String,
    side: u8,
}

impl OrderFields {
    fn struct_hash(&self) -> Result<[u8; 32], ApiError> {
        let type_hash = alloy_primitives::keccak256(
            b"Order(uint256 salt,address maker,address signer,address taker,uint256 tokenId,uint256 makerAmount,uint256 takerAmount,uint256 expiration,uint256 nonce,uint256 feeRateBps,uint8 side,uint8 signatureType)",
        );

        let mut encoded = Vec::with_capacity(13 * 32);
        encoded.extend_from_slice(type_hash.as_slice());
        encoded.extend_from_slice(&encode_uint256(&self.salt)?);
        encoded.extend_from_slice(&encode_address(&self.maker)?);
        encoded.extend_from_slice(&encode_address(&self.signer)?);
        encoded.extend_from_slice(&encode_address(&self.taker)?);
        encoded.extend_from_slice(&encode_uint256(&self.token_id)?);
        encoded.extend_from_slice(&encode_uint256(&self.maker_amount)?);
        encoded.extend_from_slice(&encode_uint256(&self.taker_amount)?);
        encoded.extend_from_slice(&encode_uint256(&self.expiration)?);
        encoded.extend_from_slice(&encode_uint256(&self.nonce)?);
        encoded.extend_from_slice(&encode_uint256(&self.fee_rate_bps)?);
        encoded.extend_from_slice(&encode_uint8(self.side));
        encoded.extend_from_slice(&encode_uint8(0)); // EOA signature type

        Ok(alloy_primitives::keccak256(&encoded).0)
    }
}

fn domain_separator(chain_id: u64, exchange: &str) -> Result<[u8; 32], ApiError> {
    let type_hash = alloy_primitives::keccak256(
        b"EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)",
    );
    let name_hash = alloy_primitives::keccak256(b"Polymarket CTF Exchange");
    let version_hash = alloy_primitives::keccak256(b"1");

    let mut encoded = Vec::with_capacity(5 * 32);
    encoded.extend_from_slice(type_hash.as_slice());
    encoded.extend_from_slice(name_hash.as_slice());
    encoded.extend_from_slice(version_hash.as_slice());
    encoded.extend_from_slice(&encode_uint256(&chain_id.to_string())?);
    encoded.extend_from_slice(&encode_address(exchange)?);

    Ok(alloy_primitives::keccak256(&encoded).0)
}

fn hmac_signature(secret: &str, message: &str) -> Result<String, ApiError> {
    // API secrets are URL-safe base64
    let key = BASE64_URL_SAFE
        .decode(secret)
        .or_else(|_| BASE64.decode(secret))
        .map_err(|e| ApiError::Other(anyhow!("Invalid API secret: {}", e)))?;
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| ApiError::Other(anyhow!("HMAC init failed: {}", e)))?;
    mac.update(message.as_bytes());
    Ok(BASE64_URL_SAFE.encode(mac.finalize().into_bytes()))
}

/// Decimal amount to 6-decimal base units, truncated.
fn to_base_units(amount: Decimal) -> String {
    (amount * Decimal::from(10u64.pow(TOKEN_DECIMALS)))
        .trunc()
        .normalize()
        .to_string()
}

/// Encode address to 32-byte padded format.
fn encode_address(addr: &str) -> Result<[u8; 32], ApiError> {
    let addr = Address::from_str(addr)
        .map_err(|e| ApiError::Other(anyhow!("Bad address {}: {}", addr, e)))?;
    let mut buf = [0u8; 32];
    buf[12..].copy_from_slice(addr.as_slice());
    Ok(buf)
}

/// Encode uint256 from a decimal string.
fn encode_uint256(value: &str) -> Result<[u8; 32], ApiError> {
    let n = U256::from_str(value)
        .map_err(|e| ApiError::Other(anyhow!("Bad uint256 {}: {}", value, e)))?;
    Ok(n.to_be_bytes())
}

/// Encode uint8 to 32-byte padded format.
fn encode_uint8(value: u8) -> [u8; 32] {
    let mut buf = [0u8; 32];
    buf[31] = value;
    buf
}
