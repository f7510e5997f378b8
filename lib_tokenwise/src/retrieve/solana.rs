//! Typed wrappers over the Solana JSON-RPC methods the engine uses.
//!
//! Only the fields the engine reads are modelled; anything else in the
//! `jsonParsed` responses is ignored.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::RpcError;
use crate::retrieve::rpc_client::RpcClient;

pub const SPL_TOKEN_PROGRAM_ID: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5mW";

/// A token account holding the tracked mint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenAccount {
    pub pubkey: String,
    pub owner: String,
    /// Raw amount in base units.
    pub amount: u128,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MintInfo {
    /// Raw supply in base units.
    pub supply: u128,
    pub decimals: u8,
}

impl MintInfo {
    pub fn ui_supply(&self) -> f64 {
        to_ui_amount(self.supply, self.decimals)
    }
}

/// Scales a raw base-unit amount by `10^decimals`.
pub fn to_ui_amount(raw: u128, decimals: u8) -> f64 {
    raw as f64 / 10f64.powi(i32::from(decimals))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureInfo {
    pub signature: String,
    pub slot: u64,
    #[serde(default)]
    pub block_time: Option<i64>,
    #[serde(default)]
    pub err: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedTransaction {
    pub slot: u64,
    #[serde(default)]
    pub block_time: Option<i64>,
    #[serde(default)]
    pub meta: Option<TransactionMeta>,
    pub transaction: TransactionBody,
}

impl ParsedTransaction {
    pub fn account_keys(&self) -> impl Iterator<Item = &str> {
        self.transaction.message.account_keys.iter().map(AccountKey::pubkey)
    }

    /// Net change of `owner`'s `mint` balance in UI units, if the transaction touched it.
    pub fn token_delta(&self, owner: &str, mint: &str) -> Option<TokenDelta> {
        let meta = self.meta.as_ref()?;
        let sum = |balances: &[TokenBalance]| -> Option<f64> {
            let mut found = false;
            let mut total = 0.0;
            for b in balances.iter().filter(|b| b.mint == mint && b.owner.as_deref() == Some(owner)) {
                found = true;
                total += b.ui_token_amount.ui_value();
            }
            found.then_some(total)
        };
        let pre = sum(&meta.pre_token_balances);
        let post = sum(&meta.post_token_balances);
        if pre.is_none() && post.is_none() {
            return None;
        }
        let pre = pre.unwrap_or(0.0);
        let post = post.unwrap_or(0.0);
        Some(TokenDelta { pre, post, change: post - pre })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenDelta {
    pub pre: f64,
    pub post: f64,
    pub change: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMeta {
    #[serde(default)]
    pub err: Option<Value>,
    #[serde(default)]
    pub pre_token_balances: Vec<TokenBalance>,
    #[serde(default)]
    pub post_token_balances: Vec<TokenBalance>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBalance {
    pub mint: String,
    #[serde(default)]
    pub owner: Option<String>,
    pub ui_token_amount: UiTokenAmount,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiTokenAmount {
    pub amount: String,
    pub decimals: u8,
}

impl UiTokenAmount {
    fn ui_value(&self) -> f64 {
        self.amount
            .parse::<u128>()
            .map(|raw| to_ui_amount(raw, self.decimals))
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransactionBody {
    pub message: TransactionMessage,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMessage {
    #[serde(default)]
    pub account_keys: Vec<AccountKey>,
}

/// `jsonParsed` returns objects, the plain encodings return bare strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AccountKey {
    Plain(String),
    Parsed { pubkey: String },
}

impl AccountKey {
    pub fn pubkey(&self) -> &str {
        match self {
            AccountKey::Plain(key) => key,
            AccountKey::Parsed { pubkey } => pubkey,
        }
    }
}

// --- raw response shapes -------------------------------------------------

#[derive(Deserialize)]
struct RawProgramAccount {
    pubkey: String,
    account: RawAccount<RawTokenAccountInfo>,
}

#[derive(Deserialize)]
struct RawAccount<T> {
    data: RawParsedData<T>,
}

#[derive(Deserialize)]
struct RawParsedData<T> {
    parsed: RawParsed<T>,
}

#[derive(Deserialize)]
struct RawParsed<T> {
    info: T,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTokenAccountInfo {
    owner: String,
    token_amount: UiTokenAmount,
}

#[derive(Deserialize)]
struct RawMintInfo {
    supply: String,
    decimals: u8,
}

#[derive(Deserialize)]
struct RawAccountInfoResult {
    value: Option<RawAccount<RawMintInfo>>,
}

fn decode<T: serde::de::DeserializeOwned>(method: &str, value: Value) -> Result<T, RpcError> {
    serde_json::from_value(value).map_err(|e| RpcError::Malformed(format!("{method}: {e}")))
}

fn parse_raw_amount(method: &str, raw: &str) -> Result<u128, RpcError> {
    raw.parse::<u128>()
        .map_err(|e| RpcError::Malformed(format!("{method}: bad amount {raw:?}: {e}")))
}

impl RpcClient {
    /// All SPL token accounts of `mint`.
    pub async fn get_token_accounts(&self, mint: &str) -> Result<Vec<TokenAccount>, RpcError> {
        let params = json!([
            SPL_TOKEN_PROGRAM_ID,
            {
                "encoding": "jsonParsed",
                "filters": [{ "memcmp": { "offset": 0, "bytes": mint } }],
                "commitment": "confirmed"
            }
        ]);
        let raw = self.call("getProgramAccounts", params).await?;
        if raw.is_null() {
            return Ok(Vec::new());
        }
        let accounts: Vec<RawProgramAccount> = decode("getProgramAccounts", raw)?;
        accounts
            .into_iter()
            .map(|a| {
                let info = a.account.data.parsed.info;
                Ok(TokenAccount {
                    pubkey: a.pubkey,
                    owner: info.owner,
                    amount: parse_raw_amount("getProgramAccounts", &info.token_amount.amount)?,
                })
            })
            .collect()
    }

    /// Supply and decimals of `mint`; `None` when the account does not exist.
    pub async fn get_mint_info(&self, mint: &str) -> Result<Option<MintInfo>, RpcError> {
        let params = json!([mint, { "encoding": "jsonParsed", "commitment": "confirmed" }]);
        let raw = self.call("getAccountInfo", params).await?;
        let result: RawAccountInfoResult = decode("getAccountInfo", raw)?;
        result
            .value
            .map(|account| {
                let info = account.data.parsed.info;
                Ok(MintInfo {
                    supply: parse_raw_amount("getAccountInfo", &info.supply)?,
                    decimals: info.decimals,
                })
            })
            .transpose()
    }

    /// Most recent signatures touching `address`, newest first.
    pub async fn get_signatures_for_address(&self, address: &str, limit: usize) -> Result<Vec<SignatureInfo>, RpcError> {
        let params = json!([address, { "limit": limit, "commitment": "confirmed" }]);
        let raw = self.call("getSignaturesForAddress", params).await?;
        if raw.is_null() {
            return Ok(Vec::new());
        }
        decode("getSignaturesForAddress", raw)
    }

    /// A confirmed transaction in `jsonParsed` form; `None` if the node does not have it.
    pub async fn get_transaction(&self, signature: &str) -> Result<Option<ParsedTransaction>, RpcError> {
        let params = json!([
            signature,
            { "encoding": "jsonParsed", "commitment": "confirmed", "maxSupportedTransactionVersion": 0 }
        ]);
        let raw = self.call("getTransaction", params).await?;
        if raw.is_null() {
            return Ok(None);
        }
        decode("getTransaction", raw).map(Some)
    }
}
