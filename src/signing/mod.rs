//! Credentials and request signing for the Polymarket CLOB.
//!
//! - [`Credentials`] holds the wallet key and API secrets for the life of the process.
//! - [`create_signer`] turns the hex key into an alloy signer.
//! - [`sign_payload`] produces the EIP-191 signature carried in the order body.
//! - [`l2_headers`] builds the HMAC-authenticated request headers.

use std::fmt;

use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::debug;
use zeroize::Zeroizing;

use crate::config::Config;
use crate::error::{BotError, OrderError};

type HmacSha256 = Hmac<Sha256>;

/// A string that is never printed and is zeroed when dropped.
pub struct Secret(Zeroizing<String>);

impl Secret {
    /// Wrap a secret value. The string's buffer is taken over, not copied.
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    /// Borrow the secret. Never pass the result to a log macro.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Whether the secret is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// Wallet type used for order signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WalletKind {
    /// Externally owned account.
    #[default]
    Eoa,
    /// Magic.link proxy wallet.
    Proxy,
    /// Gnosis Safe.
    GnosisSafe,
}

impl WalletKind {
    /// Map the configured signature type. Unknown values fall back to EOA.
    pub fn from_u8(sig_type: u8) -> Self {
        match sig_type {
            1 => WalletKind::Proxy,
            2 => WalletKind::GnosisSafe,
            _ => WalletKind::Eoa,
        }
    }

    /// Numeric value sent in the order payload.
    pub fn as_u8(&self) -> u8 {
        match self {
            WalletKind::Eoa => 0,
            WalletKind::Proxy => 1,
            WalletKind::GnosisSafe => 2,
        }
    }
}

/// L2 API credentials.
#[derive(Debug)]
pub struct ApiCredentials {
    /// API key (sent as POLY_API_KEY).
    pub key: String,
    /// URL-safe base64 HMAC secret.
    pub secret: Secret,
    /// Passphrase (sent as POLY_PASSPHRASE).
    pub passphrase: Secret,
}

/// Signing material, loaded once at start-up.
#[derive(Debug)]
pub struct Credentials {
    /// Wallet private key, hex.
    pub private_key: Secret,
    /// API credentials; required for live trading.
    pub api: Option<ApiCredentials>,
    /// Wallet type.
    pub wallet_kind: WalletKind,
    /// Proxy wallet address, if any.
    pub funder: Option<String>,
}

impl Credentials {
    /// Move the credentials out of the loaded configuration.
    ///
    /// The key and API secrets are taken, leaving empty values behind, so the only
    /// live copy is the one held here.
    pub fn take_from(config: &mut Config) -> Result<Self, BotError> {
        let api = match (
            config.polymarket_api_key.take(),
            config.polymarket_api_secret.take(),
            config.polymarket_api_passphrase.take(),
        ) {
            (Some(key), Some(secret), Some(passphrase)) => Some(ApiCredentials {
                key,
                secret: Secret::new(secret),
                passphrase: Secret::new(passphrase),
            }),
            (None, None, None) => None,
            _ => {
                return Err(BotError::Signature(
                    "API key, secret and passphrase must be set together".to_string(),
                ))
            }
        };

        Ok(Self {
            private_key: Secret::new(std::mem::take(&mut config.polymarket_private_key)),
            api,
            wallet_kind: WalletKind::from_u8(config.polymarket_signature_type),
            funder: config.polymarket_funder.clone(),
        })
    }

    /// Build the wallet signer.
    pub fn signer(&self) -> Result<PrivateKeySigner, OrderError> {
        create_signer(self.private_key.expose())
    }
}

/// Create a LocalSigner from a hex-encoded private key.
///
/// The private key can be with or without the "0x" prefix.
pub fn create_signer(private_key: &str) -> Result<PrivateKeySigner, OrderError> {
    let key = private_key.strip_prefix("0x").unwrap_or(private_key);
    let bytes = hex::decode(key)
        .map(Zeroizing::new)
        .map_err(|e| OrderError::Signature(format!("invalid private key hex: {}", e)))?;

    if bytes.len() != 32 {
        return Err(OrderError::Signature(format!(
            "private key must be 32 bytes, got {}",
            bytes.len()
        )));
    }

    let mut key_bytes = Zeroizing::new([0u8; 32]);
    key_bytes.copy_from_slice(&bytes);

    PrivateKeySigner::from_bytes(&(*key_bytes).into())
        .map_err(|e| OrderError::Signature(format!("failed to create signer: {}", e)))
}

/// Wallet address for a signer, checksummed.
pub fn address_of(signer: &PrivateKeySigner) -> String {
    signer.address().to_checksum(None)
}

/// EIP-191 signature over an order payload, hex with 0x prefix.
pub async fn sign_payload(signer: &PrivateKeySigner, payload: &[u8]) -> Result<String, OrderError> {
    let signature = signer
        .sign_message(payload)
        .await
        .map_err(|e| OrderError::Signature(format!("failed to sign payload: {}", e)))?;
    Ok(format!("0x{}", hex::encode(signature.as_bytes())))
}

/// HMAC-SHA256 over `timestamp + method + path + body`, URL-safe base64.
pub fn l2_signature(
    secret: &Secret,
    timestamp: i64,
    method: &str,
    path: &str,
    body: &str,
) -> Result<String, OrderError> {
    let key = URL_SAFE
        .decode(secret.expose())
        .map_err(|e| OrderError::Signature(format!("API secret is not base64: {}", e)))?;

    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| OrderError::Signature(e.to_string()))?;
    mac.update(format!("{}{}{}{}", timestamp, method, path, body).as_bytes());

    Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
}

/// Build the L2 authentication headers for one request.
pub fn l2_headers(
    api: &ApiCredentials,
    address: &str,
    timestamp: i64,
    method: &str,
    path: &str,
    body: &str,
) -> Result<Vec<(&'static str, String)>, OrderError> {
    let signature = l2_signature(&api.secret, timestamp, method, path, body)?;
    debug!(address = %address, method, path, "Generated L2 auth headers");

    Ok(vec![
        ("POLY_ADDRESS", address.to_string()),
        ("POLY_API_KEY", api.key.clone()),
        ("POLY_PASSPHRASE", api.passphrase.expose().to_string()),
        ("POLY_TIMESTAMP", timestamp.to_string()),
        ("POLY_SIGNATURE", signature),
    ])
}
