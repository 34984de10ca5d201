//! Signer key extraction
//!
//! Reads the wallet's active receive descriptor from the node and pulls out
//! the master fingerprint, origin path and xpub:
//!
//! ```text
//! wpkh([d34db33f/84h/1h/0h]tpubDC.../0/*)#checksum
//!       ^^^^^^^^ ^^^^^^^^^ ^^^^^^^^^^
//!       xfp      path      xpub
//! ```
//!
//! If anything goes wrong the signer gets deterministic placeholder values
//! instead, marked [`KeyFidelity::Placeholder`]. Placeholders let the rest of
//! the pipeline run but are not valid key material.

use crate::wallet::WalletContext;
use miniscript::descriptor::{DescriptorPublicKey, DescriptorXKey};
use regfix_rpc::Error as RpcError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Script type of the node's default address type (bech32)
pub const DEFAULT_SCRIPT_TYPE: &str = "wpkh";

/// Origin path used for placeholder signers
pub const PLACEHOLDER_PATH: &str = "m/84'/1'/0'";

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("No active receive descriptor of type {0}")]
    NoReceiveDescriptor(String),

    #[error("Unsupported descriptor: {0}")]
    Unsupported(String),

    #[error("Key has no origin information")]
    MissingOrigin,

    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

/// Where a signer's key material came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyFidelity {
    /// Reported by the node
    Node,
    /// Synthetic fallback, not usable on-chain
    Placeholder,
}

/// Fingerprint, path and xpub of a descriptor key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyOrigin {
    pub xfp: String,
    pub bip32_path: String,
    pub xpub: String,
}

/// One signer of a scenario's quorum
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signer {
    /// Node wallet holding this signer's keys
    pub wallet: String,
    /// Display name in the fixture
    pub name: String,
    pub xpub: String,
    pub xfp: String,
    pub bip32_path: String,
    pub fidelity: KeyFidelity,
}

impl Signer {
    pub fn is_placeholder(&self) -> bool {
        self.fidelity == KeyFidelity::Placeholder
    }
}

#[derive(Debug, Deserialize)]
struct ListDescriptors {
    descriptors: Vec<DescriptorEntry>,
}

#[derive(Debug, Deserialize)]
struct DescriptorEntry {
    desc: String,
    #[serde(default)]
    active: bool,
    #[serde(default)]
    internal: bool,
}

/// Extract signer keys from `wallet`, falling back to placeholders.
pub fn extract_keys(wallet: &WalletContext, signer_index: u32, name: &str) -> Signer {
    match read_receive_origin(wallet) {
        Ok(origin) => {
            log::info!(
                "[{}] Signer {} xfp={} path={}",
                wallet.name(),
                signer_index,
                origin.xfp,
                origin.bip32_path
            );
            Signer {
                wallet: wallet.name().to_string(),
                name: name.to_string(),
                xpub: origin.xpub,
                xfp: origin.xfp,
                bip32_path: origin.bip32_path,
                fidelity: KeyFidelity::Node,
            }
        }
        Err(e) => {
            log::warn!(
                "[{}] Key extraction failed ({}), using placeholder keys for signer {}",
                wallet.name(),
                e,
                signer_index
            );
            placeholder_signer(wallet.name(), signer_index, name)
        }
    }
}

fn read_receive_origin(wallet: &WalletContext) -> Result<KeyOrigin, KeyError> {
    let value = wallet.call("listdescriptors", &[])?;
    let listed: ListDescriptors =
        serde_json::from_value(value).map_err(|e| RpcError::Response {
            method: "listdescriptors".into(),
            reason: e.to_string(),
        })?;

    let prefix = format!("{}(", DEFAULT_SCRIPT_TYPE);
    let entry = listed
        .descriptors
        .iter()
        .find(|d| d.active && !d.internal && d.desc.starts_with(&prefix))
        .ok_or_else(|| KeyError::NoReceiveDescriptor(DEFAULT_SCRIPT_TYPE.to_string()))?;

    parse_key_origin(&entry.desc)
}

/// Parse `wpkh([xfp/path]xpub/...)#checksum` into its key origin.
pub fn parse_key_origin(descriptor: &str) -> Result<KeyOrigin, KeyError> {
    let body = descriptor.split('#').next().unwrap_or(descriptor);
    let key = body
        .strip_prefix(DEFAULT_SCRIPT_TYPE)
        .and_then(|rest| rest.strip_prefix('('))
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| KeyError::Unsupported(body.to_string()))?;

    let parsed =
        DescriptorPublicKey::from_str(key).map_err(|e| KeyError::InvalidKey(e.to_string()))?;

    let DescriptorPublicKey::XPub(DescriptorXKey { origin, xkey, .. }) = parsed else {
        return Err(KeyError::Unsupported(key.to_string()));
    };
    let (fingerprint, path) = origin.ok_or(KeyError::MissingOrigin)?;

    let mut bip32_path = String::from("m");
    for child in &path {
        bip32_path.push('/');
        bip32_path.push_str(&child.to_string());
    }

    Ok(KeyOrigin {
        xfp: fingerprint.to_string(),
        bip32_path,
        xpub: xkey.to_string(),
    })
}

/// Deterministic stand-in keys for signer `index`.
///
/// The fingerprint is the index as 4 zero-padded digits, twice
/// (index 1 → `00010001`).
pub fn placeholder_origin(index: u32) -> KeyOrigin {
    KeyOrigin {
        xfp: format!("{:04}{:04}", index, index),
        bip32_path: PLACEHOLDER_PATH.to_string(),
        xpub: format!("tpubPLACEHOLDER{:04}NOTAREALKEY", index),
    }
}

fn placeholder_signer(wallet: &str, index: u32, name: &str) -> Signer {
    let origin = placeholder_origin(index);
    Signer {
        wallet: wallet.to_string(),
        name: name.to_string(),
        xpub: origin.xpub,
        xfp: origin.xfp,
        bip32_path: origin.bip32_path,
        fidelity: KeyFidelity::Placeholder,
    }
}
