//! Fixture documents
//!
//! One JSON file per scenario in the wallet-configuration format accepted by
//! Caravan-style coordinators. The file's presence marks the scenario as
//! provisioned, so it is never overwritten unless explicitly forced.

use crate::keys::{KeyFidelity, Signer};
use crate::FixtureError;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const ADDRESS_TYPE: &str = "P2WSH";
pub const NETWORK: &str = "regtest";
pub const KEY_METHOD: &str = "text";
pub const CLIENT_TYPE: &str = "private";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quorum {
    pub required_signers: usize,
    pub total_signers: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedPublicKey {
    pub name: String,
    pub xpub: String,
    pub bip32_path: String,
    pub xfp: String,
    pub method: String,
}

impl From<&Signer> for ExtendedPublicKey {
    fn from(signer: &Signer) -> Self {
        Self {
            name: signer.name.clone(),
            xpub: signer.xpub.clone(),
            bip32_path: signer.bip32_path.clone(),
            xfp: signer.xfp.clone(),
            method: KEY_METHOD.to_string(),
        }
    }
}

/// Node connection the coordinator UI should use
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub username: String,
    pub password: String,
    /// Watch-only wallet tracking the quorum
    pub wallet_name: String,
}

impl ClientConfig {
    pub fn private(
        url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        wallet_name: impl Into<String>,
    ) -> Self {
        Self {
            kind: CLIENT_TYPE.to_string(),
            url: url.into(),
            username: username.into(),
            password: password.into(),
            wallet_name: wallet_name.into(),
        }
    }
}

/// Exported wallet configuration for one scenario
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureDocument {
    pub name: String,
    pub address_type: String,
    pub network: String,
    pub quorum: Quorum,
    pub extended_public_keys: Vec<ExtendedPublicKey>,
    pub starting_address_index: u32,
    pub client: ClientConfig,
    /// `placeholder` if any signer fell back to synthetic keys
    pub key_fidelity: KeyFidelity,
}

impl FixtureDocument {
    pub fn new(
        name: impl Into<String>,
        required_signers: usize,
        signers: &[Signer],
        client: ClientConfig,
    ) -> Self {
        let key_fidelity = if signers.iter().any(Signer::is_placeholder) {
            KeyFidelity::Placeholder
        } else {
            KeyFidelity::Node
        };
        Self {
            name: name.into(),
            address_type: ADDRESS_TYPE.to_string(),
            network: NETWORK.to_string(),
            quorum: Quorum {
                required_signers,
                total_signers: signers.len(),
            },
            extended_public_keys: signers.iter().map(ExtendedPublicKey::from).collect(),
            starting_address_index: 0,
            client,
            key_fidelity,
        }
    }

    pub fn load(path: &Path) -> Result<Self, FixtureError> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Write to `path`.
    ///
    /// Fails with `AlreadyExists` if the file is there and `force` is unset.
    pub fn save(&self, path: &Path, force: bool) -> Result<(), FixtureError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut contents = serde_json::to_string_pretty(self)?;
        contents.push('\n');

        let mut options = OpenOptions::new();
        options.write(true);
        if force {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        let mut file = options.open(path)?;
        file.write_all(contents.as_bytes())?;
        Ok(())
    }
}

/// `<dir>/<slug>.json`
pub fn fixture_path(dir: &Path, slug: &str) -> PathBuf {
    dir.join(format!("{}.json", slug))
}
