//! `spoof_build_vars` configuration.
//!
//! A `KEY=VALUE` text file. `ATTESTATION_ID_<NAME>` and `MODULE_HASH` turn
//! into attestation overrides; the build identity keys feed `DeviceInfo`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::attestation::{
    TAG_ATTESTATION_ID_BRAND, TAG_ATTESTATION_ID_DEVICE, TAG_ATTESTATION_ID_IMEI,
    TAG_ATTESTATION_ID_MANUFACTURER, TAG_ATTESTATION_ID_MEID, TAG_ATTESTATION_ID_MODEL,
    TAG_ATTESTATION_ID_PRODUCT, TAG_ATTESTATION_ID_SECOND_IMEI, TAG_ATTESTATION_ID_SERIAL,
    TAG_MODULE_HASH,
};
use crate::device_info::DeviceProperties;
use crate::forge::{AuthValue, ForgeConfig};

const ATTESTATION_ID_PREFIX: &str = "ATTESTATION_ID_";
const MODULE_HASH: &str = "MODULE_HASH";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid MODULE_HASH: {0}")]
    InvalidModuleHash(#[from] hex::FromHexError),
}

/// Maps `ATTESTATION_ID_<NAME>` names to authorization list tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdTagTable {
    tags: BTreeMap<String, u32>,
}

impl Default for IdTagTable {
    fn default() -> Self {
        let mut table = IdTagTable::empty();
        for (name, tag) in [
            ("BRAND", TAG_ATTESTATION_ID_BRAND),
            ("DEVICE", TAG_ATTESTATION_ID_DEVICE),
            ("PRODUCT", TAG_ATTESTATION_ID_PRODUCT),
            ("SERIAL", TAG_ATTESTATION_ID_SERIAL),
            ("IMEI", TAG_ATTESTATION_ID_IMEI),
            ("MEID", TAG_ATTESTATION_ID_MEID),
            ("MANUFACTURER", TAG_ATTESTATION_ID_MANUFACTURER),
            ("MODEL", TAG_ATTESTATION_ID_MODEL),
            ("SECOND_IMEI", TAG_ATTESTATION_ID_SECOND_IMEI),
            ("IMEI2", TAG_ATTESTATION_ID_SECOND_IMEI),
        ] {
            table.insert(name, tag);
        }
        table
    }
}

impl IdTagTable {
    pub fn empty() -> Self {
        IdTagTable {
            tags: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, tag: u32) -> Option<u32> {
        self.tags.insert(name.into(), tag)
    }

    pub fn tag(&self, name: &str) -> Option<u32> {
        self.tags.get(name).copied()
    }
}

/// Parsed build variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildVars {
    vars: BTreeMap<String, String>,
}

impl BuildVars {
    /// Parse `KEY=VALUE` lines. Blank lines, `#` comments and lines
    /// without `=` are skipped; a repeated key keeps its last value.
    pub fn parse(text: &str) -> Self {
        let mut vars = BTreeMap::new();
        for line in text.lines() {
            if line.trim().is_empty() || line.trim_start().starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                debug!(line, "skipping line without `=`");
                continue;
            };
            vars.insert(key.trim().to_owned(), value.trim().to_owned());
        }
        BuildVars { vars }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        std::fs::read_to_string(path)
            .map(|text| Self::parse(&text))
            .map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Decoded `MODULE_HASH`, if set.
    pub fn module_hash(&self) -> Result<Option<Vec<u8>>, ConfigError> {
        match self.get(MODULE_HASH) {
            Some(value) => Ok(Some(hex::decode(value)?)),
            None => Ok(None),
        }
    }

    /// Attestation overrides: every `ATTESTATION_ID_<NAME>` the table knows,
    /// plus `MODULE_HASH`.
    pub fn forge_config(&self, table: &IdTagTable) -> ForgeConfig {
        let mut config = ForgeConfig::new();
        for (key, value) in &self.vars {
            let Some(name) = key.strip_prefix(ATTESTATION_ID_PREFIX) else {
                continue;
            };
            match table.tag(name) {
                Some(tag) => config.set(tag, AuthValue::Bytes(value.as_bytes().to_vec())),
                None => warn!(name, "unknown attestation id, skipping"),
            }
        }
        match self.module_hash() {
            Ok(Some(hash)) => config.set(TAG_MODULE_HASH, AuthValue::Bytes(hash)),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "skipping module hash"),
        }
        config
    }

    /// Identity for `DeviceInfo`; unset keys keep their defaults.
    pub fn device_properties(&self) -> DeviceProperties {
        let mut properties = DeviceProperties::default();
        for (key, field) in [
            ("BRAND", &mut properties.brand),
            ("MANUFACTURER", &mut properties.manufacturer),
            ("PRODUCT", &mut properties.product),
            ("MODEL", &mut properties.model),
            ("DEVICE", &mut properties.device),
        ] {
            if let Some(value) = self.get(key) {
                *field = value.to_owned();
            }
        }
        properties
    }
}

fn global() -> &'static ArcSwap<BuildVars> {
    static VARS: OnceLock<ArcSwap<BuildVars>> = OnceLock::new();
    VARS.get_or_init(|| ArcSwap::from_pointee(BuildVars::default()))
}

/// Build variables currently in effect.
pub fn current() -> Arc<BuildVars> {
    global().load_full()
}

/// Replace the process-wide build variables.
pub fn update(vars: BuildVars) {
    info!(count = vars.len(), "build vars updated");
    global().store(Arc::new(vars));
}
