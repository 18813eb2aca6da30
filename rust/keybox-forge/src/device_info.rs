//! RKP `DeviceInfo` map.

use tracing::warn;

use crate::cbor::{self, Value};

/// Digest reported when the boot state property is missing or malformed.
pub const FALLBACK_VBMETA_DIGEST: [u8; 32] = [
    0xd7, 0x59, 0x26, 0xe0, 0x16, 0xf5, 0xac, 0xee, 0x00, 0x52, 0x37, 0x12, 0xb8, 0x30, 0x37, 0x9c,
    0x53, 0x20, 0x3a, 0xc0, 0x8c, 0xb8, 0xa4, 0x85, 0x58, 0x30, 0x05, 0xf5, 0x29, 0xee, 0x75, 0x87,
];

/// Source of the verified boot digest reported in `vbmeta_digest`.
pub trait BootState {
    fn vbmeta_digest(&self) -> [u8; 32];
}

/// A fixed digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBootState(pub [u8; 32]);

impl BootState for FixedBootState {
    fn vbmeta_digest(&self) -> [u8; 32] {
        self.0
    }
}

/// Digest read from the `ro.boot.vbmeta.digest` property value (64 hex
/// digits).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyBootState {
    digest: [u8; 32],
}

impl PropertyBootState {
    pub fn new(property: Option<&str>) -> Self {
        let digest = match property.map(str::trim) {
            Some(value) => parse_digest(value).unwrap_or_else(|| {
                warn!(value, "malformed vbmeta digest property, using fallback");
                FALLBACK_VBMETA_DIGEST
            }),
            None => FALLBACK_VBMETA_DIGEST,
        };
        PropertyBootState { digest }
    }
}

impl BootState for PropertyBootState {
    fn vbmeta_digest(&self) -> [u8; 32] {
        self.digest
    }
}

fn parse_digest(value: &str) -> Option<[u8; 32]> {
    if value.len() != 64 {
        return None;
    }
    let mut digest = [0u8; 32];
    hex::decode_to_slice(value, &mut digest).ok()?;
    Some(digest)
}

/// Identity reported to the provisioning server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProperties {
    pub brand: String,
    pub manufacturer: String,
    pub product: String,
    pub model: String,
    pub device: String,
    pub vb_state: String,
    pub bootloader_state: String,
    pub os_version: String,
    pub system_patch_level: i64,
    pub vendor_patch_level: i64,
}

impl Default for DeviceProperties {
    fn default() -> Self {
        DeviceProperties {
            brand: "google".into(),
            manufacturer: "Google".into(),
            product: "generic".into(),
            model: "Pixel".into(),
            device: "generic".into(),
            vb_state: "green".into(),
            bootloader_state: "locked".into(),
            os_version: "15.0.0".into(),
            system_patch_level: 20250205,
            vendor_patch_level: 20250205,
        }
    }
}

/// Encode the `DeviceInfo` map. The digest is taken from `boot_state` at
/// call time.
pub fn build_device_info(properties: &DeviceProperties, boot_state: &dyn BootState) -> Vec<u8> {
    let entries = vec![
        ("brand", Value::text(properties.brand.as_str())),
        ("manufacturer", Value::text(properties.manufacturer.as_str())),
        ("product", Value::text(properties.product.as_str())),
        ("model", Value::text(properties.model.as_str())),
        ("device", Value::text(properties.device.as_str())),
        ("vb_state", Value::text(properties.vb_state.as_str())),
        ("bootloader_state", Value::text(properties.bootloader_state.as_str())),
        ("vbmeta_digest", Value::Bytes(boot_state.vbmeta_digest().to_vec())),
        ("os_version", Value::text(properties.os_version.as_str())),
        ("system_patch_level", Value::Integer(properties.system_patch_level)),
        ("vendor_patch_level", Value::Integer(properties.vendor_patch_level)),
    ];
    cbor::encode(&Value::Map(
        entries
            .into_iter()
            .map(|(key, value)| (Value::text(key), value))
            .collect(),
    ))
}
