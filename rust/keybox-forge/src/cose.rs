//! COSE helpers for Remote Key Provisioning responses (RFC 9052).
//!
//! Only what the provisioning path emits: EC2 P-256 `COSE_Key`,
//! `COSE_Mac0` with HMAC-256/256, and the certificate request array.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::cbor::{self, Value};

type HmacSha256 = Hmac<Sha256>;

// Header and key labels
const HEADER_ALG: i64 = 1;
const KEY_KTY: i64 = 1;
const KEY_EC2_CRV: i64 = -1;
const KEY_EC2_X: i64 = -2;
const KEY_EC2_Y: i64 = -3;

const ALG_HMAC_256_256: i64 = 5;
const KTY_EC2: i64 = 2;
const CRV_P256: i64 = 1;

/// Version field of the certificate request array.
pub const CERTIFICATE_REQUEST_VERSION: i64 = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoseError {
    #[error("invalid HMAC key length")]
    InvalidKeyLength,
    #[error("invalid EC public key coordinates")]
    InvalidPublicKey,
}

/// EC2 P-256 `COSE_Key`: `{1: 2, -1: 1, -2: x, -3: y}`.
pub fn encode_cose_key(x: &[u8], y: &[u8]) -> Result<Vec<u8>, CoseError> {
    if x.is_empty() || y.is_empty() {
        return Err(CoseError::InvalidPublicKey);
    }
    let key = Value::Map(vec![
        (KEY_KTY.into(), KTY_EC2.into()),
        (KEY_EC2_CRV.into(), CRV_P256.into()),
        (KEY_EC2_X.into(), Value::bytes(x)),
        (KEY_EC2_Y.into(), Value::bytes(y)),
    ]);
    Ok(cbor::encode(&key))
}

/// `COSE_Mac0 = [protected, {}, COSE_Key, tag]` with an HMAC-SHA256 tag
/// over the `MAC0` structure.
pub fn generate_maced_public_key(
    x: &[u8],
    y: &[u8],
    hmac_key: &[u8],
) -> Result<Vec<u8>, CoseError> {
    let protected = cbor::encode(&Value::Map(vec![(
        HEADER_ALG.into(),
        ALG_HMAC_256_256.into(),
    )]));
    let payload = encode_cose_key(x, y)?;
    let tag = mac0_tag(hmac_key, &protected, &payload)?;

    Ok(cbor::encode(&Value::Array(vec![
        Value::Bytes(protected),
        Value::Map(Vec::new()),
        Value::Bytes(payload),
        Value::Bytes(tag),
    ])))
}

/// `[3, [bstr COSE_Mac0...], bstr challenge, bstr device_info]`
pub fn create_certificate_request_response(
    maced_keys: &[Vec<u8>],
    challenge: &[u8],
    device_info: &[u8],
) -> Vec<u8> {
    cbor::encode(&Value::Array(vec![
        CERTIFICATE_REQUEST_VERSION.into(),
        Value::Array(maced_keys.iter().map(|key| Value::bytes(key.as_slice())).collect()),
        Value::bytes(challenge),
        Value::bytes(device_info),
    ]))
}

/// HMAC over `["MAC0", protected, h'', payload]`.
fn mac0_tag(key: &[u8], protected: &[u8], payload: &[u8]) -> Result<Vec<u8>, CoseError> {
    let structure = cbor::encode(&Value::Array(vec![
        Value::text("MAC0"),
        Value::bytes(protected),
        Value::Bytes(Vec::new()), // external_aad
        Value::bytes(payload),
    ]));
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| CoseError::InvalidKeyLength)?;
    mac.update(&structure);
    Ok(mac.finalize().into_bytes().to_vec())
}
