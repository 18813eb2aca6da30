//! Key box loading and attestation chain forging for CleveresTricky.
//!
//! Key boxes (a private key plus the certificate chain issued for it) are
//! read from `keybox.xml` documents into an atomically published snapshot.
//! Attestation chains produced by the device keystore are re-signed with a
//! key box key after their identity fields are patched. The crate also
//! carries the canonical CBOR encoder and COSE helpers used for Remote Key
//! Provisioning responses, and a C ABI for the native interceptor.

pub mod attestation;
pub mod cbor;
pub mod config;
pub mod cose;
pub mod device_info;
pub mod ffi;
pub mod forge;
pub mod keybox;
pub mod xml;

#[cfg(test)]
mod test_support;
