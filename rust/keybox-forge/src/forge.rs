//! Attestation chain forging.
//!
//! The leaf certificate a device returns carries the attestation extension.
//! Forging patches the identity fields of its hardware enforced list, re-signs
//! the leaf with a key box key and appends the key box chain, so the result
//! chains up to the key box's root instead of the device's.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error};
use x509_cert::der::asn1::{BitString, OctetString};
use x509_cert::der::{Decode, Encode};
use x509_cert::Certificate;

use crate::attestation::{
    AttestationError, AuthorizationList, KeyDescription, RawValue, KEY_DESCRIPTION_OID,
};
use crate::keybox::{Algorithm, KeyBox, KeyboxError, KeyboxStore};

#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("certificate chain is empty")]
    EmptyChain,
    #[error("leaf certificate: {0}")]
    Certificate(#[from] x509_cert::der::Error),
    #[error("leaf certificate has no attestation extension")]
    MissingExtension,
    #[error("attestation extension: {0}")]
    Attestation(#[from] AttestationError),
    #[error("unsupported leaf public key {0}")]
    UnsupportedKey(String),
    #[error(transparent)]
    Signing(#[from] KeyboxError),
}

/// Value written into an authorization list entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthValue {
    /// OCTET STRING
    Bytes(Vec<u8>),
    /// INTEGER
    Integer(i64),
}

impl AuthValue {
    fn to_raw(&self) -> RawValue {
        match self {
            AuthValue::Bytes(bytes) => RawValue::octet_string(bytes),
            AuthValue::Integer(value) => RawValue::integer(*value),
        }
    }
}

/// Hardware enforced entries to overwrite or insert, keyed by tag number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForgeConfig {
    overrides: BTreeMap<u32, AuthValue>,
}

impl ForgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_override(mut self, tag: u32, value: AuthValue) -> Self {
        self.set(tag, value);
        self
    }

    pub fn set(&mut self, tag: u32, value: AuthValue) {
        self.overrides.insert(tag, value);
    }

    pub fn get(&self, tag: u32) -> Option<&AuthValue> {
        self.overrides.get(&tag)
    }

    pub fn len(&self) -> usize {
        self.overrides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }

    /// Write every override into `list`; other entries are left as they are.
    pub fn apply(&self, list: &mut AuthorizationList) {
        for (&tag, value) in &self.overrides {
            list.set(tag, value.to_raw());
        }
    }
}

/// Rewrites attestation chains with key boxes from a [`KeyboxStore`].
pub struct CertificateChainForger<'s> {
    store: &'s KeyboxStore,
    config: ForgeConfig,
}

impl<'s> CertificateChainForger<'s> {
    pub fn new(store: &'s KeyboxStore, config: ForgeConfig) -> Self {
        CertificateChainForger { store, config }
    }

    pub fn config(&self) -> &ForgeConfig {
        &self.config
    }

    pub fn select_key_box(&self, algorithm: Algorithm) -> Option<Arc<KeyBox>> {
        self.store.select(algorithm)
    }

    /// Forge `original_chain` with a key box matching its leaf key, or
    /// return it unchanged when there is none or forging fails.
    pub fn hack_chain(&self, original_chain: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let algorithm = match leaf_algorithm(original_chain) {
            Ok(algorithm) => algorithm,
            Err(e) => {
                error!(error = %e, "cannot determine leaf key algorithm");
                return original_chain.to_vec();
            }
        };
        match self.select_key_box(algorithm) {
            Some(key_box) => self.forge(original_chain, &key_box),
            None => {
                debug!(%algorithm, "no key box available");
                original_chain.to_vec()
            }
        }
    }

    /// Like [`Self::try_forge`], but a failure yields the original chain.
    pub fn forge(&self, original_chain: &[Vec<u8>], key_box: &KeyBox) -> Vec<Vec<u8>> {
        match self.try_forge(original_chain, key_box) {
            Ok(chain) => chain,
            Err(e) => {
                error!(
                    error = %e,
                    source = key_box.source(),
                    "forging failed, keeping original chain"
                );
                original_chain.to_vec()
            }
        }
    }

    /// Patch and re-sign the leaf of `original_chain` and put it in front of
    /// the key box chain.
    pub fn try_forge(
        &self,
        original_chain: &[Vec<u8>],
        key_box: &KeyBox,
    ) -> Result<Vec<Vec<u8>>, ForgeError> {
        let leaf_der = original_chain.first().ok_or(ForgeError::EmptyChain)?;
        let mut leaf = Certificate::from_der(leaf_der)?;

        let extension = leaf
            .tbs_certificate
            .extensions
            .as_mut()
            .and_then(|extensions| {
                extensions
                    .iter_mut()
                    .find(|ext| ext.extn_id == KEY_DESCRIPTION_OID)
            })
            .ok_or(ForgeError::MissingExtension)?;
        let mut description = KeyDescription::from_der(extension.extn_value.as_bytes())?;
        self.config.apply(&mut description.hardware_enforced);
        extension.extn_value = OctetString::new(description.to_der())?;

        let algorithm = key_box.key().signature_algorithm()?;
        leaf.tbs_certificate.signature = algorithm.clone();
        let tbs = leaf.tbs_certificate.to_der()?;
        let signature = key_box.key().sign(&tbs)?;
        leaf.signature_algorithm = algorithm;
        leaf.signature = BitString::from_bytes(&signature)?;

        let mut chain = Vec::with_capacity(key_box.certificate_chain().len() + 1);
        chain.push(leaf.to_der()?);
        chain.extend(key_box.certificate_chain().iter().cloned());
        debug!(
            source = key_box.source(),
            length = chain.len(),
            "forged attestation chain"
        );
        Ok(chain)
    }
}

/// Key box algorithm matching the leaf's subject public key.
pub fn leaf_algorithm(chain: &[Vec<u8>]) -> Result<Algorithm, ForgeError> {
    let leaf = Certificate::from_der(chain.first().ok_or(ForgeError::EmptyChain)?)?;
    let oid = leaf.tbs_certificate.subject_public_key_info.algorithm.oid;
    Algorithm::from_public_key_oid(&oid).ok_or_else(|| ForgeError::UnsupportedKey(oid.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::{
        TAG_ATTESTATION_ID_BRAND, TAG_ATTESTATION_ID_IMEI, TAG_ATTESTATION_ID_MODEL,
        TAG_ATTESTATION_ID_SECOND_IMEI, TAG_MODULE_HASH, TAG_OS_PATCHLEVEL, TAG_VENDOR_PATCHLEVEL,
    };
    use crate::config::{BuildVars, IdTagTable};
    use crate::keybox::{KeyMaterial, Snapshot, SHA256_WITH_RSA};
    use crate::test_support::{
        attested_chain, init_tracing, key_description_of, keybox_document, sample_key_description,
        KeyEntry, EC_KEY, TEST_CERT,
    };
    use p256::ecdsa::signature::Verifier;
    use x509_cert::der::DecodePem;

    fn loaded_store() -> KeyboxStore {
        let store = KeyboxStore::new();
        store
            .load("keybox.xml", &keybox_document(1, &[&[KeyEntry::ec()]]))
            .unwrap();
        store
    }

    fn brand_config() -> ForgeConfig {
        ForgeConfig::new().with_override(
            TAG_ATTESTATION_ID_BRAND,
            AuthValue::Bytes(b"google".to_vec()),
        )
    }

    fn test_cert_der() -> Vec<u8> {
        Certificate::from_pem(TEST_CERT.as_bytes())
            .unwrap()
            .to_der()
            .unwrap()
    }

    #[test]
    fn test_override_keeps_ascending_order() {
        let store = loaded_store();
        let forger = CertificateChainForger::new(&store, brand_config());
        let chain = forger.hack_chain(&attested_chain(&sample_key_description()));

        let description = key_description_of(&chain[0]).unwrap();
        assert_eq!(
            description.hardware_enforced.tags().collect::<Vec<_>>(),
            vec![TAG_ATTESTATION_ID_BRAND, TAG_VENDOR_PATCHLEVEL]
        );
        assert_eq!(
            description
                .hardware_enforced
                .get(TAG_ATTESTATION_ID_BRAND)
                .and_then(RawValue::as_octet_string),
            Some(&b"google"[..])
        );
        assert_eq!(
            description
                .hardware_enforced
                .get(TAG_VENDOR_PATCHLEVEL)
                .and_then(RawValue::as_integer),
            Some(20240101)
        );
    }

    #[test]
    fn test_inserted_tags_are_sorted_around_existing_ones() {
        let store = loaded_store();
        let config = brand_config()
            .with_override(TAG_ATTESTATION_ID_SECOND_IMEI, AuthValue::Bytes(b"2".to_vec()))
            .with_override(TAG_OS_PATCHLEVEL, AuthValue::Integer(202401))
            .with_override(TAG_ATTESTATION_ID_IMEI, AuthValue::Bytes(b"1".to_vec()));
        let forger = CertificateChainForger::new(&store, config.clone());
        let chain = forger.hack_chain(&attested_chain(&sample_key_description()));

        let leaf = Certificate::from_der(&chain[0]).unwrap();
        let extension = leaf
            .tbs_certificate
            .extensions
            .unwrap()
            .into_iter()
            .find(|ext| ext.extn_id == KEY_DESCRIPTION_OID)
            .unwrap();

        let mut expected = sample_key_description();
        config.apply(&mut expected.hardware_enforced);
        assert_eq!(
            expected.hardware_enforced.tags().collect::<Vec<_>>(),
            vec![706, 710, 714, 718, 723]
        );
        assert_eq!(extension.extn_value.as_bytes(), expected.to_der().as_slice());
    }

    #[test]
    fn test_forged_leaf_verifies_with_key_box_key() {
        let store = loaded_store();
        let forger = CertificateChainForger::new(&store, brand_config());
        let original = attested_chain(&sample_key_description());
        let chain = forger.hack_chain(&original);

        let leaf = Certificate::from_der(&chain[0]).unwrap();
        let tbs = leaf.tbs_certificate.to_der().unwrap();
        let signature = p256::ecdsa::Signature::from_der(leaf.signature.raw_bytes()).unwrap();
        let KeyMaterial::Ec(key) = KeyMaterial::from_pem(Algorithm::Ec, EC_KEY).unwrap() else {
            panic!("expected EC key");
        };
        assert!(key.verifying_key().verify(&tbs, &signature).is_ok());
        assert_eq!(leaf.signature_algorithm, leaf.tbs_certificate.signature);
    }

    #[test]
    fn test_identity_fields_are_preserved() {
        let store = loaded_store();
        let forger = CertificateChainForger::new(&store, brand_config());
        let original = attested_chain(&sample_key_description());
        let chain = forger.hack_chain(&original);

        let before = Certificate::from_der(&original[0]).unwrap().tbs_certificate;
        let after = Certificate::from_der(&chain[0]).unwrap().tbs_certificate;
        assert_eq!(after.subject, before.subject);
        assert_eq!(after.issuer, before.issuer);
        assert_eq!(after.validity, before.validity);
        assert_eq!(after.serial_number, before.serial_number);
        assert_eq!(after.subject_public_key_info, before.subject_public_key_info);
    }

    #[test]
    fn test_chain_is_leaf_then_key_box_chain() {
        let store = loaded_store();
        let forger = CertificateChainForger::new(&store, brand_config());
        let original = attested_chain(&sample_key_description());
        let chain = forger.hack_chain(&original);

        assert_eq!(chain.len(), 2);
        assert_ne!(chain[0], original[0]);
        assert_eq!(chain[1], test_cert_der());
    }

    #[test]
    fn test_empty_config_only_resigns() {
        let store = loaded_store();
        let forger = CertificateChainForger::new(&store, ForgeConfig::new());
        let chain = forger.hack_chain(&attested_chain(&sample_key_description()));
        assert_eq!(key_description_of(&chain[0]), Some(sample_key_description()));
    }

    #[test]
    fn test_failure_returns_original_chain() {
        let store = loaded_store();
        let forger = CertificateChainForger::new(&store, brand_config());
        let key_box = store.select(Algorithm::Ec).unwrap();

        // leaf without an attestation extension
        let plain = vec![test_cert_der()];
        assert!(matches!(
            forger.try_forge(&plain, &key_box),
            Err(ForgeError::MissingExtension)
        ));
        assert_eq!(forger.forge(&plain, &key_box), plain);
        assert_eq!(forger.hack_chain(&plain), plain);

        let garbage = vec![vec![0x30, 0x03, 0x02, 0x01, 0x01]];
        assert!(matches!(
            forger.try_forge(&garbage, &key_box),
            Err(ForgeError::Certificate(_))
        ));
        assert_eq!(forger.hack_chain(&garbage), garbage);

        assert!(matches!(
            forger.try_forge(&[], &key_box),
            Err(ForgeError::EmptyChain)
        ));
        assert!(forger.hack_chain(&[]).is_empty());
    }

    #[test]
    fn test_no_key_box_returns_original_chain() {
        let store = KeyboxStore::new();
        let forger = CertificateChainForger::new(&store, brand_config());
        let original = attested_chain(&sample_key_description());
        assert!(forger.select_key_box(Algorithm::Ec).is_none());
        assert_eq!(forger.hack_chain(&original), original);
    }

    #[test]
    fn test_rsa_key_box_signs_with_pkcs1() {
        let rsa_key = rsa::RsaPrivateKey::new(&mut rand_core::OsRng, 1024).unwrap();
        let verifying_key =
            rsa::pkcs1v15::VerifyingKey::<sha2::Sha256>::new(rsa_key.to_public_key());
        let store = KeyboxStore::new();
        let mut builder = Snapshot::builder();
        builder.insert(KeyBox::new(
            KeyMaterial::from_rsa(rsa_key),
            vec![test_cert_der()],
            "rsa",
        ));
        store.publish(builder.build());

        let forger = CertificateChainForger::new(&store, brand_config());
        let key_box = store.select(Algorithm::Rsa).unwrap();
        let chain = forger
            .try_forge(&attested_chain(&sample_key_description()), &key_box)
            .unwrap();

        let leaf = Certificate::from_der(&chain[0]).unwrap();
        assert_eq!(leaf.signature_algorithm.oid, SHA256_WITH_RSA);
        let tbs = leaf.tbs_certificate.to_der().unwrap();
        let signature = rsa::pkcs1v15::Signature::try_from(leaf.signature.raw_bytes()).unwrap();
        assert!(verifying_key.verify(&tbs, &signature).is_ok());
    }

    #[test]
    fn test_file_load_with_build_vars_then_forge() {
        init_tracing();
        let path = std::env::temp_dir().join(format!("keybox-forge-{}.xml", std::process::id()));
        std::fs::write(
            &path,
            keybox_document(3, &[&[KeyEntry::ec(), KeyEntry::ec()], &[KeyEntry::ec()]]),
        )
        .unwrap();
        let store = KeyboxStore::new();
        let loaded = store.load_file(&path);
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded.unwrap(), 3);

        let vars = BuildVars::parse(
            "ATTESTATION_ID_BRAND=google\nATTESTATION_ID_MODEL=Pixel 9 Pro\nMODULE_HASH=0102\n",
        );
        let forger = CertificateChainForger::new(&store, vars.forge_config(&IdTagTable::default()));
        let chain = forger.hack_chain(&attested_chain(&sample_key_description()));
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1], test_cert_der());

        let hardware = key_description_of(&chain[0]).unwrap().hardware_enforced;
        assert_eq!(
            hardware.tags().collect::<Vec<_>>(),
            vec![
                TAG_ATTESTATION_ID_BRAND,
                TAG_ATTESTATION_ID_MODEL,
                TAG_VENDOR_PATCHLEVEL,
                TAG_MODULE_HASH
            ]
        );
        assert_eq!(
            hardware
                .get(TAG_ATTESTATION_ID_MODEL)
                .and_then(RawValue::as_octet_string),
            Some(&b"Pixel 9 Pro"[..])
        );
        assert_eq!(
            hardware.get(TAG_MODULE_HASH).and_then(RawValue::as_octet_string),
            Some(&[0x01, 0x02][..])
        );
    }

    #[test]
    fn test_leaf_algorithm() {
        let original = attested_chain(&sample_key_description());
        assert_eq!(leaf_algorithm(&original).unwrap(), Algorithm::Ec);
        assert!(matches!(leaf_algorithm(&[]), Err(ForgeError::EmptyChain)));
    }
}
