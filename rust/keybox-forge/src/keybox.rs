//! Key box store.
//!
//! A key box is a private key plus the attestation certificate chain issued
//! for it. Key boxes are read from `keybox.xml` style documents into an
//! immutable [`Snapshot`]; the [`KeyboxStore`] swaps whole snapshots
//! atomically so readers on the forging path never take a lock and never see
//! a half-loaded set.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;
use p256::pkcs8::DecodePrivateKey as DecodeEcPkcs8;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey as DecodeRsaPkcs8;
use rsa::signature::SignatureEncoding;
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use x509_cert::der::asn1::{Any, ObjectIdentifier};
use x509_cert::der::{DecodePem, Encode, Tag};
use x509_cert::spki::AlgorithmIdentifierOwned;
use x509_cert::Certificate;

use crate::xml::{Document, XmlError, TEXT_KEY};

/// Root element of a key box document.
pub const DOCUMENT_ROOT: &str = "AndroidAttestation";

/// ecdsa-with-SHA256
pub const ECDSA_WITH_SHA256: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");
/// sha256WithRSAEncryption
pub const SHA256_WITH_RSA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11");
/// id-ecPublicKey
pub const EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
/// rsaEncryption
pub const RSA_ENCRYPTION: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");

#[derive(Debug, Error)]
pub enum KeyboxError {
    #[error(transparent)]
    Xml(#[from] XmlError),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid count `{value}` at {path}")]
    InvalidCount { path: String, value: String },
    #[error("missing algorithm attribute at {0}")]
    MissingAlgorithm(String),
    #[error("unsupported key algorithm `{0}`")]
    UnknownAlgorithm(String),
    #[error("missing text at {0}")]
    MissingText(String),
    #[error("invalid private key at {path}: {reason}")]
    PrivateKey { path: String, reason: String },
    #[error("invalid certificate at {path}: {source}")]
    Certificate {
        path: String,
        #[source]
        source: x509_cert::der::Error,
    },
    #[error("empty certificate chain at {0}")]
    EmptyChain(String),
    #[error("signing failed: {0}")]
    Signing(String),
}

/// Key algorithm of a key box, as declared by the `algorithm` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Ec,
    Rsa,
}

impl Algorithm {
    /// Parse the `algorithm` attribute of a `<Key>` element.
    pub fn from_attribute(value: &str) -> Result<Self, KeyboxError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ecdsa" | "ec" => Ok(Algorithm::Ec),
            "rsa" => Ok(Algorithm::Rsa),
            other => Err(KeyboxError::UnknownAlgorithm(other.to_owned())),
        }
    }

    /// Map a SubjectPublicKeyInfo algorithm OID to the key box algorithm.
    pub fn from_public_key_oid(oid: &ObjectIdentifier) -> Option<Self> {
        if *oid == EC_PUBLIC_KEY {
            Some(Algorithm::Ec)
        } else if *oid == RSA_ENCRYPTION {
            Some(Algorithm::Rsa)
        } else {
            None
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::Ec => write!(f, "ecdsa"),
            Algorithm::Rsa => write!(f, "rsa"),
        }
    }
}

/// Private key material of a key box.
pub enum KeyMaterial {
    Ec(p256::ecdsa::SigningKey),
    Rsa(Box<rsa::pkcs1v15::SigningKey<Sha256>>),
}

impl KeyMaterial {
    /// Decode a PEM private key. `EC PRIVATE KEY` and `RSA PRIVATE KEY`
    /// blocks carry their own type; `PRIVATE KEY` (PKCS#8) is decoded as
    /// the declared algorithm.
    pub fn from_pem(declared: Algorithm, pem: &str) -> Result<Self, String> {
        let pem = normalize_pem(pem);
        let label = pem_label(&pem).ok_or_else(|| "no PEM header".to_owned())?;
        let key = match (label, declared) {
            ("EC PRIVATE KEY", _) => p256::SecretKey::from_sec1_pem(&pem)
                .map(|secret| KeyMaterial::Ec(p256::ecdsa::SigningKey::from(secret)))
                .map_err(|e| e.to_string())?,
            ("RSA PRIVATE KEY", _) => rsa::RsaPrivateKey::from_pkcs1_pem(&pem)
                .map(KeyMaterial::from_rsa)
                .map_err(|e| e.to_string())?,
            ("PRIVATE KEY", Algorithm::Ec) => p256::SecretKey::from_pkcs8_pem(&pem)
                .map(|secret| KeyMaterial::Ec(p256::ecdsa::SigningKey::from(secret)))
                .map_err(|e| e.to_string())?,
            ("PRIVATE KEY", Algorithm::Rsa) => rsa::RsaPrivateKey::from_pkcs8_pem(&pem)
                .map(KeyMaterial::from_rsa)
                .map_err(|e| e.to_string())?,
            (other, _) => return Err(format!("unexpected PEM label `{other}`")),
        };
        if key.algorithm() != declared {
            return Err(format!(
                "declared {declared} but key is {}",
                key.algorithm()
            ));
        }
        Ok(key)
    }

    pub fn from_rsa(key: rsa::RsaPrivateKey) -> Self {
        KeyMaterial::Rsa(Box::new(rsa::pkcs1v15::SigningKey::new(key)))
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            KeyMaterial::Ec(_) => Algorithm::Ec,
            KeyMaterial::Rsa(_) => Algorithm::Rsa,
        }
    }

    /// AlgorithmIdentifier of the signatures produced by [`KeyMaterial::sign`].
    pub fn signature_algorithm(&self) -> Result<AlgorithmIdentifierOwned, KeyboxError> {
        Ok(match self {
            KeyMaterial::Ec(_) => AlgorithmIdentifierOwned {
                oid: ECDSA_WITH_SHA256,
                parameters: None,
            },
            KeyMaterial::Rsa(_) => AlgorithmIdentifierOwned {
                oid: SHA256_WITH_RSA,
                parameters: Some(
                    Any::new(Tag::Null, Vec::<u8>::new())
                        .map_err(|e| KeyboxError::Signing(e.to_string()))?,
                ),
            },
        })
    }

    /// Sign `message` with SHA-256; ECDSA signatures are DER encoded.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, KeyboxError> {
        match self {
            KeyMaterial::Ec(key) => {
                let signature: p256::ecdsa::Signature =
                    p256::ecdsa::signature::Signer::try_sign(key, message)
                        .map_err(|e| KeyboxError::Signing(e.to_string()))?;
                Ok(signature.to_der().as_bytes().to_vec())
            }
            KeyMaterial::Rsa(key) => {
                let signature: rsa::pkcs1v15::Signature =
                    rsa::signature::Signer::try_sign(key.as_ref(), message)
                        .map_err(|e| KeyboxError::Signing(e.to_string()))?;
                Ok(signature.to_vec())
            }
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial::{:?}(..)", self.algorithm())
    }
}

/// A private key with its certificate chain (leaf first, DER encoded).
#[derive(Debug)]
pub struct KeyBox {
    algorithm: Algorithm,
    key: KeyMaterial,
    certificate_chain: Vec<Vec<u8>>,
    source: String,
}

impl KeyBox {
    pub fn new(
        key: KeyMaterial,
        certificate_chain: Vec<Vec<u8>>,
        source: impl Into<String>,
    ) -> Self {
        KeyBox {
            algorithm: key.algorithm(),
            key,
            certificate_chain,
            source: source.into(),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn key(&self) -> &KeyMaterial {
        &self.key
    }

    pub fn certificate_chain(&self) -> &[Vec<u8>] {
        &self.certificate_chain
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// An immutable view of the loaded key boxes.
#[derive(Debug, Default)]
pub struct Snapshot {
    by_algorithm: HashMap<Algorithm, Vec<Arc<KeyBox>>>,
    by_source: HashMap<String, Vec<Arc<KeyBox>>>,
}

impl Snapshot {
    pub fn builder() -> SnapshotBuilder {
        SnapshotBuilder::default()
    }

    /// True if at least one algorithm has a key box.
    pub fn can_hack(&self) -> bool {
        self.by_algorithm.values().any(|boxes| !boxes.is_empty())
    }

    /// Total number of key boxes.
    pub fn len(&self) -> usize {
        self.by_algorithm.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First key box registered for `algorithm`.
    pub fn select(&self, algorithm: Algorithm) -> Option<&Arc<KeyBox>> {
        self.by_algorithm.get(&algorithm)?.first()
    }

    pub fn by_algorithm(&self, algorithm: Algorithm) -> &[Arc<KeyBox>] {
        self.by_algorithm
            .get(&algorithm)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn by_source(&self, source: &str) -> &[Arc<KeyBox>] {
        self.by_source
            .get(source)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Accumulates key boxes for a snapshot that is not yet visible to readers.
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    snapshot: Snapshot,
}

impl SnapshotBuilder {
    pub fn insert(&mut self, key_box: KeyBox) -> &mut Self {
        let key_box = Arc::new(key_box);
        self.snapshot
            .by_source
            .entry(key_box.source.clone())
            .or_default()
            .push(Arc::clone(&key_box));
        self.snapshot
            .by_algorithm
            .entry(key_box.algorithm)
            .or_default()
            .push(key_box);
        self
    }

    /// Parse a key box document and add everything it declares.
    pub fn load_document(&mut self, source: &str, document: &str) -> Result<usize, KeyboxError> {
        let key_boxes = parse_document(source, document)?;
        let count = key_boxes.len();
        for key_box in key_boxes {
            self.insert(key_box);
        }
        Ok(count)
    }

    pub fn build(self) -> Snapshot {
        self.snapshot
    }
}

/// Holds the current [`Snapshot`] and replaces it atomically on reload.
pub struct KeyboxStore {
    current: ArcSwap<Snapshot>,
}

impl Default for KeyboxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyboxStore {
    pub fn new() -> Self {
        KeyboxStore {
            current: ArcSwap::from_pointee(Snapshot::default()),
        }
    }

    /// The snapshot as of now. Hold it for one operation only.
    pub fn current(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Make `snapshot` the current one.
    pub fn publish(&self, snapshot: Snapshot) {
        self.current.store(Arc::new(snapshot));
    }

    pub fn clear(&self) {
        self.publish(Snapshot::default());
    }

    /// Replace the current snapshot with the key boxes of one document.
    ///
    /// On error the previous snapshot stays in place.
    pub fn load(&self, source: &str, document: &str) -> Result<usize, KeyboxError> {
        self.reload([(source, document)])
    }

    /// Replace the current snapshot with the key boxes of several documents.
    pub fn reload<'a, I>(&self, sources: I) -> Result<usize, KeyboxError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut builder = Snapshot::builder();
        for (source, document) in sources {
            match builder.load_document(source, document) {
                Ok(count) => debug!(source, count, "parsed key box document"),
                Err(e) => {
                    error!(source, error = %e, "failed to load key boxes");
                    return Err(e);
                }
            }
        }
        let snapshot = builder.build();
        let total = snapshot.len();
        self.publish(snapshot);
        info!(total, "key boxes updated");
        Ok(total)
    }

    /// Read and load a key box file; the file name is the source id.
    pub fn load_file(&self, path: &Path) -> Result<usize, KeyboxError> {
        let document = std::fs::read_to_string(path).map_err(|source| KeyboxError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let source = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        self.load(&source, &document)
    }

    pub fn can_hack(&self) -> bool {
        self.current.load().can_hack()
    }

    pub fn count_key_boxes(&self) -> usize {
        self.current.load().len()
    }

    pub fn select(&self, algorithm: Algorithm) -> Option<Arc<KeyBox>> {
        self.current.load().select(algorithm).cloned()
    }
}

/// The process-wide store used by the native bridge.
pub fn global() -> &'static KeyboxStore {
    static STORE: OnceLock<KeyboxStore> = OnceLock::new();
    STORE.get_or_init(KeyboxStore::new)
}

/// Read every key a document declares.
///
/// `NumberOfKeyboxes` counts keys, not `<Keybox>` elements: keys are taken
/// container by container, in document order, until that many are read.
pub fn parse_document(source: &str, document: &str) -> Result<Vec<KeyBox>, KeyboxError> {
    let doc = Document::parse(document)?;
    doc.get(DOCUMENT_ROOT)?;

    let declared = match doc.find(&format!("{DOCUMENT_ROOT}.NumberOfKeyboxes")) {
        Some(_) => Some(read_count(&doc, &format!("{DOCUMENT_ROOT}.NumberOfKeyboxes"))?),
        None => None,
    };

    let mut key_boxes = Vec::new();
    'containers: for container in 0..doc.child_count(DOCUMENT_ROOT, "Keybox") {
        let container_path = format!("{DOCUMENT_ROOT}.Keybox[{container}]");
        for key in 0..doc.child_count(&container_path, "Key") {
            if declared.is_some_and(|limit| key_boxes.len() >= limit) {
                break 'containers;
            }
            key_boxes.push(read_key(&doc, &format!("{container_path}.Key[{key}]"), source)?);
        }
    }

    if let Some(limit) = declared {
        if key_boxes.len() < limit {
            warn!(
                source,
                declared = limit,
                found = key_boxes.len(),
                "document declares more keys than it contains"
            );
        }
    }
    Ok(key_boxes)
}

fn read_key(doc: &Document, path: &str, source: &str) -> Result<KeyBox, KeyboxError> {
    let declared = doc
        .get(path)?
        .attribute("algorithm")
        .ok_or_else(|| KeyboxError::MissingAlgorithm(path.to_owned()))?;
    let algorithm = Algorithm::from_attribute(declared)?;

    let key_path = format!("{path}.PrivateKey");
    let key = KeyMaterial::from_pem(algorithm, &read_text(doc, &key_path)?)
        .map_err(|reason| KeyboxError::PrivateKey {
            path: key_path.clone(),
            reason,
        })?;

    let chain_path = format!("{path}.CertificateChain");
    let count_path = format!("{chain_path}.NumberOfCertificates");
    let count = read_count(doc, &count_path)?;
    if count > doc.child_count(&chain_path, "Certificate") {
        return Err(KeyboxError::InvalidCount {
            path: count_path,
            value: count.to_string(),
        });
    }
    let mut chain = Vec::with_capacity(count);
    for index in 0..count {
        let cert_path = format!("{chain_path}.Certificate[{index}]");
        let pem = normalize_pem(&read_text(doc, &cert_path)?);
        let der = Certificate::from_pem(pem.as_bytes())
            .and_then(|cert| cert.to_der())
            .map_err(|source| KeyboxError::Certificate {
                path: cert_path.clone(),
                source,
            })?;
        chain.push(der);
    }
    if chain.is_empty() {
        return Err(KeyboxError::EmptyChain(chain_path));
    }

    Ok(KeyBox::new(key, chain, source))
}

fn read_text(doc: &Document, path: &str) -> Result<String, KeyboxError> {
    doc.attributes_and_text(path)?
        .remove(TEXT_KEY)
        .ok_or_else(|| KeyboxError::MissingText(path.to_owned()))
}

fn read_count(doc: &Document, path: &str) -> Result<usize, KeyboxError> {
    let text = read_text(doc, path)?;
    text.trim()
        .parse()
        .map_err(|_| KeyboxError::InvalidCount {
            path: path.to_owned(),
            value: text,
        })
}

/// Trim every line so PEM blocks survive document indentation.
fn normalize_pem(pem: &str) -> String {
    let mut out = String::with_capacity(pem.len() + 1);
    for line in pem.lines().map(str::trim).filter(|line| !line.is_empty()) {
        out.push_str(line);
        out.push('\n');
    }
    out
}

fn pem_label(pem: &str) -> Option<&str> {
    const BEGIN: &str = "-----BEGIN ";
    let start = pem.find(BEGIN)? + BEGIN.len();
    let len = pem[start..].find("-----")?;
    Some(&pem[start..start + len])
}
