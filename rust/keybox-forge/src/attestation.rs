//! Android key attestation extension (`KeyDescription`) codec.
//!
//! ```text
//! KeyDescription ::= SEQUENCE {
//!     attestationVersion         INTEGER,
//!     attestationSecurityLevel   SecurityLevel,
//!     keyMintVersion             INTEGER,
//!     keyMintSecurityLevel       SecurityLevel,
//!     attestationChallenge       OCTET_STRING,
//!     uniqueId                   OCTET_STRING,
//!     softwareEnforced           AuthorizationList,
//!     hardwareEnforced           AuthorizationList,
//! }
//! ```
//!
//! Authorization list entries are `[tag] EXPLICIT` with tag numbers in the
//! 1..=1000s range, which needs the DER high-tag-number form. The entries are
//! kept in a `BTreeMap` so encoding always emits them in ascending tag order.

use std::collections::BTreeMap;

use thiserror::Error;
use x509_cert::der::asn1::ObjectIdentifier;

/// OID of the key attestation certificate extension.
pub const KEY_DESCRIPTION_OID: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.11129.2.1.17");

pub const TAG_ROOT_OF_TRUST: u32 = 704;
pub const TAG_OS_VERSION: u32 = 705;
pub const TAG_OS_PATCHLEVEL: u32 = 706;
pub const TAG_ATTESTATION_ID_BRAND: u32 = 710;
pub const TAG_ATTESTATION_ID_DEVICE: u32 = 711;
pub const TAG_ATTESTATION_ID_PRODUCT: u32 = 712;
pub const TAG_ATTESTATION_ID_SERIAL: u32 = 713;
pub const TAG_ATTESTATION_ID_IMEI: u32 = 714;
pub const TAG_ATTESTATION_ID_MEID: u32 = 715;
pub const TAG_ATTESTATION_ID_MANUFACTURER: u32 = 716;
pub const TAG_ATTESTATION_ID_MODEL: u32 = 717;
pub const TAG_VENDOR_PATCHLEVEL: u32 = 718;
pub const TAG_BOOT_PATCHLEVEL: u32 = 719;
pub const TAG_ATTESTATION_ID_SECOND_IMEI: u32 = 723;
pub const TAG_MODULE_HASH: u32 = 724;

// Universal tags
const INTEGER: u8 = 0x02;
const OCTET_STRING: u8 = 0x04;
const ENUMERATED: u8 = 0x0A;
const SEQUENCE: u8 = 0x30;

const CLASS_CONTEXT: u8 = 0x80;
const CONSTRUCTED: u8 = 0x20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AttestationError {
    #[error("truncated DER input")]
    Truncated,
    #[error("invalid DER length")]
    InvalidLength,
    #[error("tag number too large")]
    TagOverflow,
    #[error("expected {expected}, found tag 0x{found:02x}")]
    UnexpectedTag { expected: &'static str, found: u8 },
    #[error("integer out of range")]
    IntegerOverflow,
    #[error("authorization list entry [{0}] is not an explicit tag")]
    NotExplicit(u32),
    #[error("trailing data after {0}")]
    TrailingData(&'static str),
}

/// A decoded authorization list entry value: the complete inner TLV of
/// `[tag] EXPLICIT <value>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawValue(Vec<u8>);

impl RawValue {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn octet_string(bytes: &[u8]) -> Self {
        let mut out = Vec::with_capacity(bytes.len() + 4);
        write_tlv(&mut out, OCTET_STRING, bytes);
        RawValue(out)
    }

    pub fn integer(value: i64) -> Self {
        let mut out = Vec::with_capacity(10);
        write_tlv(&mut out, INTEGER, &integer_content(value));
        RawValue(out)
    }

    /// Content octets if this value is an OCTET STRING.
    pub fn as_octet_string(&self) -> Option<&[u8]> {
        let (tlv, rest) = Tlv::read(&self.0).ok()?;
        (tlv.identifier == OCTET_STRING && rest.is_empty()).then_some(tlv.content)
    }

    /// Value if this is an INTEGER that fits in an `i64`.
    pub fn as_integer(&self) -> Option<i64> {
        let (tlv, rest) = Tlv::read(&self.0).ok()?;
        if tlv.identifier != INTEGER || !rest.is_empty() {
            return None;
        }
        parse_integer(tlv.content).ok()
    }
}

/// `AuthorizationList`: explicitly tagged entries keyed by tag number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizationList {
    entries: BTreeMap<u32, RawValue>,
}

impl AuthorizationList {
    pub fn get(&self, tag: u32) -> Option<&RawValue> {
        self.entries.get(&tag)
    }

    /// Insert or overwrite the entry for `tag`.
    pub fn set(&mut self, tag: u32, value: RawValue) -> Option<RawValue> {
        self.entries.insert(tag, value)
    }

    pub fn remove(&mut self, tag: u32) -> Option<RawValue> {
        self.entries.remove(&tag)
    }

    /// Tag numbers in encoding order.
    pub fn tags(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn decode(content: &[u8]) -> Result<Self, AttestationError> {
        let mut entries = BTreeMap::new();
        let mut input = content;
        while !input.is_empty() {
            let (tlv, rest) = Tlv::read(input)?;
            if tlv.identifier & 0xC0 != CLASS_CONTEXT || tlv.identifier & CONSTRUCTED == 0 {
                return Err(AttestationError::NotExplicit(tlv.number));
            }
            let (_, inner_rest) = Tlv::read(tlv.content)?;
            if !inner_rest.is_empty() {
                return Err(AttestationError::NotExplicit(tlv.number));
            }
            entries.insert(tlv.number, RawValue(tlv.content.to_vec()));
            input = rest;
        }
        Ok(AuthorizationList { entries })
    }

    fn encode(&self, out: &mut Vec<u8>) {
        let mut content = Vec::new();
        for (&tag, value) in &self.entries {
            write_header(&mut content, CLASS_CONTEXT | CONSTRUCTED, tag, value.0.len());
            content.extend_from_slice(&value.0);
        }
        write_tlv(out, SEQUENCE, &content);
    }
}

/// Decoded attestation extension payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDescription {
    pub attestation_version: i64,
    pub attestation_security_level: i64,
    pub keymint_version: i64,
    pub keymint_security_level: i64,
    pub challenge: Vec<u8>,
    pub unique_id: Vec<u8>,
    pub software_enforced: AuthorizationList,
    /// The TEE/StrongBox enforced list.
    pub hardware_enforced: AuthorizationList,
}

impl KeyDescription {
    pub fn from_der(der: &[u8]) -> Result<Self, AttestationError> {
        let (outer, rest) = Tlv::read(der)?;
        expect_tag(&outer, SEQUENCE, "KeyDescription SEQUENCE")?;
        if !rest.is_empty() {
            return Err(AttestationError::TrailingData("KeyDescription"));
        }

        let mut fields = outer.content;
        let attestation_version =
            parse_integer(take(&mut fields, INTEGER, "attestationVersion")?)?;
        let attestation_security_level =
            parse_integer(take(&mut fields, ENUMERATED, "attestationSecurityLevel")?)?;
        let keymint_version = parse_integer(take(&mut fields, INTEGER, "keyMintVersion")?)?;
        let keymint_security_level =
            parse_integer(take(&mut fields, ENUMERATED, "keyMintSecurityLevel")?)?;
        let challenge = take(&mut fields, OCTET_STRING, "attestationChallenge")?.to_vec();
        let unique_id = take(&mut fields, OCTET_STRING, "uniqueId")?.to_vec();
        let software_enforced =
            AuthorizationList::decode(take(&mut fields, SEQUENCE, "softwareEnforced")?)?;
        let hardware_enforced =
            AuthorizationList::decode(take(&mut fields, SEQUENCE, "hardwareEnforced")?)?;
        if !fields.is_empty() {
            return Err(AttestationError::TrailingData("hardwareEnforced"));
        }

        Ok(KeyDescription {
            attestation_version,
            attestation_security_level,
            keymint_version,
            keymint_security_level,
            challenge,
            unique_id,
            software_enforced,
            hardware_enforced,
        })
    }

    pub fn to_der(&self) -> Vec<u8> {
        let mut content = Vec::with_capacity(256);
        write_tlv(&mut content, INTEGER, &integer_content(self.attestation_version));
        write_tlv(&mut content, ENUMERATED, &integer_content(self.attestation_security_level));
        write_tlv(&mut content, INTEGER, &integer_content(self.keymint_version));
        write_tlv(&mut content, ENUMERATED, &integer_content(self.keymint_security_level));
        write_tlv(&mut content, OCTET_STRING, &self.challenge);
        write_tlv(&mut content, OCTET_STRING, &self.unique_id);
        self.software_enforced.encode(&mut content);
        self.hardware_enforced.encode(&mut content);

        let mut out = Vec::with_capacity(content.len() + 4);
        write_tlv(&mut out, SEQUENCE, &content);
        out
    }
}

/// One DER TLV. `identifier` is the first identifier octet; `number` the
/// full tag number.
struct Tlv<'a> {
    identifier: u8,
    number: u32,
    content: &'a [u8],
}

impl<'a> Tlv<'a> {
    fn read(input: &'a [u8]) -> Result<(Self, &'a [u8]), AttestationError> {
        let (&identifier, mut rest) = input.split_first().ok_or(AttestationError::Truncated)?;

        let number = if identifier & 0x1F == 0x1F {
            let mut number: u32 = 0;
            loop {
                let (&byte, tail) = rest.split_first().ok_or(AttestationError::Truncated)?;
                rest = tail;
                if number > (u32::MAX >> 7) {
                    return Err(AttestationError::TagOverflow);
                }
                number = (number << 7) | u32::from(byte & 0x7F);
                if byte & 0x80 == 0 {
                    break;
                }
            }
            number
        } else {
            u32::from(identifier & 0x1F)
        };

        let (&first, tail) = rest.split_first().ok_or(AttestationError::Truncated)?;
        rest = tail;
        let len = if first & 0x80 == 0 {
            usize::from(first)
        } else {
            let count = usize::from(first & 0x7F);
            if count == 0 || count > std::mem::size_of::<usize>() || rest.len() < count {
                return Err(AttestationError::InvalidLength);
            }
            let (len_bytes, tail) = rest.split_at(count);
            rest = tail;
            len_bytes
                .iter()
                .fold(0usize, |acc, &b| (acc << 8) | usize::from(b))
        };

        if rest.len() < len {
            return Err(AttestationError::Truncated);
        }
        let (content, rest) = rest.split_at(len);
        Ok((
            Tlv {
                identifier,
                number,
                content,
            },
            rest,
        ))
    }
}

/// Read the next TLV from `fields`, which must carry `identifier`.
fn take<'a>(
    fields: &mut &'a [u8],
    identifier: u8,
    name: &'static str,
) -> Result<&'a [u8], AttestationError> {
    let (tlv, rest) = Tlv::read(*fields)?;
    expect_tag(&tlv, identifier, name)?;
    *fields = rest;
    Ok(tlv.content)
}

fn expect_tag(tlv: &Tlv<'_>, identifier: u8, name: &'static str) -> Result<(), AttestationError> {
    if tlv.identifier != identifier {
        return Err(AttestationError::UnexpectedTag {
            expected: name,
            found: tlv.identifier,
        });
    }
    Ok(())
}

/// Write an identifier (low or high tag number form) and a definite length.
fn write_header(out: &mut Vec<u8>, class_bits: u8, number: u32, len: usize) {
    if number < 0x1F {
        out.push(class_bits | number as u8);
    } else {
        out.push(class_bits | 0x1F);
        let groups = (32 - number.leading_zeros() + 6) / 7;
        for i in (0..groups).rev() {
            let byte = ((number >> (7 * i)) & 0x7F) as u8;
            out.push(if i == 0 { byte } else { byte | 0x80 });
        }
    }
    write_length(out, len);
}

fn write_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }
    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    out.push(0x80 | (bytes.len() - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
}

/// Universal-class TLV with a single identifier octet.
fn write_tlv(out: &mut Vec<u8>, identifier: u8, content: &[u8]) {
    out.push(identifier);
    write_length(out, content.len());
    out.extend_from_slice(content);
}

/// Minimal two's complement content octets.
fn integer_content(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

fn parse_integer(content: &[u8]) -> Result<i64, AttestationError> {
    if content.is_empty() || content.len() > 8 {
        return Err(AttestationError::IntegerOverflow);
    }
    let fill = if content[0] & 0x80 != 0 { 0xFF } else { 0x00 };
    let mut bytes = [fill; 8];
    bytes[8 - content.len()..].copy_from_slice(content);
    Ok(i64::from_be_bytes(bytes))
}
