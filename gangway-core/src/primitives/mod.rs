// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! Destination and key material primitives.
//!
//! The bridge treats key material as opaque: it parses the framing of
//! destination and private-key blobs so it can derive identifiers, detect
//! offline-signature blocks and echo private material back to clients, but it
//! never performs any cryptography itself.

use crate::{
    crypto::{base16_encode, base64_decode, base64_encode},
    error::DestinationError,
};

use bytes::Bytes;
use nom::{
    bytes::complete::take,
    number::complete::{be_u16, be_u32, be_u8},
    IResult,
};
use zeroize::Zeroizing;

use alloc::{string::String, vec::Vec};
use core::fmt;

/// Size of the public (encryption) key block of a destination.
const PUBLIC_KEY_LEN: usize = 256;

/// Size of the signing key block of a destination, padding included.
const SIGNING_KEY_BLOCK_LEN: usize = 128;

/// Minimum size of a serialized destination: key blocks plus a certificate
/// header with an empty payload.
pub const DESTINATION_MIN_LEN: usize = PUBLIC_KEY_LEN + SIGNING_KEY_BLOCK_LEN + 3;

/// Key certificate type.
const CERTIFICATE_KEY: u8 = 5;

/// Signature type of a destination.
///
/// Only Ed25519 (type 7) needs to be fully supported; other known types are
/// recognized far enough to parse their key material lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignatureType(u16);

impl SignatureType {
    /// DSA-SHA1, the implied type of destinations without a key certificate.
    pub const DSA_SHA1: Self = Self(0);

    /// Ed25519, the default for new destinations.
    pub const ED25519: Self = Self(7);

    /// RedDSA, used for transient keys in offline-signature blocks.
    pub const RED_DSA: Self = Self(11);

    /// Create a signature type from its wire value.
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    /// Wire value.
    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// `(public key, signature, private key)` lengths in bytes, if known.
    pub fn key_lengths(&self) -> Option<(usize, usize, usize)> {
        match self.0 {
            0 => Some((128, 40, 20)),
            7 | 11 => Some((32, 64, 32)),
            _ => None,
        }
    }
}

impl fmt::Display for SignatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier of a destination.
///
/// Derived from the first 32 bytes of the destination's public-key material
/// and rendered as lowercase hex. Used as the registry key for global
/// destination uniqueness.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DestinationId([u8; 32]);

impl DestinationId {
    /// Create [`DestinationId`] from the serialized form of a destination.
    ///
    /// Callers must have validated that `serialized` holds at least 32 bytes.
    pub fn from_serialized(serialized: &[u8]) -> Self {
        let mut id = [0u8; 32];
        id.copy_from_slice(&serialized[..32]);

        Self(id)
    }

    /// Raw bytes of the identifier.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&base16_encode(self.0))
    }
}

impl fmt::Debug for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DestinationId({})", &base16_encode(self.0)[..16])
    }
}

/// Parsed offline-signature block.
///
/// Present when the signing private key of a private-key blob is all zeros:
/// the destination's long-term signing key lives elsewhere and a transient
/// key, signed by it, is supplied instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineSignature {
    /// Expiration, seconds since the Unix epoch.
    pub expires: u32,

    /// Signature type of the transient key.
    pub transient_sig_type: SignatureType,

    /// Transient public key.
    pub transient_public_key: Vec<u8>,

    /// Signature over the block header, made with the offline key.
    pub signature: Vec<u8>,

    /// Transient private key.
    pub transient_private_key: Vec<u8>,
}

/// Private key material of a locally owned destination.
///
/// Held only for echoing back to the owning client; zeroized on drop.
struct PrivateKeys {
    /// The full decoded private-key blob, destination included.
    blob: Zeroizing<Vec<u8>>,
}

/// An I2P destination.
///
/// Wraps the serialized public form, the derived identifier and, for locally
/// owned destinations, the private-key blob and an optional offline-signature
/// block.
pub struct Destination {
    /// Serialized public destination.
    serialized: Bytes,

    /// Destination ID.
    destination_id: DestinationId,

    /// Signature type.
    signature_type: SignatureType,

    /// Private key material, for locally owned destinations.
    private: Option<PrivateKeys>,

    /// Offline-signature block, if the private material carries one.
    offline_signature: Option<OfflineSignature>,
}

impl Clone for Destination {
    fn clone(&self) -> Self {
        Self {
            serialized: self.serialized.clone(),
            destination_id: self.destination_id,
            signature_type: self.signature_type,
            private: self.private.as_ref().map(|keys| PrivateKeys {
                blob: keys.blob.clone(),
            }),
            offline_signature: self.offline_signature.clone(),
        }
    }
}

impl PartialEq for Destination {
    fn eq(&self, other: &Self) -> bool {
        self.destination_id == other.destination_id
    }
}

impl Eq for Destination {}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination")
            .field("id", &self.destination_id)
            .field("signature_type", &self.signature_type)
            .field("offline", &self.offline_signature.is_some())
            .finish_non_exhaustive()
    }
}

/// Parse the serialized destination at the head of `input`, returning the
/// remainder and `(destination bytes, signature type, crypto type)`.
fn parse_destination_frame(input: &[u8]) -> IResult<&[u8], (&[u8], SignatureType, u16)> {
    let (rest, _keys) = take(PUBLIC_KEY_LEN + SIGNING_KEY_BLOCK_LEN)(input)?;
    let (rest, cert_type) = be_u8(rest)?;
    let (rest, cert_len) = be_u16(rest)?;
    let (rest, payload) = take(cert_len as usize)(rest)?;

    let (signature_type, crypto_type) = if cert_type == CERTIFICATE_KEY && payload.len() >= 4 {
        (
            SignatureType::new(u16::from_be_bytes([payload[0], payload[1]])),
            u16::from_be_bytes([payload[2], payload[3]]),
        )
    } else {
        (SignatureType::DSA_SHA1, 0u16)
    };

    let consumed = input.len() - rest.len();

    Ok((rest, (&input[..consumed], signature_type, crypto_type)))
}

/// Encryption private key length for `crypto_type`.
fn encryption_key_len(crypto_type: u16) -> Option<usize> {
    match crypto_type {
        // elgamal
        0 => Some(256),
        // ecies-x25519
        4 => Some(32),
        _ => None,
    }
}

/// Parse an offline-signature block.
///
/// Layout: `expires (4) | transient sig type (2) | transient public key |
/// signature | transient private key`, with key and signature lengths driven
/// by the signature types involved.
fn parse_offline_signature(
    input: &[u8],
    destination_sig_type: SignatureType,
) -> Option<OfflineSignature> {
    let (rest, expires) = be_u32::<_, ()>(input).ok()?;
    let (rest, transient_type) = be_u16::<_, ()>(rest).ok()?;

    let transient_sig_type = SignatureType::new(transient_type);
    let (transient_public_len, _, transient_private_len) = transient_sig_type.key_lengths()?;
    let (_, signature_len, _) = destination_sig_type.key_lengths()?;

    let (rest, public_key) = take::<_, _, ()>(transient_public_len)(rest).ok()?;
    let (rest, signature) = take::<_, _, ()>(signature_len)(rest).ok()?;
    let (_, private_key) = take::<_, _, ()>(transient_private_len)(rest).ok()?;

    Some(OfflineSignature {
        expires,
        transient_sig_type,
        transient_public_key: public_key.to_vec(),
        signature: signature.to_vec(),
        transient_private_key: private_key.to_vec(),
    })
}

impl Destination {
    /// Parse a public destination from its Base64 form.
    pub fn from_public_b64(input: &str) -> Result<Self, DestinationError> {
        let decoded = base64_decode(input).ok_or(DestinationError::InvalidEncoding)?;

        if decoded.len() < DESTINATION_MIN_LEN {
            return Err(DestinationError::NotEnoughBytes);
        }

        let (rest, (serialized, signature_type, _)) =
            parse_destination_frame(&decoded).map_err(|_| DestinationError::Malformed)?;

        if !rest.is_empty() {
            return Err(DestinationError::Malformed);
        }

        Ok(Self {
            destination_id: DestinationId::from_serialized(serialized),
            serialized: Bytes::from(serialized.to_vec()),
            signature_type,
            private: None,
            offline_signature: None,
        })
    }

    /// Parse a private-key blob from its Base64 form.
    ///
    /// The blob is the serialized destination followed by the encryption
    /// private key, the signing private key and, when the signing key is all
    /// zeros, an offline-signature block.
    pub fn from_private_b64(input: &str) -> Result<Self, DestinationError> {
        let decoded =
            Zeroizing::new(base64_decode(input).ok_or(DestinationError::InvalidEncoding)?);

        if decoded.len() < DESTINATION_MIN_LEN {
            return Err(DestinationError::NotEnoughBytes);
        }

        let (rest, (serialized, signature_type, crypto_type)) =
            parse_destination_frame(&decoded).map_err(|_| DestinationError::Malformed)?;

        let encryption_len = encryption_key_len(crypto_type).ok_or(DestinationError::Malformed)?;
        let (_, _, signing_len) = signature_type
            .key_lengths()
            .ok_or(DestinationError::UnsupportedSignatureType(signature_type.as_u16()))?;

        let (rest, _encryption_key) =
            take::<_, _, ()>(encryption_len)(rest).map_err(|_| DestinationError::NotEnoughBytes)?;
        let (rest, signing_key) =
            take::<_, _, ()>(signing_len)(rest).map_err(|_| DestinationError::NotEnoughBytes)?;

        let offline_signature = if signing_key.iter().all(|byte| byte == &0u8) {
            Some(
                parse_offline_signature(rest, signature_type)
                    .ok_or(DestinationError::Malformed)?,
            )
        } else {
            None
        };

        Ok(Self {
            destination_id: DestinationId::from_serialized(serialized),
            serialized: Bytes::from(serialized.to_vec()),
            signature_type,
            private: Some(PrivateKeys {
                blob: Zeroizing::new(decoded.to_vec()),
            }),
            offline_signature,
        })
    }

    /// Destination ID.
    pub fn id(&self) -> DestinationId {
        self.destination_id
    }

    /// Signature type.
    pub fn signature_type(&self) -> SignatureType {
        self.signature_type
    }

    /// Base64 form of the public destination.
    pub fn to_public_b64(&self) -> String {
        base64_encode(&self.serialized)
    }

    /// Base64 form of the private-key blob, if this destination is locally
    /// owned. Offline-signature blocks are carried through verbatim.
    pub fn to_private_b64(&self) -> Option<String> {
        self.private.as_ref().map(|keys| base64_encode(&keys.blob))
    }

    /// Offline-signature block, if present.
    pub fn offline_signature(&self) -> Option<&OfflineSignature> {
        self.offline_signature.as_ref()
    }

    /// Serialized public form.
    pub fn serialized(&self) -> &[u8] {
        &self.serialized
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use alloc::vec;

    /// Build a syntactically valid private-key blob for tests.
    ///
    /// `fill` seeds the key material so two blobs with different fills have
    /// different destination IDs.
    pub fn make_private_blob(fill: u8) -> Vec<u8> {
        let mut blob = Vec::new();

        // public key + signing key block
        blob.extend(core::iter::repeat(fill).take(256 + 128));
        // key certificate: ed25519 + ecies-x25519
        blob.push(5u8);
        blob.extend(4u16.to_be_bytes());
        blob.extend(7u16.to_be_bytes());
        blob.extend(4u16.to_be_bytes());
        // encryption private key + signing private key
        blob.extend(core::iter::repeat(fill.wrapping_add(1)).take(32));
        blob.extend(core::iter::repeat(fill.wrapping_add(2)).take(32));

        blob
    }

    /// Build a private-key blob whose signing key is zeroed and which carries
    /// an offline-signature block.
    pub fn make_offline_blob(fill: u8) -> Vec<u8> {
        let mut blob = make_private_blob(fill);
        let signing_key_start = blob.len() - 32;
        blob[signing_key_start..].fill(0u8);

        // expires + transient sig type
        blob.extend(1_700_000_000u32.to_be_bytes());
        blob.extend(11u16.to_be_bytes());
        // transient public key, signature, transient private key
        blob.extend(core::iter::repeat(0xaa).take(32));
        blob.extend(core::iter::repeat(0xbb).take(64));
        blob.extend(core::iter::repeat(0xcc).take(32));

        blob
    }

    #[test]
    fn parse_private_blob() {
        let blob = make_private_blob(1);
        let destination = Destination::from_private_b64(&base64_encode(&blob)).unwrap();

        assert_eq!(destination.signature_type(), SignatureType::ED25519);
        assert!(destination.offline_signature().is_none());
        assert_eq!(destination.serialized().len(), 391);
        assert_eq!(destination.to_private_b64().unwrap(), base64_encode(&blob));
    }

    #[test]
    fn parse_public_destination() {
        let blob = make_private_blob(2);
        let public = base64_encode(&blob[..391]);
        let destination = Destination::from_public_b64(&public).unwrap();

        assert_eq!(destination.to_public_b64(), public);
        assert!(destination.to_private_b64().is_none());
    }

    #[test]
    fn private_and_public_forms_agree() {
        let blob = make_private_blob(3);
        let private = Destination::from_private_b64(&base64_encode(&blob)).unwrap();
        let public = Destination::from_public_b64(&private.to_public_b64()).unwrap();

        assert_eq!(private.id(), public.id());
    }

    #[test]
    fn trailing_bytes_rejected_for_public() {
        let mut blob = make_private_blob(4)[..391].to_vec();
        blob.push(0xff);

        assert_eq!(
            Destination::from_public_b64(&base64_encode(&blob)).unwrap_err(),
            DestinationError::Malformed,
        );
    }

    #[test]
    fn offline_signature_detected() {
        let blob = make_offline_blob(5);
        let destination = Destination::from_private_b64(&base64_encode(&blob)).unwrap();

        let offline = destination.offline_signature().unwrap();
        assert_eq!(offline.expires, 1_700_000_000);
        assert_eq!(offline.transient_sig_type, SignatureType::RED_DSA);
        assert_eq!(offline.transient_public_key, vec![0xaa; 32]);
        assert_eq!(offline.signature, vec![0xbb; 64]);
        assert_eq!(offline.transient_private_key, vec![0xcc; 32]);

        // the full blob, offline block included, is echoed back verbatim
        assert_eq!(destination.to_private_b64().unwrap(), base64_encode(&blob));
    }

    #[test]
    fn truncated_offline_signature_rejected() {
        let mut blob = make_offline_blob(6);
        blob.truncate(blob.len() - 16);

        assert_eq!(
            Destination::from_private_b64(&base64_encode(&blob)).unwrap_err(),
            DestinationError::Malformed,
        );
    }

    #[test]
    fn invalid_encoding_rejected() {
        assert_eq!(
            Destination::from_public_b64("not/base64!").unwrap_err(),
            DestinationError::InvalidEncoding,
        );
    }

    #[test]
    fn short_blob_rejected() {
        assert_eq!(
            Destination::from_public_b64(&base64_encode([1u8; 64])).unwrap_err(),
            DestinationError::NotEnoughBytes,
        );
    }

    #[test]
    fn destination_id_is_hex_of_key_prefix() {
        let blob = make_private_blob(0xab);
        let destination = Destination::from_private_b64(&base64_encode(&blob)).unwrap();

        assert_eq!(
            alloc::format!("{}", destination.id()),
            "ab".repeat(32),
        );
    }
}
