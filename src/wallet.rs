use std::error::Error;

use base58check::{FromBase58Check, ToBase58Check};
use p256::{
    ecdsa::{
        signature::{Signer, Verifier},
        Signature, SigningKey, VerifyingKey,
    },
    elliptic_curve::sec1::ToEncodedPoint,
};
use rand::rngs::OsRng;
use ring::digest::{Context, SHA256};
use ripemd::{Digest, Ripemd160};

pub type Hash160 = [u8; 20];
pub type Hash256 = [u8; 32];

/// An address is the RIPEMD160-SHA256 hash of a public key. The textual form
/// adds a version byte and a 4-byte checksum, encoded in base58.
pub type Address = Hash160;

pub const ADDRESS_VERSION: u8 = 0x00;
/// Public keys are the raw X and Y curve coordinates, 32 bytes each.
pub const PUBLIC_KEY_LEN: usize = 64;
/// Signatures are fixed-width `r || s`, each left-padded to 32 bytes.
pub const SIGNATURE_LEN: usize = 64;

pub fn sha256(data: &[u8]) -> Hash256 {
    let mut context = Context::new(&SHA256);
    context.update(data);
    let digest = context.finish();

    let mut out = [0_u8; 32];
    out.copy_from_slice(digest.as_ref());

    out
}

pub fn hash_pubkey(public_key: &[u8]) -> Address {
    let sha256_hash = sha256(public_key);

    let mut hasher160 = Ripemd160::new();
    hasher160.update(sha256_hash);
    let result = hasher160.finalize();

    let mut out = [0_u8; 20];
    out.copy_from_slice(&result);

    out
}

pub fn encode_address(public_key: &[u8]) -> String {
    let pub_key_hash = hash_pubkey(public_key);
    pub_key_hash.to_base58check(ADDRESS_VERSION)
}

pub fn address_to_b58c(pub_key_hash: &[u8]) -> String {
    pub_key_hash.to_base58check(ADDRESS_VERSION)
}

/// Decodes a textual address back into the public key hash it carries.
/// The checksum is recomputed and compared as part of decoding.
pub fn decode_address(address: &str) -> Result<Address, Box<dyn Error>> {
    let (version, payload) = address
        .from_base58check()
        .map_err(|err| format!("Bad address {}: {:?}", address, err))?;

    if version != ADDRESS_VERSION {
        return Err(format!("Bad address version byte: {:#04x}", version).into());
    }

    if payload.len() != 20 {
        return Err(format!("Bad address payload length: {}", payload.len()).into());
    }

    let mut out = [0_u8; 20];
    out.copy_from_slice(&payload);

    Ok(out)
}

pub fn validate_address(address: &str) -> bool {
    decode_address(address).is_ok()
}

/// An ECDSA keypair over NIST P-256. The private key is its scalar `D`;
/// wallets persist `D` and rebuild the pair by scalar base-multiplication.
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Keypair {
            signing_key: SigningKey::random(&mut OsRng),
        }
    }

    pub fn from_scalar(d: &[u8]) -> Result<Self, Box<dyn Error>> {
        let signing_key =
            SigningKey::from_slice(d).map_err(|_| "Stored private key scalar is invalid")?;

        Ok(Keypair { signing_key })
    }

    pub fn secret_scalar(&self) -> Vec<u8> {
        self.signing_key.to_bytes().to_vec()
    }

    /// The 64-byte `X || Y` encoding, no SEC1 prefix.
    pub fn public_key_bytes(&self) -> Vec<u8> {
        let point = self.signing_key.verifying_key().to_encoded_point(false);
        let mut out = Vec::with_capacity(PUBLIC_KEY_LEN);
        out.extend_from_slice(point.x().expect("public point is never the identity"));
        out.extend_from_slice(point.y().expect("public point is never the identity"));

        out
    }

    pub fn address(&self) -> Address {
        hash_pubkey(&self.public_key_bytes())
    }

    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        let sig: Signature = self.signing_key.sign(msg);
        sig.to_bytes().to_vec()
    }
}

/// Verifies a fixed-width signature against a raw `X || Y` public key.
/// Anything with the wrong length fails without touching the curve math.
pub fn verify_signature(public_key: &[u8], msg: &[u8], signature: &[u8]) -> bool {
    if public_key.len() != PUBLIC_KEY_LEN || signature.len() != SIGNATURE_LEN {
        return false;
    }

    let mut sec1 = Vec::with_capacity(PUBLIC_KEY_LEN + 1);
    sec1.push(0x04);
    sec1.extend_from_slice(public_key);

    let verifying_key = match VerifyingKey::from_sec1_bytes(&sec1) {
        Ok(key) => key,
        Err(_) => return false,
    };

    let sig = match Signature::from_slice(signature) {
        Ok(sig) => sig,
        Err(_) => return false,
    };

    verifying_key.verify(msg, &sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_roundtrip() {
        let keypair = Keypair::generate();
        let pubkey = keypair.public_key_bytes();
        let address = encode_address(&pubkey);

        assert!(validate_address(&address));
        assert_eq!(decode_address(&address).unwrap(), hash_pubkey(&pubkey));
    }

    #[test]
    fn tampered_address_fails_checksum() {
        let keypair = Keypair::generate();
        let address = encode_address(&keypair.public_key_bytes());

        let mut chars: Vec<char> = address.chars().collect();
        let last = chars.len() - 1;
        chars[last] = if chars[last] == '1' { '2' } else { '1' };
        let tampered: String = chars.into_iter().collect();

        assert!(!validate_address(&tampered));
    }

    #[test]
    fn garbage_addresses_rejected() {
        assert!(!validate_address(""));
        assert!(!validate_address("0OIl"));
        assert!(!validate_address("not an address"));
    }

    #[test]
    fn keypair_rebuilds_from_scalar() {
        let keypair = Keypair::generate();
        let rebuilt = Keypair::from_scalar(&keypair.secret_scalar()).unwrap();

        assert_eq!(keypair.public_key_bytes(), rebuilt.public_key_bytes());
        assert_eq!(keypair.address(), rebuilt.address());
    }

    #[test]
    fn sign_and_verify() {
        let keypair = Keypair::generate();
        let pubkey = keypair.public_key_bytes();
        let msg = b"some signed bytes";
        let sig = keypair.sign(msg);

        assert_eq!(sig.len(), SIGNATURE_LEN);
        assert_eq!(pubkey.len(), PUBLIC_KEY_LEN);
        assert!(verify_signature(&pubkey, msg, &sig));
        assert!(!verify_signature(&pubkey, b"different bytes", &sig));

        let other = Keypair::generate();
        assert!(!verify_signature(&other.public_key_bytes(), msg, &sig));
    }

    #[test]
    fn bad_lengths_rejected() {
        let keypair = Keypair::generate();
        let msg = b"msg";
        let sig = keypair.sign(msg);

        assert!(!verify_signature(&keypair.public_key_bytes()[1..], msg, &sig));
        assert!(!verify_signature(&keypair.public_key_bytes(), msg, &sig[1..]));
        assert!(!verify_signature(&[], msg, &[]));
    }
}
