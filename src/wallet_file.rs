use std::{fs, path::Path};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use scrypt::{scrypt, Params};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::wallet::Keypair;

pub const WALLET_DIR: &str = "wallets";

const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;
const SCRYPT_KEY_LEN: usize = 32;

const SALT_LEN: usize = 16;
/// The GCM default nonce size. The nonce is prefixed to the ciphertext.
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum WalletFileError {
    #[error("wallet io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wallet file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("decryption failed (wrong password?)")]
    Decrypt,
    #[error("encryption failed")]
    Encrypt,
    #[error("stored private key is corrupt")]
    BadKey,
    #[error("wallet for address {0} not found")]
    NotFound(String),
}

/// The on-disk wallet: `wallets/<address>.json`. The private key scalar is
/// encrypted with AES-256-GCM under a password-derived key.
#[derive(Serialize, Deserialize, Debug)]
pub struct WalletFile {
    pub address: String,
    pub public_key: Vec<u8>,
    pub encrypted_key: Vec<u8>,
    pub salt: Vec<u8>,
}

impl WalletFile {
    pub fn create(keypair: &Keypair, password: &str) -> Result<Self, WalletFileError> {
        let salt: [u8; SALT_LEN] = rand::random();
        let aes_key = derive_key(password, &salt)?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&aes_key));
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, keypair.secret_scalar().as_slice())
            .map_err(|_| WalletFileError::Encrypt)?;

        let mut encrypted_key = nonce_bytes.to_vec();
        encrypted_key.extend_from_slice(&ciphertext);

        let public_key = keypair.public_key_bytes();

        Ok(WalletFile {
            address: crate::wallet::encode_address(&public_key),
            public_key,
            encrypted_key,
            salt: salt.to_vec(),
        })
    }

    pub fn decrypt(&self, password: &str) -> Result<Keypair, WalletFileError> {
        let aes_key = derive_key(password, &self.salt)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&aes_key));

        if self.encrypted_key.len() < NONCE_LEN {
            return Err(WalletFileError::Decrypt);
        }

        let (nonce_bytes, ciphertext) = self.encrypted_key.split_at(NONCE_LEN);
        let scalar = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| WalletFileError::Decrypt)?;

        Keypair::from_scalar(&scalar).map_err(|_| WalletFileError::BadKey)
    }

    pub fn save(&self) -> Result<(), WalletFileError> {
        self.save_to(WALLET_DIR)
    }

    pub fn save_to(&self, dir: &str) -> Result<(), WalletFileError> {
        fs::create_dir_all(dir)?;
        let path = Path::new(dir).join(format!("{}.json", self.address));
        let data = serde_json::to_vec_pretty(self)?;
        fs::write(path, data)?;

        Ok(())
    }

    pub fn load(address: &str) -> Result<Self, WalletFileError> {
        Self::load_from(WALLET_DIR, address)
    }

    pub fn load_from(dir: &str, address: &str) -> Result<Self, WalletFileError> {
        let path = Path::new(dir).join(format!("{}.json", address));
        let data = fs::read(&path).map_err(|_| WalletFileError::NotFound(address.to_owned()))?;
        let wf: WalletFile = serde_json::from_slice(&data)?;

        Ok(wf)
    }
}

fn derive_key(password: &str, salt: &[u8]) -> Result<[u8; SCRYPT_KEY_LEN], WalletFileError> {
    let params = Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, SCRYPT_KEY_LEN)
        .map_err(|_| WalletFileError::KeyDerivation)?;

    let mut out = [0_u8; SCRYPT_KEY_LEN];
    scrypt(password.as_bytes(), salt, &params, &mut out)
        .map_err(|_| WalletFileError::KeyDerivation)?;

    Ok(out)
}
