//! Identità crittografica: indirizzi e chiavi di firma secp256k1

use secp256k1::{ecdsa::Signature, Message, PublicKey, SecretKey, SECP256K1};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash as StdHash, Hasher};

/// Lunghezza di un indirizzo serializzato (chiave pubblica compressa SEC1)
pub const ADDRESS_LEN: usize = 33;

/// Indirizzo: chiave pubblica che possiede un output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address(PublicKey);

/// Chiave privata usata per firmare gli input
#[derive(Clone)]
pub struct SigningKey(SecretKey);

impl Address {
    /// Ricostruisce un indirizzo dalla chiave pubblica serializzata
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        PublicKey::from_slice(bytes)
            .map(Self)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
    }

    /// Forma compressa a 33 byte, usata nel payload firmato e nell'hash
    pub fn to_bytes(&self) -> [u8; ADDRESS_LEN] {
        self.0.serialize()
    }

    /// Verifica una firma compatta ECDSA su SHA-256(payload).
    /// Byte di firma malformati non sono un errore: la firma è semplicemente invalida.
    pub fn verify(&self, payload: &[u8], signature: &[u8]) -> bool {
        let signature = match Signature::from_compact(signature) {
            Ok(signature) => signature,
            Err(_) => return false,
        };

        match Message::from_slice(&signing_digest(payload)) {
            Ok(message) => SECP256K1.verify_ecdsa(&message, &signature, &self.0).is_ok(),
            Err(_) => false,
        }
    }
}

impl StdHash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_bytes().cmp(&other.to_bytes())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

impl SigningKey {
    /// Crea una chiave da 32 byte di segreto
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        SecretKey::from_slice(bytes)
            .map(Self)
            .map_err(|e| CryptoError::InvalidSecretKey(e.to_string()))
    }

    /// Indirizzo corrispondente a questa chiave
    pub fn address(&self) -> Address {
        Address(PublicKey::from_secret_key(SECP256K1, &self.0))
    }

    /// Firma SHA-256(payload), restituisce la firma compatta a 64 byte
    pub fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let message = Message::from_slice(&signing_digest(payload))
            .map_err(|e| CryptoError::Signing(e.to_string()))?;

        let signature = SECP256K1.sign_ecdsa(&message, &self.0);
        Ok(signature.serialize_compact().to_vec())
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // mai stampare il segreto
        write!(f, "SigningKey({})", self.address())
    }
}

fn signing_digest(payload: &[u8]) -> [u8; 32] {
    Sha256::digest(payload).into()
}

/// Errori crittografici
#[derive(Debug, Clone, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid secret key: {0}")]
    InvalidSecretKey(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Signing failed: {0}")]
    Signing(String),
}
