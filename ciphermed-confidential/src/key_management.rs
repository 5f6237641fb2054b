use thiserror::Error;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};

type Result<T> = std::result::Result<T, KeyManagementError>;

/// Size of an X25519 public key, in bytes
pub const DH_PUBLIC_KEY_SIZE: usize = 32;

/// An ephemeral X25519 key pair.
///
/// `KeyPair` is generated by, and stays with, the party that will later decrypt
/// with it. Only the public half is ever placed in an instruction; the secret is
/// zeroized on drop by `x25519_dalek`.
pub struct KeyPair {
    /// The X25519 static secret used for key agreement.
    secret: StaticSecret,
    /// The public key derived from `secret`.
    public: PublicKey,
}

impl KeyPair {
    /// Reconstructs a key pair from raw secret key bytes.
    #[must_use]
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Returns the public key of this key pair.
    #[must_use]
    pub const fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Returns the public key as a raw 32-byte array.
    #[must_use]
    pub fn public_bytes(&self) -> [u8; DH_PUBLIC_KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Computes the shared secret between this key pair's secret and a remote public key.
    ///
    /// # Errors
    ///
    /// Returns `KeyManagementError::InvalidKey` if the remote key is a low-order
    /// point, in which case the exchange is non-contributory and the resulting
    /// secret would be known to anyone.
    pub fn shared_secret(&self, remote_public_key: &[u8; DH_PUBLIC_KEY_SIZE]) -> Result<SharedSecret> {
        derive_shared_secret(&self.secret, remote_public_key)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Generates a fresh X25519 key pair from the operating system's RNG.
#[must_use]
pub fn generate_key_pair() -> KeyPair {
    let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let public = PublicKey::from(&secret);
    KeyPair { secret, public }
}

/// Derives the X25519 shared secret between a local secret and a remote public key.
///
/// The scalar multiplication is constant time with respect to `secret`.
///
/// # Errors
///
/// Returns `KeyManagementError::InvalidKey` when `remote_public_key` is one of
/// the low-order points of Curve25519 (the output would be all zeros).
pub fn derive_shared_secret(
    secret: &StaticSecret,
    remote_public_key: &[u8; DH_PUBLIC_KEY_SIZE],
) -> Result<SharedSecret> {
    let remote = PublicKey::from(*remote_public_key);
    let shared_secret = secret.diffie_hellman(&remote);
    if !shared_secret.was_contributory() {
        tracing::error!(
            target = "ciphermed-confidential",
            event = "non_contributory_key_exchange",
            remote_public_key = %hex::encode(remote_public_key),
            "Remote public key is a low-order point"
        );
        return Err(KeyManagementError::InvalidKey(hex::encode(remote_public_key)));
    }
    Ok(shared_secret)
}

#[derive(Debug, Error)]
pub enum KeyManagementError {
    #[error("Invalid remote public key (low-order point): `{0}`")]
    InvalidKey(String),
}
