//! Admin password hashing with Argon2id.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use secrecy::{ExposeSecret, Secret};

/// A PHC-format Argon2 hash, kept out of logs.
#[derive(Clone)]
pub struct AdminPasswordHash(Secret<String>);

impl AdminPasswordHash {
    /// Wrap an existing PHC string, rejecting anything Argon2 cannot parse.
    pub fn parse(phc: String) -> Result<Self, anyhow::Error> {
        PasswordHash::new(&phc).map_err(|e| anyhow::anyhow!("Invalid password hash: {}", e))?;
        Ok(Self(Secret::new(phc)))
    }

    /// Hash a plaintext password with a fresh random salt.
    pub fn from_plaintext(password: &str) -> Result<Self, anyhow::Error> {
        let salt = SaltString::generate(&mut OsRng);
        let phc = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))?
            .to_string();
        Ok(Self(Secret::new(phc)))
    }

    /// Constant-time verification of `candidate` against the stored hash.
    pub fn verify(&self, candidate: &str) -> bool {
        match PasswordHash::new(self.0.expose_secret()) {
            Ok(parsed) => Argon2::default()
                .verify_password(candidate.as_bytes(), &parsed)
                .is_ok(),
            Err(_) => false,
        }
    }
}

impl std::fmt::Debug for AdminPasswordHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AdminPasswordHash([REDACTED])")
    }
}
