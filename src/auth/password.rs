use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use rand::rngs::OsRng;
use tracing::error;

pub const MIN_PASSWORD_LEN: usize = 8;
pub const MAX_PASSWORD_LEN: usize = 128;

/// Length policy shared by sign-up, reset and admin-created users.
pub fn check_policy(plain: &str) -> Result<(), &'static str> {
    let len = plain.chars().count();
    if len < MIN_PASSWORD_LEN {
        return Err("Password too short");
    }
    if len > MAX_PASSWORD_LEN {
        return Err("Password too long");
    }
    Ok(())
}

pub fn hash_password(plain: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(plain.as_bytes(), &salt)
        .map_err(|e| {
            error!(error = %e, "argon2 hash_password error");
            anyhow::anyhow!(e.to_string())
        })?
        .to_string();
    Ok(hash)
}

pub fn verify_password(plain: &str, hash: &str) -> anyhow::Result<bool> {
    let parsed = PasswordHash::new(hash).map_err(|e| {
        error!(error = %e, "argon2 parse hash error");
        anyhow::anyhow!(e.to_string())
    })?;
    Ok(Argon2::default()
        .verify_password(plain.as_bytes(), &parsed)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_verifies_only_the_original() {
        let hash = hash_password("Secur3P@ssw0rd!").expect("hashing should succeed");
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("Secur3P@ssw0rd!", &hash).unwrap());
        assert!(!verify_password("wrong-password", &hash).unwrap());
    }

    #[test]
    fn same_password_gets_distinct_salts() {
        let a = hash_password("correct-horse").unwrap();
        let b = hash_password("correct-horse").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn malformed_hash_is_an_error() {
        assert!(verify_password("anything", "not-a-valid-hash").is_err());
    }

    #[test]
    fn policy_bounds() {
        assert_eq!(check_policy("short"), Err("Password too short"));
        assert!(check_policy("exactly8").is_ok());
        assert_eq!(check_policy(&"x".repeat(129)), Err("Password too long"));
    }
}
