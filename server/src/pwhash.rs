//! bcrypt helpers for `auth_config.json`'s `password_hash` field (§6).
//! The dashboard session login itself is out of scope for this core, but
//! the state-store file format it reads is part of the core's persisted
//! file list, so hashing/verification live here rather than being
//! invented ad hoc by whatever eventually owns the dashboard.

use bcrypt::{hash, verify, DEFAULT_COST};

pub fn hash_password(plain: &str) -> Result<String, bcrypt::BcryptError> {
    hash(plain, DEFAULT_COST)
}

pub fn verify_password(plain: &str, hashed: &str) -> bool {
    verify(plain, hashed).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_verify_round_trips() {
        let h = hash_password("correct horse").unwrap();
        assert!(verify_password("correct horse", &h));
        assert!(!verify_password("wrong", &h));
    }
}
