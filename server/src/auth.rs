//! Cookie HMACs for the virtual-host router: the per-host basic-auth
//! ticket (`tc_auth_<8hex>`) and the per-IP smart-shield ticket
//! (`tc_shield`), both HMAC-SHA256 over a composite keyed by the server
//! token (§6).

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub const AUTH_COOKIE_MAX_AGE_SECS: i64 = 7 * 24 * 3600;
pub const SHIELD_COOKIE_MAX_AGE_SECS: i64 = 24 * 3600;
pub const SHIELD_COOKIE_NAME: &str = "tc_shield";

fn hmac_hex(secret: &str, message: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// `tc_auth_<8hex of sha256(host)>` — the cookie *name* for a given host.
pub fn auth_cookie_name(host: &str) -> String {
    let digest = Sha256::digest(host.as_bytes());
    format!("tc_auth_{}", hex::encode(&digest[..4]))
}

/// The cookie *value*: `hex(HMAC-SHA256(secret, host ∥ user ∥ pass))`.
pub fn auth_cookie_value(secret: &str, host: &str, user: &str, pass: &str) -> String {
    hmac_hex(secret, &format!("{host}{user}{pass}"))
}

/// The shield cookie value: `HMAC-SHA256(secret, clientIP ∥ secret)`.
pub fn shield_cookie_value(secret: &str, client_ip: &str) -> String {
    hmac_hex(secret, &format!("{client_ip}{secret}"))
}

/// Minimal hex encoding so this module doesn't pull in the `hex` crate
/// just for two call sites — kept here rather than in a shared "utils"
/// grab-bag since it's only ever used on HMAC digests.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        use std::fmt::Write;
        let mut out = String::with_capacity(bytes.as_ref().len() * 2);
        for b in bytes.as_ref() {
            write!(out, "{b:02x}").unwrap();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_cookie_value_is_deterministic() {
        let a = auth_cookie_value("tok", "h", "u", "p");
        let b = auth_cookie_value("tok", "h", "u", "p");
        assert_eq!(a, b);
    }

    #[test]
    fn wrong_password_produces_a_different_cookie() {
        let a = auth_cookie_value("tok", "h", "u", "p");
        let b = auth_cookie_value("tok", "h", "u", "wrong");
        assert_ne!(a, b);
    }

    #[test]
    fn shield_cookie_is_bound_to_client_ip() {
        let a = shield_cookie_value("tok", "1.2.3.4");
        let b = shield_cookie_value("tok", "5.6.7.8");
        assert_ne!(a, b);
    }

    #[test]
    fn auth_cookie_name_is_stable_per_host() {
        assert_eq!(auth_cookie_name("api.example"), auth_cookie_name("api.example"));
        assert_ne!(auth_cookie_name("api.example"), auth_cookie_name("other.example"));
    }
}
