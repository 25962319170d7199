// Login credentials and change detection.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// The ways a client can authenticate to mint session tokens.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Credentials {
    Email { email: String, password: String },
    /// Login through the account's ekey instead of its email address.
    Ekey { ekey: String, password: String },
    Facebook { access_token: String },
}

impl Credentials {
    pub fn email(email: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::Email {
            email: email.into(),
            password: password.into(),
        }
    }

    pub fn ekey(ekey: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::Ekey {
            ekey: ekey.into(),
            password: password.into(),
        }
    }

    pub fn facebook(access_token: impl Into<String>) -> Self {
        Credentials::Facebook {
            access_token: access_token.into(),
        }
    }

    /// Stable within one process; used to spot credential changes in logs and
    /// bookkeeping without holding on to the secrets.
    pub fn credentials_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Credentials::Email { .. } => "email",
            Credentials::Ekey { .. } => "ekey",
            Credentials::Facebook { .. } => "facebook",
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Email { email, .. } => f
                .debug_struct("Email")
                .field("email", email)
                .field("password", &"<redacted>")
                .finish(),
            Credentials::Ekey { ekey, .. } => f
                .debug_struct("Ekey")
                .field("ekey", ekey)
                .field("password", &"<redacted>")
                .finish(),
            Credentials::Facebook { .. } => f
                .debug_struct("Facebook")
                .field("access_token", &"<redacted>")
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_equality() {
        assert_eq!(
            Credentials::email("a@b.c", "pw"),
            Credentials::email("a@b.c", "pw")
        );
        assert_ne!(
            Credentials::email("a@b.c", "pw"),
            Credentials::email("a@b.c", "other")
        );
        assert_ne!(Credentials::email("x", "pw"), Credentials::ekey("x", "pw"));
    }

    #[test]
    fn test_hash_tracks_equality() {
        let a = Credentials::facebook("tok");
        assert_eq!(a.credentials_hash(), Credentials::facebook("tok").credentials_hash());
        assert_ne!(a.credentials_hash(), Credentials::facebook("tok2").credentials_hash());
    }

    #[test]
    fn test_debug_hides_secrets() {
        let text = format!("{:?}", Credentials::email("me@example.com", "hunter2"));
        assert!(text.contains("me@example.com"));
        assert!(!text.contains("hunter2"));
        let text = format!("{:?}", Credentials::facebook("secret-token"));
        assert!(!text.contains("secret-token"));
    }
}
