use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;

/// A freshly issued bearer credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCredential {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Which credential family a token belongs to; used as a visible prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    Verification,
    Release,
}

impl CredentialKind {
    fn prefix(self) -> &'static str {
        match self {
            Self::Verification => "hv",
            Self::Release => "hr",
        }
    }
}

pub fn issue(kind: CredentialKind, now: DateTime<Utc>, ttl: Duration) -> IssuedCredential {
    let mut bytes = [0_u8; 32];
    OsRng.fill_bytes(&mut bytes);
    IssuedCredential {
        token: format!("{}_{}", kind.prefix(), hex::encode(bytes)),
        expires_at: now + ttl,
    }
}

/// Compare a presented token with the stored one without leaking timing.
///
/// `blake3::Hash` equality is constant-time.
pub fn matches(stored: &str, presented: &str) -> bool {
    blake3::hash(stored.as_bytes()) == blake3::hash(presented.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_tokens_are_unique_and_prefixed() {
        let now = Utc::now();
        let a = issue(CredentialKind::Release, now, Duration::days(90));
        let b = issue(CredentialKind::Release, now, Duration::days(90));

        assert_ne!(a.token, b.token);
        assert!(a.token.starts_with("hr_"));
        assert_eq!(a.token.len(), 3 + 64);
        assert_eq!(a.expires_at, now + Duration::days(90));
    }

    #[test]
    fn matching_is_exact() {
        let credential = issue(CredentialKind::Verification, Utc::now(), Duration::days(7));
        assert!(matches(&credential.token, &credential.token));
        assert!(!matches(&credential.token, "hv_guess"));
    }
}
