//! Credential lookup, injected by the host.

/// Supplies the current bearer credential.
///
/// Called on every open, so a rotated credential is picked up on the next
/// reconnect. Implementations must be cheap and non-blocking.
pub trait CredentialProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

impl<F> CredentialProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn bearer_token(&self) -> Option<String> {
        self()
    }
}

/// A fixed credential.
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

impl CredentialProvider for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Strips an auth scheme prefix (`Bearer `, case-insensitive) and surrounding
/// whitespace. Returns `None` for an empty credential.
pub(crate) fn bare_token(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let token = match trimmed.split_once(char::is_whitespace) {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim_start(),
        None if trimmed.eq_ignore_ascii_case("bearer") => "",
        _ => trimmed,
    };
    (!token.is_empty()).then(|| token.to_string())
}
