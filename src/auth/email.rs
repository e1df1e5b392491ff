//! Account e-mail rules. Login names are e-mail addresses, normalized to
//! trimmed lower case before they are checked or stored.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static EMAIL_SHAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9]([a-zA-Z0-9._-]*[a-zA-Z0-9])?@[a-zA-Z0-9]([a-zA-Z0-9.-]*[a-zA-Z0-9])?\.[a-zA-Z]{2,}$",
    )
    .expect("static e-mail pattern compiles")
});

const ALLOWED_TLDS: &[&str] = &[
    "com", "org", "net", "edu", "gov", "mil", "int", "br", "co", "uk", "us", "ca", "au", "de",
    "fr", "it", "es", "jp", "cn", "in", "io", "dev", "app", "tech", "info", "biz", "name", "pro",
    "xyz", "online", "site", "website", "space", "store", "shop", "blog", "cloud", "email",
    "global", "world", "live", "today",
];

const DISPOSABLE_MARKERS: &[&str] = &[
    "tempmail",
    "throwaway",
    "10minutemail",
    "guerrillamail",
    "mailinator",
    "maildrop",
    "trashmail",
    "yopmail",
    "sharklasers",
    "spam4",
    "temp-mail",
    "fakeinbox",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EmailError {
    #[error("email must be between 5 and 254 characters")]
    Length,
    #[error("email must contain exactly one @")]
    AtSign,
    #[error("email format is invalid")]
    Format,
    #[error("email local part is invalid")]
    LocalPart,
    #[error("email domain is invalid")]
    Domain,
    #[error("email domain extension is not accepted")]
    Tld,
    #[error("disposable email addresses are not accepted")]
    Disposable,
}

/// Trimmed, lower-cased form used for storage and lookups
pub fn normalize(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Checks an already normalized address.
pub fn validate(email: &str) -> Result<(), EmailError> {
    let length = email.chars().count();
    if !(5..=254).contains(&length) {
        return Err(EmailError::Length);
    }

    let mut parts = email.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(EmailError::AtSign);
    };

    if !EMAIL_SHAPE.is_match(email) {
        return Err(EmailError::Format);
    }

    if local.is_empty()
        || local.len() > 64
        || local.contains("..")
        || local.starts_with('.')
        || local.ends_with('.')
    {
        return Err(EmailError::LocalPart);
    }

    if domain.len() < 4 || domain.len() > 253 || !domain.contains('.') || domain.contains("..") {
        return Err(EmailError::Domain);
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels
        .iter()
        .any(|label| label.len() < 2 || label.starts_with('-') || label.ends_with('-'))
    {
        return Err(EmailError::Domain);
    }

    let tld = labels.last().copied().unwrap_or_default();
    if !ALLOWED_TLDS.contains(&tld) {
        return Err(EmailError::Tld);
    }

    if DISPOSABLE_MARKERS.iter().any(|marker| domain.contains(marker)) {
        return Err(EmailError::Disposable);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("joao.silva@fazenda.com.br")]
    #[case("ops-team@agro.io")]
    #[case("a1@farm.co")]
    fn accepts_ordinary_addresses(#[case] email: &str) {
        assert_eq!(validate(email), Ok(()));
    }

    #[rstest]
    #[case("a@b", EmailError::Length)]
    #[case("two@@signs.com", EmailError::AtSign)]
    #[case("no-at-sign.com", EmailError::AtSign)]
    #[case(".lead@farm.com", EmailError::Format)]
    #[case("double..dot@farm.com", EmailError::LocalPart)]
    #[case("user@x.com", EmailError::Domain)]
    #[case("user@farm.zz", EmailError::Tld)]
    #[case("user@mailinator.com", EmailError::Disposable)]
    fn rejects_bad_addresses(#[case] email: &str, #[case] expected: EmailError) {
        assert_eq!(validate(email), Err(expected));
    }

    #[test]
    fn normalization_trims_and_lowercases() {
        assert_eq!(normalize("  Maria@Fazenda.COM "), "maria@fazenda.com");
    }
}
