/*!
 * # Password Module
 *
 * Password strength rules for registration and argon2 hashing.
 */

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use thiserror::Error;

use crate::errors::ServiceError;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PasswordPolicyError {
    #[error("password too short: minimum {min_length} characters required")]
    TooShort { min_length: usize },

    #[error("password too long: maximum {max_length} characters allowed")]
    TooLong { max_length: usize },

    #[error("password must contain at least one uppercase letter")]
    MissingUppercase,

    #[error("password must contain at least one lowercase letter")]
    MissingLowercase,

    #[error("password must contain at least one number")]
    MissingNumber,
}

#[derive(Debug, Clone)]
pub struct PasswordPolicy {
    pub min_length: usize,
    pub max_length: usize,
    pub require_uppercase: bool,
    pub require_lowercase: bool,
    pub require_numbers: bool,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: 8,
            max_length: 128,
            require_uppercase: true,
            require_lowercase: true,
            require_numbers: true,
        }
    }
}

impl PasswordPolicy {
    /// Validate a password against the policy
    pub fn validate(&self, password: &str) -> Result<(), PasswordPolicyError> {
        let length = password.chars().count();
        if length < self.min_length {
            return Err(PasswordPolicyError::TooShort {
                min_length: self.min_length,
            });
        }
        if length > self.max_length {
            return Err(PasswordPolicyError::TooLong {
                max_length: self.max_length,
            });
        }

        if self.require_uppercase && !password.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(PasswordPolicyError::MissingUppercase);
        }
        if self.require_lowercase && !password.chars().any(|c| c.is_ascii_lowercase()) {
            return Err(PasswordPolicyError::MissingLowercase);
        }
        if self.require_numbers && !password.chars().any(|c| c.is_ascii_digit()) {
            return Err(PasswordPolicyError::MissingNumber);
        }

        Ok(())
    }
}

/// Hashes a password into a PHC string
pub fn hash_password(password: &str) -> Result<String, ServiceError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ServiceError::HashError(e.to_string()))
}

/// Checks a password against a stored PHC string
pub fn verify_password(password: &str, stored: &str) -> Result<bool, ServiceError> {
    let parsed = PasswordHash::new(stored).map_err(|e| ServiceError::HashError(e.to_string()))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("Sh0rt", PasswordPolicyError::TooShort { min_length: 8 })]
    #[case("alllowercase1", PasswordPolicyError::MissingUppercase)]
    #[case("ALLUPPERCASE1", PasswordPolicyError::MissingLowercase)]
    #[case("NoDigitsHere", PasswordPolicyError::MissingNumber)]
    fn weak_passwords_are_rejected(#[case] password: &str, #[case] expected: PasswordPolicyError) {
        assert_eq!(PasswordPolicy::default().validate(password), Err(expected));
    }

    #[test]
    fn overlong_passwords_are_rejected() {
        let password = format!("Aa1{}", "x".repeat(126));
        assert_eq!(
            PasswordPolicy::default().validate(&password),
            Err(PasswordPolicyError::TooLong { max_length: 128 })
        );
    }

    #[test]
    fn reasonable_password_passes() {
        assert!(PasswordPolicy::default().validate("Harvest2024").is_ok());
    }

    #[test]
    fn hash_verifies_only_the_original() {
        let hash = hash_password("Harvest2024").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("Harvest2024", &hash).unwrap());
        assert!(!verify_password("harvest2024", &hash).unwrap());
    }
}
