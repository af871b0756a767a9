//! Approval secret generation, normalization, and hashing.
//!
//! Two secrets are issued per pending device: a 256-bit URL-safe token for
//! the email link, and a short human code for manual entry. Only one-way
//! hashes are stored; the raw values are returned once to the caller for
//! out-of-band delivery.

use anyhow::{Context, Result};
use base64::Engine;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

/// Uppercase alphanumerics minus the visually ambiguous `0 O I L 1`.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Code length excluding the display hyphen (`XXXX-XXXX`).
pub const CODE_LENGTH: usize = 8;

const TOKEN_BYTES: usize = 32;

/// Create a new approval token for email links.
///
/// The returned value is only handed to the notifier; storage sees its hash.
///
/// # Errors
/// Returns an error if the system random source fails.
pub(crate) fn generate_approval_token() -> Result<String> {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate approval token")?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// Create a new human approval code, formatted `XXXX-XXXX`.
///
/// Characters are drawn by rejection sampling so every alphabet position is
/// equally likely.
///
/// # Errors
/// Returns an error if the system random source fails.
pub(crate) fn generate_approval_code() -> Result<String> {
    let mut chars = Vec::with_capacity(CODE_LENGTH);
    let mut buf = [0u8; 16];
    // Largest multiple of the alphabet size that fits in a byte; bytes at or
    // above it would bias the modulo and are discarded.
    #[allow(clippy::cast_possible_truncation)]
    let limit = (256 / CODE_ALPHABET.len() * CODE_ALPHABET.len()) as u8;

    while chars.len() < CODE_LENGTH {
        OsRng
            .try_fill_bytes(&mut buf)
            .context("failed to generate approval code")?;
        for byte in buf {
            if byte < limit {
                chars.push(CODE_ALPHABET[usize::from(byte) % CODE_ALPHABET.len()]);
                if chars.len() == CODE_LENGTH {
                    break;
                }
            }
        }
    }

    let code = String::from_utf8(chars).context("approval code alphabet is ascii")?;
    Ok(format!("{}-{}", &code[..4], &code[4..]))
}

/// Canonical form used for hashing and comparison: hyphens and whitespace
/// stripped, uppercased.
#[must_use]
pub fn normalize_code(code: &str) -> String {
    code.chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Hash an approval secret so raw values never touch the database.
#[must_use]
pub fn hash_secret(value: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hasher.finalize().to_vec()
}

/// Hash a human code in its canonical form.
#[must_use]
pub fn hash_code(code: &str) -> Vec<u8> {
    hash_secret(&normalize_code(code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    #[test]
    fn token_decodes_to_256_bits() {
        let token = generate_approval_token().unwrap();
        let bytes = URL_SAFE_NO_PAD.decode(token.as_bytes()).unwrap();
        assert_eq!(bytes.len(), 32);
    }

    #[test]
    fn tokens_are_unique() {
        let first = generate_approval_token().unwrap();
        let second = generate_approval_token().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn code_is_formatted_and_unambiguous() {
        for _ in 0..32 {
            let code = generate_approval_code().unwrap();
            assert_eq!(code.len(), 9);
            assert_eq!(&code[4..5], "-");
            for c in code.chars().filter(|&c| c != '-') {
                assert!(
                    CODE_ALPHABET.contains(&(c as u8)),
                    "unexpected character {c} in {code}"
                );
                assert!(!"0OIL1".contains(c), "ambiguous character {c} in {code}");
            }
        }
    }

    #[test]
    fn normalize_strips_hyphens_and_uppercases() {
        assert_eq!(normalize_code("ab12-cd34"), "AB12CD34");
        assert_eq!(normalize_code("AB12CD34"), "AB12CD34");
        assert_eq!(normalize_code(" AB12-CD34 "), "AB12CD34");
    }

    #[test]
    fn equivalent_code_spellings_hash_identically() {
        let generated = generate_approval_code().unwrap();
        let stripped = generated.replace('-', "").to_lowercase();
        assert_eq!(hash_code(&generated), hash_code(&stripped));
    }

    #[test]
    fn hash_is_stable_and_discriminating() {
        assert_eq!(hash_secret("token"), hash_secret("token"));
        assert_ne!(hash_secret("token"), hash_secret("other"));
    }
}
