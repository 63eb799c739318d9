use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use url::Url;

const TOKEN_BYTES: usize = 32;
const CONFIRM_PATH: &str = "/tenance/confirm";

/// A freshly generated one-time token and the hash persisted for it.
pub struct IssuedToken {
    pub token: String,
    pub hash: String,
}

pub fn issue_token() -> IssuedToken {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    let token = URL_SAFE_NO_PAD.encode(bytes);
    let hash = hash_token(&token);
    IssuedToken { token, hash }
}

/// SHA-256 of the token, hex encoded. Only this value is stored.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

pub fn hashes_match(presented: &str, stored: &str) -> bool {
    presented.as_bytes().ct_eq(stored.as_bytes()).into()
}

/// Builds the confirmation link served by the registration portal.
pub fn confirmation_link(
    public_url: &str,
    account_id: &str,
    token: &str,
    domain: &str,
) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(public_url)?.join(CONFIRM_PATH)?;
    url.query_pairs_mut()
        .append_pair("user_id", account_id)
        .append_pair("token", token)
        .append_pair("domain", domain);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_tokens_are_unique_and_hashed() {
        let first = issue_token();
        let second = issue_token();
        assert_ne!(first.token, second.token);
        assert_eq!(first.token.len(), 43);
        assert_eq!(first.hash, hash_token(&first.token));
        assert_eq!(first.hash.len(), 64);
    }

    #[test]
    fn hash_comparison_requires_exact_match() {
        let hash = hash_token("token");
        assert!(hashes_match(&hash, &hash_token("token")));
        assert!(!hashes_match(&hash, &hash_token("other")));
        assert!(!hashes_match(&hash, ""));
    }

    #[test]
    fn link_carries_account_token_and_domain() {
        let url = confirmation_link(
            "https://portal.clinicdesk.test/",
            "01HZX",
            "tok-en",
            "sunriseclinic.local",
        )
        .expect("url");
        assert_eq!(url.path(), "/tenance/confirm");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("user_id".to_string(), "01HZX".to_string()),
                ("token".to_string(), "tok-en".to_string()),
                ("domain".to_string(), "sunriseclinic.local".to_string()),
            ]
        );
    }
}
