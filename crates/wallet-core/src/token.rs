//! Cashu token string encoding/decoding. See `spec.md` §4.6 and §6.
//!
//! A token is the ASCII prefix `cashu` followed by base64-encoded JSON. Two
//! wrapper shapes must be accepted on decode: the compact
//! `{mint, proofs: [...]}` form and the legacy `{token: [{mint, proofs}]}`
//! form. Encoding always emits the compact form.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::WalletError;

const TOKEN_PREFIX: &str = "cashu";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireProof {
    secret: String,
    #[serde(rename = "C")]
    c: String,
    amount: u64,
    id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CompactToken {
    mint: String,
    proofs: Vec<WireProof>,
    #[serde(skip_serializing_if = "Option::is_none")]
    memo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LegacyMintEntry {
    mint: String,
    proofs: Vec<WireProof>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LegacyToken {
    token: Vec<LegacyMintEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    memo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit: Option<String>,
}

/// A single proof as carried inside a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenProof {
    pub secret: String,
    pub c: String,
    pub amount: u64,
    pub keyset_id: String,
}

/// The result of [`decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedToken {
    pub mint_url: String,
    pub proofs: Vec<TokenProof>,
    pub memo: Option<String>,
    pub unit: Option<String>,
}

/// Encodes a mint URL and a list of proofs into the compact token form.
pub fn encode(mint_url: &str, proofs: &[TokenProof], memo: Option<String>, unit: Option<String>) -> String {
    let compact = CompactToken {
        mint: mint_url.to_string(),
        proofs: proofs
            .iter()
            .map(|p| WireProof {
                secret: p.secret.clone(),
                c: p.c.clone(),
                amount: p.amount,
                id: p.keyset_id.clone(),
            })
            .collect(),
        memo,
        unit,
    };

    // Serialization of a well-formed struct to JSON never fails.
    let json = serde_json::to_string(&compact).unwrap_or_default();
    format!("{TOKEN_PREFIX}{}", STANDARD_NO_PAD.encode(json))
}

/// Decodes either wrapper shape. Returns [`WalletError::InvalidToken`] if
/// the string is malformed or the decoded structure has no mint URL.
pub fn decode(token_str: &str) -> Result<DecodedToken, WalletError> {
    let body = token_str
        .strip_prefix(TOKEN_PREFIX)
        .ok_or_else(|| WalletError::InvalidToken("missing cashu prefix".to_string()))?;

    let json_bytes = STANDARD_NO_PAD
        .decode(body)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(body))
        .map_err(|e| WalletError::InvalidToken(format!("invalid base64: {e}")))?;

    let json = String::from_utf8(json_bytes)
        .map_err(|e| WalletError::InvalidToken(format!("invalid utf8: {e}")))?;

    if let Ok(compact) = serde_json::from_str::<CompactToken>(&json) {
        if !compact.mint.is_empty() {
            return Ok(DecodedToken {
                mint_url: compact.mint,
                proofs: compact.proofs.into_iter().map(from_wire).collect(),
                memo: compact.memo,
                unit: compact.unit,
            });
        }
    }

    if let Ok(legacy) = serde_json::from_str::<LegacyToken>(&json) {
        let entry = legacy
            .token
            .into_iter()
            .next()
            .ok_or_else(|| WalletError::InvalidToken("legacy token has no mint entries".to_string()))?;

        if entry.mint.is_empty() {
            return Err(WalletError::InvalidToken("missing mint url".to_string()));
        }

        return Ok(DecodedToken {
            mint_url: entry.mint,
            proofs: entry.proofs.into_iter().map(from_wire).collect(),
            memo: legacy.memo,
            unit: legacy.unit,
        });
    }

    Err(WalletError::InvalidToken("unrecognized token wrapper shape".to_string()))
}

fn from_wire(w: WireProof) -> TokenProof {
    TokenProof {
        secret: w.secret,
        c: w.c,
        amount: w.amount,
        keyset_id: w.id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_proofs() -> Vec<TokenProof> {
        vec![
            TokenProof {
                secret: "s1".into(),
                c: "c1".into(),
                amount: 4,
                keyset_id: "k1".into(),
            },
            TokenProof {
                secret: "s2".into(),
                c: "c2".into(),
                amount: 8,
                keyset_id: "k1".into(),
            },
        ]
    }

    #[test]
    fn encode_decode_round_trip_is_identity_on_mint_and_proofs() {
        let proofs = sample_proofs();
        let encoded = encode("https://mint.example", &proofs, Some("memo".into()), Some("sat".into()));
        let decoded = decode(&encoded).expect("decodes");

        assert_eq!(decoded.mint_url, "https://mint.example");
        assert_eq!(decoded.proofs, proofs);
        assert_eq!(decoded.memo.as_deref(), Some("memo"));
    }

    #[test]
    fn decodes_legacy_wrapper_shape() {
        let legacy = LegacyToken {
            token: vec![LegacyMintEntry {
                mint: "https://mint.example".to_string(),
                proofs: vec![WireProof {
                    secret: "s1".into(),
                    c: "c1".into(),
                    amount: 2,
                    id: "k1".into(),
                }],
            }],
            memo: None,
            unit: None,
        };
        let json = serde_json::to_string(&legacy).expect("serialize");
        let encoded = format!("{TOKEN_PREFIX}{}", STANDARD_NO_PAD.encode(json));

        let decoded = decode(&encoded).expect("decodes legacy form");
        assert_eq!(decoded.mint_url, "https://mint.example");
        assert_eq!(decoded.proofs.len(), 1);
    }

    #[test]
    fn rejects_missing_prefix() {
        assert!(decode("not-a-token").is_err());
    }

    #[test]
    fn rejects_token_without_mint_url() {
        let broken = r#"{"proofs":[]}"#;
        let encoded = format!("{TOKEN_PREFIX}{}", STANDARD_NO_PAD.encode(broken));
        assert!(decode(&encoded).is_err());
    }
}
