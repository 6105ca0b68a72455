//! Deterministic correlation-id and venue client-id derivation.
//!
//! The correlation id is the stable key linking an event to its intent(s) and
//! result(s), and doubles as the venue client order id after normalization.
//! Both derivations are pure functions: equal inputs yield equal ids
//! byte-for-byte, so retries and restarts converge on the same key and the
//! venue's duplicate-client-id check becomes the idempotency backstop.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Maximum client order id length accepted by the execution venue.
pub const VENUE_CLIENT_ID_MAX: usize = 36;

/// Role suffix appended to the two intents of a FLIP split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentRole {
    Close,
    Open,
}

impl IntentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentRole::Close => "close",
            IntentRole::Open => "open",
        }
    }
}

/// Symbol normalization used inside correlation ids: hyphens become
/// underscores so the id's own `-` separators stay unambiguous.
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.replace('-', "_")
}

/// Derive the correlation id for one event (and optionally one FLIP role).
///
/// Format: `hl-{tx_hash}-{event_index}-{symbol_normalized}[-{role}]`.
pub fn correlation_id(
    tx_hash: &str,
    event_index: u64,
    symbol: &str,
    role: Option<IntentRole>,
) -> String {
    let base = format!(
        "hl-{}-{}-{}",
        tx_hash,
        event_index,
        normalize_symbol(symbol)
    );
    match role {
        Some(r) => format!("{}-{}", base, r.as_str()),
        None => base,
    }
}

/// Normalize a correlation id into a venue-acceptable client order id.
///
/// Characters outside `[A-Za-z0-9_-]` are dropped. Ids longer than
/// [`VENUE_CLIENT_ID_MAX`] are squeezed to a 20-char prefix plus a 16-hex
/// digest of the full id, keeping the mapping injective in practice while
/// staying deterministic.
pub fn venue_client_id(correlation_id: &str) -> String {
    let cleaned: String = correlation_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();

    if cleaned.len() <= VENUE_CLIENT_ID_MAX {
        return cleaned;
    }

    let digest = Sha256::digest(correlation_id.as_bytes());
    let tail = hex::encode(&digest[..8]);
    format!("{}{}", &cleaned[..VENUE_CLIENT_ID_MAX - 16], tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn plain_id_format() {
        assert_eq!(
            correlation_id("0xabc", 0, "BTCUSDT", None),
            "hl-0xabc-0-BTCUSDT"
        );
    }

    #[test]
    fn flip_roles_suffix() {
        assert_eq!(
            correlation_id("0xabc", 2, "ETHUSDT", Some(IntentRole::Close)),
            "hl-0xabc-2-ETHUSDT-close"
        );
        assert_eq!(
            correlation_id("0xabc", 2, "ETHUSDT", Some(IntentRole::Open)),
            "hl-0xabc-2-ETHUSDT-open"
        );
    }

    #[test]
    fn hyphenated_symbols_are_normalized() {
        assert_eq!(
            correlation_id("0xff", 1, "kPEPE-PERP", None),
            "hl-0xff-1-kPEPE_PERP"
        );
    }

    #[test]
    fn short_ids_pass_through() {
        assert_eq!(venue_client_id("hl-0xabc-0-BTCUSDT"), "hl-0xabc-0-BTCUSDT");
    }

    #[test]
    fn long_ids_are_squeezed_to_cap() {
        let long = correlation_id(
            "0x1111111111111111111111111111111111111111111111111111111111111111",
            7,
            "BTCUSDT",
            Some(IntentRole::Close),
        );
        let id = venue_client_id(&long);
        assert_eq!(id.len(), VENUE_CLIENT_ID_MAX);
        // Deterministic: same input, same output.
        assert_eq!(id, venue_client_id(&long));
    }

    #[test]
    fn distinct_long_ids_stay_distinct() {
        let a = venue_client_id(&correlation_id(
            "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
            0,
            "BTCUSDT",
            None,
        ));
        let b = venue_client_id(&correlation_id(
            "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
            0,
            "BTCUSDT",
            None,
        ));
        assert_ne!(a, b);
    }

    proptest! {
        #[test]
        fn correlation_id_is_pure(
            tx in "0x[0-9a-f]{8,64}",
            idx in 0u64..1000,
            sym in "[A-Z]{2,10}(-PERP)?",
        ) {
            let a = correlation_id(&tx, idx, &sym, None);
            let b = correlation_id(&tx, idx, &sym, None);
            prop_assert_eq!(a, b);
        }

        #[test]
        fn client_id_respects_cap_and_charset(
            tx in "0x[0-9a-f]{8,64}",
            idx in 0u64..1000,
            sym in "[A-Z]{2,10}(-PERP)?",
        ) {
            let id = venue_client_id(&correlation_id(&tx, idx, &sym, Some(IntentRole::Open)));
            prop_assert!(id.len() <= VENUE_CLIENT_ID_MAX);
            prop_assert!(id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        }
    }
}
