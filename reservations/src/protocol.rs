//! Booking protocols: the six-character references residents quote at the
//! gate ("AB12CD").

use crate::error::Rejection;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, PoisonError};

/// Number of characters in a protocol
pub const PROTOCOL_LENGTH: usize = 6;

/// Characters a protocol is drawn from
pub const PROTOCOL_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Validated, uppercase booking reference
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Protocol(String);

impl Protocol {
    /// Normalise user input (trim, uppercase) and validate it.
    ///
    /// # Errors
    ///
    /// Returns [`Rejection::InvalidProtocol`] unless the input is six
    /// characters from `A-Z0-9` after normalisation.
    pub fn parse(input: &str) -> Result<Self, Rejection> {
        let normalised = input.trim().to_ascii_uppercase();
        let valid = normalised.len() == PROTOCOL_LENGTH
            && normalised.bytes().all(|b| PROTOCOL_ALPHABET.contains(&b));
        if valid {
            Ok(Self(normalised))
        } else {
            Err(Rejection::InvalidProtocol {
                input: input.to_string(),
            })
        }
    }

    /// The protocol text
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Protocol {
    type Error = Rejection;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Protocol> for String {
    fn from(protocol: Protocol) -> Self {
        protocol.0
    }
}

/// Source of candidate protocols
///
/// Uniqueness is not the generator's job: the manager retries candidates
/// until storage reports one as unused.
pub trait ProtocolGenerator: Send + Sync {
    /// Produce a candidate protocol
    fn generate(&self) -> Protocol;
}

/// Uniformly random protocols
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomProtocols;

impl ProtocolGenerator for RandomProtocols {
    fn generate(&self) -> Protocol {
        let mut rng = rand::thread_rng();
        let text = (0..PROTOCOL_LENGTH)
            .map(|_| char::from(PROTOCOL_ALPHABET[rng.gen_range(0..PROTOCOL_ALPHABET.len())]))
            .collect();
        Protocol(text)
    }
}

/// Hands out a fixed sequence first, then falls back to random protocols.
///
/// Lets scenarios pin the protocol a booking receives ("AB12CD") and
/// exercise collision retries.
#[derive(Debug, Default)]
pub struct ScriptedProtocols {
    queue: Mutex<VecDeque<Protocol>>,
}

impl ScriptedProtocols {
    /// Queue `protocols` to be handed out in order
    #[must_use]
    pub fn new(protocols: impl IntoIterator<Item = Protocol>) -> Self {
        Self {
            queue: Mutex::new(protocols.into_iter().collect()),
        }
    }

    /// Append a protocol to the queue
    pub fn push(&self, protocol: Protocol) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(protocol);
    }
}

impl ProtocolGenerator for ScriptedProtocols {
    fn generate(&self) -> Protocol {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| RandomProtocols.generate())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_normalises_case_and_whitespace() {
        assert_eq!(Protocol::parse("  ab12cd ").unwrap().as_str(), "AB12CD");
    }

    #[test]
    fn parse_rejects_wrong_length_and_symbols() {
        assert!(Protocol::parse("AB12C").is_err());
        assert!(Protocol::parse("AB12CDE").is_err());
        assert!(Protocol::parse("AB-2CD").is_err());
        assert!(Protocol::parse("ÁB12CD").is_err());
    }

    #[test]
    fn scripted_then_random() {
        let scripted = ScriptedProtocols::new([Protocol::parse("AAAAAA").unwrap()]);
        assert_eq!(scripted.generate().as_str(), "AAAAAA");
        let fallback = scripted.generate();
        assert!(Protocol::parse(fallback.as_str()).is_ok());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn random_protocols_are_well_formed(_seed in any::<u8>()) {
            let protocol = RandomProtocols.generate();
            prop_assert_eq!(protocol.as_str().len(), PROTOCOL_LENGTH);
            prop_assert!(Protocol::parse(protocol.as_str()).is_ok());
        }

        #[test]
        fn lookup_is_case_insensitive(text in "[A-Z0-9]{6}") {
            let upper = Protocol::parse(&text).unwrap();
            let lower = Protocol::parse(&format!(" {} ", text.to_lowercase())).unwrap();
            prop_assert_eq!(upper, lower);
        }
    }
}
