//! Opaque identifiers: code tokens (one per loaded binary) and execution
//! tokens (one per invocation). Both are 36-byte UUID strings so they fit
//! the fixed-size control-plane handshake.

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

/// Byte length of every token on the wire.
pub const TOKEN_LEN: usize = 36;

#[derive(Debug, Error)]
#[error("token must be {TOKEN_LEN} bytes of utf-8")]
pub struct InvalidToken;

macro_rules! token_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub struct $name(String);

        impl $name {
            /// Mint a fresh token.
            pub(crate) fn mint() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Reconstruct a token from raw handshake bytes.
            pub fn from_bytes(bytes: &[u8]) -> Result<Self, InvalidToken> {
                if bytes.len() != TOKEN_LEN {
                    return Err(InvalidToken);
                }
                let s = std::str::from_utf8(bytes).map_err(|_| InvalidToken)?;
                Ok(Self(s.to_owned()))
            }

            #[inline]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

token_type! {
    /// Identifies a loaded binary; minted on load, invalid after delete.
    CodeToken
}

token_type! {
    /// Identifies one invocation; the handle for cancellation.
    ExecutionToken
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_tokens_are_wire_sized() {
        let token = CodeToken::mint();
        assert_eq!(token.as_str().len(), TOKEN_LEN);
        assert_eq!(token.as_str().as_bytes().len(), TOKEN_LEN);
    }

    #[test]
    fn minted_tokens_are_unique() {
        assert_ne!(CodeToken::mint(), CodeToken::mint());
        assert_ne!(ExecutionToken::mint(), ExecutionToken::mint());
    }

    #[test]
    fn round_trips_through_bytes() {
        let token = CodeToken::mint();
        let back = CodeToken::from_bytes(token.as_str().as_bytes()).unwrap();
        assert_eq!(token, back);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(CodeToken::from_bytes(b"too-short").is_err());
    }

    #[test]
    fn rejects_invalid_utf8() {
        let bytes = [0xffu8; TOKEN_LEN];
        assert!(ExecutionToken::from_bytes(&bytes).is_err());
    }
}
