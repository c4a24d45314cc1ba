//! Opaque pagination cursor.
//!
//! A [`PageToken`] encodes `{before_id, size}` as base64-wrapped JSON. The
//! empty string is the zero token (no cursor, default page size); the
//! string form is stable, so `parse(format(parse(s))) == parse(s)` for
//! every valid `s` (spec.md §8, property 1).

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::ControllerError;

/// Default page size used when a request and its token both leave the
/// size unset or zero.
pub const DEFAULT_PAGE_SIZE: i32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
struct Wire {
    #[serde(skip_serializing_if = "Option::is_none")]
    before_id: Option<i64>,
    size: i32,
}

/// A decoded pagination cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageToken {
    /// Exclusive cursor marking the boundary of the previous page, if
    /// set. The store's canonical ordering is oldest-first, so this
    /// excludes every row at or before it rather than strictly "before"
    /// in the numeric sense the field's name suggests (spec.md §8
    /// scenario A; name kept verbatim from the spec's wire vocabulary).
    pub before_id: Option<i64>,
    /// Page size carried by the cursor (used when a request omits its own).
    pub size: i32,
}

impl PageToken {
    /// The zero token: no cursor, default size. Formats to the empty string.
    pub fn zero() -> Self {
        PageToken {
            before_id: None,
            size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Parse an opaque token string. The empty string decodes to
    /// [`PageToken::zero`]; anything else that fails to decode is an
    /// `invalid-argument` validation failure (spec.md §4.5 Phase S step 1).
    pub fn parse(token: &str) -> Result<Self, ControllerError> {
        if token.is_empty() {
            return Ok(Self::zero());
        }
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| ControllerError::invalid_argument("malformed page token"))?;
        let wire: Wire = serde_json::from_slice(&bytes)
            .map_err(|_| ControllerError::invalid_argument("malformed page token"))?;
        if wire.size < 0 {
            return Err(ControllerError::invalid_argument("malformed page token"));
        }
        Ok(PageToken {
            before_id: wire.before_id,
            size: if wire.size > 0 {
                wire.size
            } else {
                DEFAULT_PAGE_SIZE
            },
        })
    }

    /// Format back to the opaque wire string. The zero token formats to
    /// the empty string.
    pub fn format(&self) -> String {
        if self.before_id.is_none() && self.size == DEFAULT_PAGE_SIZE {
            return String::new();
        }
        let wire = Wire {
            before_id: self.before_id,
            size: self.size,
        };
        let bytes = serde_json::to_vec(&wire).expect("Wire always serializes");
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Resolve the effective page size: the request's size if positive,
    /// otherwise the token's size (spec.md §4.5 Phase S step 2).
    pub fn effective_size(&self, requested: i32) -> i32 {
        if requested > 0 {
            requested
        } else {
            self.size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_string_is_zero_token() {
        let t = PageToken::parse("").unwrap();
        assert_eq!(t, PageToken::zero());
        assert_eq!(t.format(), "");
    }

    #[test]
    fn malformed_token_is_invalid_argument() {
        let err = PageToken::parse("not valid base64!!").unwrap_err();
        assert!(matches!(err, ControllerError::InvalidArgument(_)));
    }

    #[test]
    fn round_trips_non_zero_token() {
        let t = PageToken {
            before_id: Some(42),
            size: 10,
        };
        let s = t.format();
        assert!(!s.is_empty());
        let parsed = PageToken::parse(&s).unwrap();
        assert_eq!(parsed, t);
    }

    proptest! {
        #[test]
        fn parse_format_parse_is_identity(before_id in proptest::option::of(any::<i64>()), size in 1i32..10_000) {
            let t = PageToken { before_id, size };
            let s = t.format();
            let parsed = PageToken::parse(&s).unwrap();
            let reformatted = parsed.format();
            let reparsed = PageToken::parse(&reformatted).unwrap();
            prop_assert_eq!(reparsed, parsed);
        }
    }
}
