//! Header types for the document transfer protocol.
//!
//! Per connection:
//! - **Request**: `name` field ([`NAME_FIELD_LEN`] bytes), `size` field
//!   ([`SIZE_FIELD_LEN`] bytes of ASCII decimal), then `size` raw payload bytes
//! - **Response**: `size` field ([`SIZE_FIELD_LEN`] bytes of ASCII decimal), then
//!   exactly that many bytes of the converted document
//!
//! Fields carry no terminator. Text shorter than its field is NUL-padded, and
//! receivers stop at the first NUL.

use std::fmt;

/// Width of the client-supplied document name field.
pub const NAME_FIELD_LEN: usize = 256;

/// Width of every decimal size field, request and response alike.
pub const SIZE_FIELD_LEN: usize = 32;

/// Bytes a request header occupies on the wire.
pub const REQUEST_HEADER_LEN: usize = NAME_FIELD_LEN + SIZE_FIELD_LEN;

/// Errors raised while reading or validating a request header.
///
/// Any of these aborts the connection it happened on, and nothing else.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to read request header: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed before the name field was complete")]
    ShortName,

    #[error("connection closed before the size field was complete")]
    ShortSize,

    #[error("timed out waiting for the request header")]
    Timeout,

    #[error("invalid document name: {reason}")]
    InvalidName { reason: &'static str },

    #[error("size field is not a decimal integer: {text:?}")]
    InvalidSize { text: String },

    #[error("size must be positive, got {size}")]
    NonPositiveSize { size: i64 },

    #[error("response size must not be negative, got {size}")]
    NegativeSize { size: i64 },

    #[error("declared size {size} exceeds the limit of {limit} bytes")]
    PayloadTooLarge { size: u64, limit: u64 },
}

/// A validated request header.
///
/// `name` has already passed [`validate_name`], so it is safe to embed in a
/// single path component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub name: String,
    pub size: u64,
}

impl TransferRequest {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }
}

impl fmt::Display for TransferRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.name, self.size)
    }
}

/// Header preceding the converted document in a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub size: u64,
}

/// Check that a client-supplied name can become one path component.
///
/// The name is concatenated into artifact file names, so anything that could
/// escape the work directory or confuse a shell-less argv is rejected rather
/// than rewritten.
pub fn validate_name(name: &str) -> Result<(), ProtocolError> {
    let reason = if name.is_empty() {
        "empty"
    } else if name.len() > NAME_FIELD_LEN {
        "longer than the name field"
    } else if name == "." || name == ".." {
        "relative path component"
    } else if name.contains(['/', '\\']) {
        "contains a path separator"
    } else if name.chars().any(char::is_control) {
        "contains control characters"
    } else {
        return Ok(());
    };
    Err(ProtocolError::InvalidName { reason })
}

/// Text of a fixed-width field up to its first NUL.
pub(crate) fn field_text(field: &[u8]) -> &[u8] {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    &field[..end]
}

/// Decode the name field.
pub(crate) fn parse_name(field: &[u8]) -> Result<String, ProtocolError> {
    let text = std::str::from_utf8(field_text(field)).map_err(|_| ProtocolError::InvalidName {
        reason: "not valid UTF-8",
    })?;
    validate_name(text)?;
    Ok(text.to_string())
}

/// Decode a request size field as a base-10 integer that must be positive.
pub(crate) fn parse_size(field: &[u8]) -> Result<u64, ProtocolError> {
    let size = parse_decimal(field)?;
    if size <= 0 {
        return Err(ProtocolError::NonPositiveSize { size });
    }
    Ok(size as u64)
}

/// Decode a response size field. An empty document is a valid response, so
/// 0 is accepted here.
pub(crate) fn parse_response_size(field: &[u8]) -> Result<u64, ProtocolError> {
    let size = parse_decimal(field)?;
    u64::try_from(size).map_err(|_| ProtocolError::NegativeSize { size })
}

fn parse_decimal(field: &[u8]) -> Result<i64, ProtocolError> {
    let text = String::from_utf8_lossy(field_text(field));
    let trimmed = text.trim();
    trimmed.parse().map_err(|_| ProtocolError::InvalidSize {
        text: trimmed.to_string(),
    })
}

/// Write `value` as left-aligned decimal text, NUL-padded to `field.len()`.
pub(crate) fn fill_size_field(field: &mut [u8], value: u64) {
    let text = value.to_string();
    field.fill(0);
    field[..text.len()].copy_from_slice(text.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn padded(text: &str, width: usize) -> Vec<u8> {
        let mut field = vec![0u8; width];
        field[..text.len()].copy_from_slice(text.as_bytes());
        field
    }

    #[test]
    fn name_stops_at_first_nul() {
        let field = padded("report.txt", NAME_FIELD_LEN);
        assert_eq!(parse_name(&field).unwrap(), "report.txt");
    }

    #[test]
    fn name_may_fill_the_whole_field() {
        let name = "a".repeat(NAME_FIELD_LEN);
        assert_eq!(parse_name(name.as_bytes()).unwrap(), name);
    }

    #[test]
    fn path_hostile_names_are_rejected() {
        for name in ["", ".", "..", "../etc/passwd", "a/b", "a\\b", "tab\there"] {
            assert!(
                matches!(validate_name(name), Err(ProtocolError::InvalidName { .. })),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn dotted_names_without_separators_are_fine() {
        validate_name("..report").unwrap();
        validate_name("my report v2.txt").unwrap();
    }

    #[test]
    fn non_utf8_name_is_rejected() {
        let mut field = padded("abc", NAME_FIELD_LEN);
        field[1] = 0xff;
        assert!(matches!(
            parse_name(&field),
            Err(ProtocolError::InvalidName { .. })
        ));
    }

    #[test]
    fn size_parses_decimal_text() {
        assert_eq!(parse_size(&padded("13", SIZE_FIELD_LEN)).unwrap(), 13);
        assert_eq!(parse_size(&padded(" 42 ", SIZE_FIELD_LEN)).unwrap(), 42);
    }

    #[test]
    fn zero_and_negative_sizes_are_rejected() {
        assert!(matches!(
            parse_size(&padded("0", SIZE_FIELD_LEN)),
            Err(ProtocolError::NonPositiveSize { size: 0 })
        ));
        assert!(matches!(
            parse_size(&padded("-5", SIZE_FIELD_LEN)),
            Err(ProtocolError::NonPositiveSize { size: -5 })
        ));
    }

    #[test]
    fn response_size_allows_zero() {
        assert_eq!(parse_response_size(&padded("0", SIZE_FIELD_LEN)).unwrap(), 0);
        assert_eq!(parse_response_size(&padded("18", SIZE_FIELD_LEN)).unwrap(), 18);
        assert!(matches!(
            parse_response_size(&padded("-1", SIZE_FIELD_LEN)),
            Err(ProtocolError::NegativeSize { size: -1 })
        ));
        assert!(matches!(
            parse_response_size(&padded("abc", SIZE_FIELD_LEN)),
            Err(ProtocolError::InvalidSize { .. })
        ));
    }

    #[test]
    fn non_numeric_size_is_rejected() {
        for text in ["", "abc", "12abc", "0x10"] {
            assert!(
                matches!(
                    parse_size(&padded(text, SIZE_FIELD_LEN)),
                    Err(ProtocolError::InvalidSize { .. })
                ),
                "{text:?} should be rejected"
            );
        }
    }

    #[test]
    fn size_field_is_nul_padded() {
        let mut field = [0xaau8; SIZE_FIELD_LEN];
        fill_size_field(&mut field, 1234);
        assert_eq!(&field[..4], b"1234");
        assert!(field[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn error_messages() {
        insta::assert_snapshot!(
            ProtocolError::NonPositiveSize { size: 0 },
            @"size must be positive, got 0"
        );
        insta::assert_snapshot!(
            ProtocolError::InvalidName { reason: "contains a path separator" },
            @"invalid document name: contains a path separator"
        );
    }
}
