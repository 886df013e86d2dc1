//! Wire format for the document transfer protocol.
//!
//! - **protocol**: header types, field widths, name validation
//! - **codec**: fixed-width header codecs and stream helpers

pub mod codec;
pub mod protocol;

pub use codec::{
    ClientCodec, TransferCodec, read_request, read_response_header, write_response_header,
};
pub use protocol::{
    NAME_FIELD_LEN, ProtocolError, REQUEST_HEADER_LEN, ResponseHeader, SIZE_FIELD_LEN,
    TransferRequest, validate_name,
};
