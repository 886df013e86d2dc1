//! Fixed-width header codecs.
//!
//! [`TransferCodec`] is the server side: it decodes [`TransferRequest`]s and
//! encodes [`ResponseHeader`]s. [`ClientCodec`] is the mirror image.
//!
//! The payload that follows a request header is not framed, so the server never
//! hands the connection to a `FramedRead` (its read buffer would swallow payload
//! bytes). [`read_request`] reads exactly the header width instead and runs the
//! decoder over that buffer.

use std::io;

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder, FramedWrite};

use super::protocol::{
    NAME_FIELD_LEN, ProtocolError, REQUEST_HEADER_LEN, ResponseHeader, SIZE_FIELD_LEN,
    TransferRequest, fill_size_field, parse_name, parse_response_size, parse_size,
};

/// Server-side codec: request headers in, response headers out.
#[derive(Debug, Clone, Copy)]
pub struct TransferCodec {
    max_payload: u64,
}

impl TransferCodec {
    pub fn new(max_payload: u64) -> Self {
        Self { max_payload }
    }
}

impl Default for TransferCodec {
    fn default() -> Self {
        Self::new(u64::MAX)
    }
}

impl Decoder for TransferCodec {
    type Item = TransferRequest;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < REQUEST_HEADER_LEN {
            src.reserve(REQUEST_HEADER_LEN - src.len());
            return Ok(None);
        }

        let header = src.split_to(REQUEST_HEADER_LEN);
        let (name_field, size_field) = header.split_at(NAME_FIELD_LEN);

        let name = parse_name(name_field)?;
        let size = parse_size(size_field)?;
        if size > self.max_payload {
            return Err(ProtocolError::PayloadTooLarge {
                size,
                limit: self.max_payload,
            });
        }

        Ok(Some(TransferRequest { name, size }))
    }
}

impl Encoder<ResponseHeader> for TransferCodec {
    type Error = io::Error;

    fn encode(&mut self, item: ResponseHeader, dst: &mut BytesMut) -> Result<(), Self::Error> {
        put_size_field(dst, item.size);
        tracing::trace!(size = item.size, "Encoded response header");
        Ok(())
    }
}

/// Client-side codec: request headers out, response headers in.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientCodec;

impl Encoder<TransferRequest> for ClientCodec {
    type Error = io::Error;

    fn encode(&mut self, item: TransferRequest, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let name = item.name.as_bytes();
        if name.len() > NAME_FIELD_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "document name longer than the name field",
            ));
        }
        dst.reserve(REQUEST_HEADER_LEN);
        dst.put_slice(name);
        dst.put_bytes(0, NAME_FIELD_LEN - name.len());
        put_size_field(dst, item.size);
        Ok(())
    }
}

impl Decoder for ClientCodec {
    type Item = ResponseHeader;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < SIZE_FIELD_LEN {
            return Ok(None);
        }
        let field = src.split_to(SIZE_FIELD_LEN);
        let size = parse_response_size(&field)?;
        Ok(Some(ResponseHeader { size }))
    }
}

fn put_size_field(dst: &mut BytesMut, size: u64) {
    let mut field = [0u8; SIZE_FIELD_LEN];
    fill_size_field(&mut field, size);
    dst.put_slice(&field);
}

/// Read one request header from `reader`, consuming exactly
/// [`REQUEST_HEADER_LEN`] bytes.
///
/// A stream that ends inside either field yields [`ProtocolError::ShortName`]
/// or [`ProtocolError::ShortSize`].
pub async fn read_request<R>(
    reader: &mut R,
    codec: &mut TransferCodec,
) -> Result<TransferRequest, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::zeroed(REQUEST_HEADER_LEN);
    let (name_field, size_field) = buf.split_at_mut(NAME_FIELD_LEN);

    read_field(reader, name_field, ProtocolError::ShortName).await?;
    read_field(reader, size_field, ProtocolError::ShortSize).await?;

    match codec.decode(&mut buf)? {
        Some(request) => Ok(request),
        // The buffer holds a full header, so the decoder always yields.
        None => Err(ProtocolError::ShortSize),
    }
}

async fn read_field<R>(
    reader: &mut R,
    field: &mut [u8],
    short: ProtocolError,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(field).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(short),
        Err(e) => Err(ProtocolError::Io(e)),
    }
}

/// Write a response header and flush it.
pub async fn write_response_header<W>(writer: &mut W, header: ResponseHeader) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut framed = FramedWrite::new(writer, TransferCodec::default());
    framed.send(header).await?;
    debug_assert!(framed.write_buffer().is_empty());
    Ok(())
}

/// Read a response header on the client side.
pub async fn read_response_header<R>(reader: &mut R) -> Result<ResponseHeader, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::zeroed(SIZE_FIELD_LEN);
    read_field(reader, &mut buf, ProtocolError::ShortSize).await?;
    let header = ClientCodec.decode(&mut buf)?;
    debug_assert!(!buf.has_remaining());
    header.ok_or(ProtocolError::ShortSize)
}
