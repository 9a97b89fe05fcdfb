use bytes::{Buf, BufMut};

use crate::codec::varint::{VarIntBuf, VarIntBufMut};
use crate::error::CodecError;

/// SHA-512 digest length
pub const DIGEST_LEN: usize = 64;

pub type Digest = [u8; DIGEST_LEN];

const ID_REQUEST_HASH: u64 = 0;
const ID_REQUEST_CHUNK: u64 = 1;
const ID_STOP: u64 = 2;
const ID_START: u64 = 3;

const ID_HASH: u64 = 0;
const ID_CHUNK: u64 = 1;
const ID_START_ACK: u64 = 3;

/// Messages from the requester to the responder
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BlobRequest {
    RequestHash,
    /// the byte range `[start, end)` of the blob
    RequestChunk { start: u64, end: u64 },
    Stop,
    /// (Re)starts the transfer. Repeating a start with the same nonce has no effect.
    Start { nonce: u64 },
}

impl BlobRequest {
    pub fn id(&self) -> u64 {
        match self {
            BlobRequest::RequestHash => ID_REQUEST_HASH,
            BlobRequest::RequestChunk { .. } => ID_REQUEST_CHUNK,
            BlobRequest::Stop => ID_STOP,
            BlobRequest::Start { .. } => ID_START,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_varuint(self.id());
        match *self {
            BlobRequest::RequestChunk { start, end } => {
                buf.put_varuint(start);
                buf.put_varuint(end);
            }
            BlobRequest::Start { nonce } => buf.put_varuint(nonce),
            BlobRequest::RequestHash | BlobRequest::Stop => {}
        }
    }

    pub fn try_deser(mut buf: &[u8]) -> Result<BlobRequest, CodecError> {
        let result = match buf.try_get_varuint()? {
            ID_REQUEST_HASH => BlobRequest::RequestHash,
            ID_REQUEST_CHUNK => {
                let start = buf.try_get_varuint()?;
                let end = buf.try_get_varuint()?;
                BlobRequest::RequestChunk { start, end }
            }
            ID_STOP => BlobRequest::Stop,
            ID_START => BlobRequest::Start { nonce: buf.try_get_varuint()? },
            id => return Err(CodecError::InvalidTag { what: "blob request", tag: id as i64 }),
        };
        expect_no_trailing_data(buf)?;
        Ok(result)
    }
}

/// Messages from the responder to the requester. Decoding borrows from the received payload.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BlobResponse<'a> {
    Hash { total_size: u64, device_name: &'a str, digest: &'a Digest },
    Chunk { offset: u64, data: &'a [u8] },
    Stop,
    StartAck { nonce: u64 },
}

impl<'a> BlobResponse<'a> {
    pub fn id(&self) -> u64 {
        match self {
            BlobResponse::Hash { .. } => ID_HASH,
            BlobResponse::Chunk { .. } => ID_CHUNK,
            BlobResponse::Stop => ID_STOP,
            BlobResponse::StartAck { .. } => ID_START_ACK,
        }
    }

    /// the encoded size of a chunk response's fixed part, i.e. without the data
    pub fn chunk_overhead(offset: u64) -> usize {
        1 + crate::codec::varint::varuint_len(offset)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_varuint(self.id());
        match *self {
            BlobResponse::Hash { total_size, device_name, digest } => {
                buf.put_varuint(total_size);
                buf.put_string(device_name);
                buf.put_slice(digest);
            }
            BlobResponse::Chunk { offset, data } => {
                buf.put_varuint(offset);
                buf.put_slice(data);
            }
            BlobResponse::StartAck { nonce } => buf.put_varuint(nonce),
            BlobResponse::Stop => {}
        }
    }

    pub fn try_deser(mut buf: &'a [u8]) -> Result<BlobResponse<'a>, CodecError> {
        match buf.try_get_varuint()? {
            ID_HASH => {
                let total_size = buf.try_get_varuint()?;
                let device_name = try_get_str(&mut buf)?;
                let digest = <&Digest>::try_from(buf)
                    .map_err(|_| CodecError::InvalidLength { what: "digest", len: buf.len() })?;
                Ok(BlobResponse::Hash { total_size, device_name, digest })
            }
            ID_CHUNK => {
                let offset = buf.try_get_varuint()?;
                Ok(BlobResponse::Chunk { offset, data: buf })
            }
            ID_STOP => {
                expect_no_trailing_data(buf)?;
                Ok(BlobResponse::Stop)
            }
            ID_START_ACK => {
                let nonce = buf.try_get_varuint()?;
                expect_no_trailing_data(buf)?;
                Ok(BlobResponse::StartAck { nonce })
            }
            id => Err(CodecError::InvalidTag { what: "blob response", tag: id as i64 }),
        }
    }
}

fn try_get_str<'a>(buf: &mut &'a [u8]) -> Result<&'a str, CodecError> {
    let len = buf.try_get_varuint()?;
    if (buf.len() as u64) < len {
        return Err(CodecError::NotEnoughData);
    }
    let (raw, rest) = buf.split_at(len as usize);
    *buf = rest;
    Ok(std::str::from_utf8(raw)?)
}

fn expect_no_trailing_data(buf: &[u8]) -> Result<(), CodecError> {
    if buf.has_remaining() {
        return Err(CodecError::TrailingData(buf.remaining()));
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::request_hash(BlobRequest::RequestHash, vec![0])]
    #[case::request_chunk(BlobRequest::RequestChunk { start: 200, end: 1000 }, vec![1, 200, 243, 248])]
    #[case::stop(BlobRequest::Stop, vec![2])]
    #[case::start(BlobRequest::Start { nonce: 7 }, vec![3, 7])]
    fn test_request_ser(#[case] request: BlobRequest, #[case] expected: Vec<u8>) {
        let mut buf = Vec::new();
        request.ser(&mut buf);
        assert_eq!(buf, expected);
        assert_eq!(BlobRequest::try_deser(&buf), Ok(request));
    }

    #[rstest]
    #[case::empty(vec![], CodecError::NotEnoughData)]
    #[case::unknown_tag(vec![9], CodecError::InvalidTag { what: "blob request", tag: 9 })]
    #[case::chunk_without_end(vec![1, 5], CodecError::NotEnoughData)]
    #[case::trailing_bytes(vec![0, 1, 2], CodecError::TrailingData(2))]
    fn test_request_invalid(#[case] data: Vec<u8>, #[case] expected: CodecError) {
        assert_eq!(BlobRequest::try_deser(&data), Err(expected));
    }

    #[test]
    fn test_hash_response() {
        let digest = [0xab; DIGEST_LEN];
        let response = BlobResponse::Hash { total_size: 10_000, device_name: "uav", digest: &digest };

        let mut buf = Vec::new();
        response.ser(&mut buf);
        assert_eq!(&buf[..8], &[0, 249, 30, 32, 3, b'u', b'a', b'v']);
        assert_eq!(buf.len(), 8 + DIGEST_LEN);
        assert_eq!(BlobResponse::try_deser(&buf), Ok(response));
    }

    #[rstest]
    #[case::short_digest(DIGEST_LEN - 1)]
    #[case::long_digest(DIGEST_LEN + 1)]
    fn test_hash_response_digest_length(#[case] digest_len: usize) {
        let mut buf = vec![0, 10, 0];
        buf.extend(std::iter::repeat(1).take(digest_len));
        assert_eq!(BlobResponse::try_deser(&buf), Err(CodecError::InvalidLength { what: "digest", len: digest_len }));
    }

    #[test]
    fn test_hash_response_invalid_name() {
        let mut buf = vec![0, 10, 2, 0xff, 0xfe];
        buf.extend_from_slice(&[0; DIGEST_LEN]);
        assert!(matches!(BlobResponse::try_deser(&buf), Err(CodecError::InvalidString(_))));
    }

    #[rstest]
    #[case::chunk(BlobResponse::Chunk { offset: 300, data: &[1, 2, 3] }, vec![1, 241, 60, 1, 2, 3])]
    #[case::empty_chunk(BlobResponse::Chunk { offset: 0, data: &[] }, vec![1, 0])]
    #[case::stop(BlobResponse::Stop, vec![2])]
    #[case::start_ack(BlobResponse::StartAck { nonce: 1000 }, vec![3, 243, 248])]
    fn test_response_ser(#[case] response: BlobResponse, #[case] expected: Vec<u8>) {
        let mut buf = Vec::new();
        response.ser(&mut buf);
        assert_eq!(buf, expected);
        assert_eq!(BlobResponse::try_deser(&buf), Ok(response));
    }

    #[test]
    fn test_chunk_overhead() {
        assert_eq!(BlobResponse::chunk_overhead(0), 2);
        assert_eq!(BlobResponse::chunk_overhead(300), 3);
    }

    #[test]
    fn test_response_unknown_tag() {
        assert_eq!(BlobResponse::try_deser(&[4]), Err(CodecError::InvalidTag { what: "blob response", tag: 4 }));
    }
}
