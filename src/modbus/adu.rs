use bytes::{Buf, BufMut, BytesMut};
use nom_derive::{Nom, Parse};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;

/// MBAP header: transaction id, protocol id, length, unit id.
pub const HEADER_LEN: usize = 7;

// unit id + function code
const MIN_LENGTH: u16 = 2;

pub const MAX_DATA_LEN: usize = u16::MAX as usize - MIN_LENGTH as usize;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Nom)]
#[nom(BigEndian)]
pub struct Header {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Byte count of everything following the length field: unit id,
    /// function code and data.
    pub length: u16,
    pub unit_id: u8,
}

impl Header {
    pub fn validate(&self) -> Result<(), Error> {
        if self.protocol_id != 0 {
            return Err(Error::InvalidProtocolId(self.protocol_id));
        }
        if self.length < MIN_LENGTH {
            return Err(Error::InvalidLength(self.length));
        }
        Ok(())
    }

    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u16(self.transaction_id);
        dst.put_u16(self.protocol_id);
        dst.put_u16(self.length);
        dst.put_u8(self.unit_id);
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Adu {
    pub header: Header,
    pub function_code: u8,
    pub data: Vec<u8>,
}

impl Adu {
    pub fn new(transaction_id: u16, unit_id: u8, function_code: u8, data: Vec<u8>) -> Self {
        let length = u16::try_from(data.len() + MIN_LENGTH as usize).unwrap_or(u16::MAX);

        Self {
            header: Header {
                transaction_id,
                protocol_id: 0,
                length,
                unit_id,
            },
            function_code,
            data,
        }
    }

    pub fn transaction_id(&self) -> u16 {
        self.header.transaction_id
    }

    pub fn unit_id(&self) -> u8 {
        self.header.unit_id
    }

    /// Exception responses echo the request's function code with the high bit set.
    pub fn is_exception(&self) -> bool {
        self.function_code & 0x80 != 0
    }

    /// Turns an exception response into `Error::Exception`, passes anything else through.
    pub fn check_exception(self) -> Result<Self, Error> {
        if self.is_exception() {
            return Err(Error::Exception {
                function: self.function_code & 0x7f,
                code: self.data.first().copied().unwrap_or(0),
            });
        }
        Ok(self)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 1 + self.data.len());
        AduCodec.encode(self.clone(), &mut buf)?;
        Ok(buf.to_vec())
    }

    /// Decodes exactly one ADU from a complete buffer. Missing bytes are an
    /// I/O error, the same way a short read on the socket would be.
    pub fn from_bytes(input: &[u8]) -> Result<Self, Error> {
        let mut buf = BytesMut::from(input);
        AduCodec.decode_eof(&mut buf)?.ok_or(Error::ConnectionClosed)
    }
}

/// Frames ADUs on a byte stream. The header's length field is authoritative
/// for how much payload follows; a header failing validation is rejected
/// before waiting for any payload.
#[derive(Clone, Copy, Debug, Default)]
pub struct AduCodec;

impl Decoder for AduCodec {
    type Item = Adu;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Adu>, Error> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let (_, header) = Header::parse(&src[..HEADER_LEN]).map_err(|_| Error::ShortResponse {
            expected: HEADER_LEN,
            actual: src.len(),
        })?;
        header.validate()?;

        // the unit id counted by length is already part of the header
        let frame_len = HEADER_LEN + header.length as usize - 1;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(frame_len);
        frame.advance(HEADER_LEN);
        let function_code = frame.get_u8();

        Ok(Some(Adu {
            header,
            function_code,
            data: frame.to_vec(),
        }))
    }
}

impl Encoder<Adu> for AduCodec {
    type Error = Error;

    fn encode(&mut self, adu: Adu, dst: &mut BytesMut) -> Result<(), Error> {
        if adu.data.len() > MAX_DATA_LEN || adu.header.length as usize != adu.data.len() + 2 {
            return Err(Error::InvalidLength(adu.header.length));
        }
        adu.header.validate()?;

        dst.reserve(HEADER_LEN + 1 + adu.data.len());
        adu.header.encode(dst);
        dst.put_u8(adu.function_code);
        dst.put_slice(&adu.data);

        Ok(())
    }
}
