//! Just enough DER to read OCSP requests and write OCSP responses.
//!
//! Only single byte tags and definite lengths are supported, which is all
//! RFC 6960 messages use.

use crate::commons::error::{CaResult, Error};

pub const INTEGER: u8 = 0x02;
pub const BIT_STRING: u8 = 0x03;
pub const OCTET_STRING: u8 = 0x04;
pub const ENUMERATED: u8 = 0x0A;
pub const GENERALIZED_TIME: u8 = 0x18;
pub const SEQUENCE: u8 = 0x30;

/// The tag of an explicitly tagged, context specific value.
pub const fn explicit(n: u8) -> u8 {
    0xA0 | n
}

/// The tag of an implicitly tagged, primitive context specific value.
pub const fn implicit(n: u8) -> u8 {
    0x80 | n
}

//------------ Tlv -----------------------------------------------------------

/// One encoded value.
#[derive(Clone, Copy, Debug)]
pub struct Tlv<'a> {
    pub tag: u8,
    pub content: &'a [u8],

    /// The complete encoding, tag and length included.
    pub raw: &'a [u8],
}

impl<'a> Tlv<'a> {
    /// Reads the content as a sequence of values.
    pub fn reader(&self) -> Reader<'a> {
        Reader::new(self.content)
    }
}

//------------ Reader --------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Reader { data }
    }

    pub fn peek_tag(&self) -> Option<u8> {
        self.data.first().copied()
    }

    pub fn read(&mut self) -> CaResult<Tlv<'a>> {
        let data = self.data;
        let (&tag, rest) = data.split_first().ok_or_else(|| malformed("unexpected end of data"))?;
        if tag & 0x1F == 0x1F {
            return Err(malformed("multi byte tags are not supported"));
        }
        let (&first, mut rest) = rest.split_first().ok_or_else(|| malformed("missing length"))?;

        let len = if first < 0x80 {
            usize::from(first)
        } else {
            let count = usize::from(first & 0x7F);
            if count == 0 || count > 4 || rest.len() < count {
                return Err(malformed("unsupported length"));
            }
            let (len_bytes, after) = rest.split_at(count);
            rest = after;
            len_bytes.iter().fold(0usize, |acc, b| (acc << 8) | usize::from(*b))
        };

        if rest.len() < len {
            return Err(malformed("value exceeds the available data"));
        }
        let header = data.len() - rest.len();
        let raw = &data[..header + len];
        self.data = &data[header + len..];
        Ok(Tlv {
            tag,
            content: &rest[..len],
            raw,
        })
    }

    /// Reads the next value, which must carry `tag`.
    pub fn expect(&mut self, tag: u8) -> CaResult<Tlv<'a>> {
        let tlv = self.read()?;
        if tlv.tag != tag {
            return Err(malformed(format!("expected tag {:#04x}, found {:#04x}", tag, tlv.tag)));
        }
        Ok(tlv)
    }

    /// Skips the next value if it carries `tag`.
    pub fn skip_if(&mut self, tag: u8) -> CaResult<()> {
        if self.peek_tag() == Some(tag) {
            self.read()?;
        }
        Ok(())
    }

    /// Fails if anything is left.
    pub fn finish(&self) -> CaResult<()> {
        if self.data.is_empty() {
            Ok(())
        } else {
            Err(malformed("trailing data"))
        }
    }
}

fn malformed(msg: impl std::fmt::Display) -> Error {
    Error::parse("DER", msg)
}

//------------ Writing -------------------------------------------------------

/// Encodes a value with the given tag.
pub fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut res = Vec::with_capacity(content.len() + 6);
    res.push(tag);
    let len = content.len();
    if len < 0x80 {
        res.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        res.push(0x80 | (bytes.len() - skip) as u8);
        res.extend_from_slice(&bytes[skip..]);
    }
    res.extend_from_slice(content);
    res
}

/// Encodes a sequence of already encoded values.
pub fn sequence(parts: &[&[u8]]) -> Vec<u8> {
    constructed(SEQUENCE, parts)
}

pub fn constructed(tag: u8, parts: &[&[u8]]) -> Vec<u8> {
    tlv(tag, &parts.concat())
}

pub fn octet_string(content: &[u8]) -> Vec<u8> {
    tlv(OCTET_STRING, content)
}

/// A bit string without unused bits.
pub fn bit_string(content: &[u8]) -> Vec<u8> {
    let mut bits = Vec::with_capacity(content.len() + 1);
    bits.push(0);
    bits.extend_from_slice(content);
    tlv(BIT_STRING, &bits)
}

pub fn enumerated(value: u8) -> Vec<u8> {
    tlv(ENUMERATED, &[value])
}

/// Encodes a time as `YYYYMMDDHHMMSSZ`.
pub fn generalized_time(time: &chrono::DateTime<chrono::Utc>) -> Vec<u8> {
    tlv(GENERALIZED_TIME, time.format("%Y%m%d%H%M%SZ").to_string().as_bytes())
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_lengths() {
        let content = vec![7u8; 300];
        let encoded = tlv(OCTET_STRING, &content);
        assert_eq!(&encoded[..4], &[0x04, 0x82, 0x01, 0x2C]);

        let mut reader = Reader::new(&encoded);
        let read = reader.expect(OCTET_STRING).unwrap();
        assert_eq!(read.content, content.as_slice());
        assert_eq!(read.raw, encoded.as_slice());
        reader.finish().unwrap();
    }

    #[test]
    fn nested_values() {
        let inner = sequence(&[&enumerated(1), &octet_string(b"ab")]);
        let outer = constructed(explicit(0), &[&inner]);

        let mut reader = Reader::new(&outer);
        let tagged = reader.expect(explicit(0)).unwrap();
        let mut seq = tagged.reader().expect(SEQUENCE).unwrap().reader();
        seq.skip_if(ENUMERATED).unwrap();
        assert_eq!(seq.expect(OCTET_STRING).unwrap().content, b"ab");
        seq.finish().unwrap();
    }

    #[test]
    fn truncated_data_is_refused() {
        assert!(Reader::new(&[0x30, 0x05, 0x01]).read().is_err());
        assert!(Reader::new(&[0x30]).read().is_err());
        assert!(Reader::new(&[0x04, 0x01, 0x00]).expect(SEQUENCE).is_err());
        assert!(Reader::new(&[0x04, 0x00, 0x00]).finish().is_err());
    }
}
