// BER/DER codec for the LDAP wire protocol (X.690 subset).
// Framing reads one TLV element off the stream; the decoder builds a
// structured value tree; the encoder emits definite-length DER.

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum number of length octets accepted in long-form lengths.
pub const MAX_LENGTH_OCTETS: usize = 4;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("stream closed mid-element")]
    Truncated,
    #[error("indefinite length is not permitted")]
    IndefiniteLength,
    #[error("length encoding uses {0} octets (max {MAX_LENGTH_OCTETS})")]
    LengthOverflow(usize),
    #[error("element of {0} bytes exceeds the {1} byte limit")]
    TooLarge(usize, usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("element truncated")]
    Truncated,
    #[error("{0} trailing bytes after element")]
    TrailingBytes(usize),
    #[error("indefinite length is not permitted")]
    IndefiniteLength,
    #[error("length encoding uses {0} octets (max {MAX_LENGTH_OCTETS})")]
    LengthOverflow(usize),
    #[error("tag number does not fit in 32 bits")]
    TagOverflow,
    #[error("BOOLEAN content must be 1 byte, got {0}")]
    BadBoolean(usize),
    #[error("INTEGER content of {0} bytes not supported")]
    IntegerSize(usize),
    #[error("NULL content must be empty")]
    BadNull,
    #[error("tag {0} must be constructed")]
    ExpectedConstructed(u32),
    #[error("tag {0} must be primitive")]
    ExpectedPrimitive(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagClass {
    Universal,
    Application,
    Context,
    Private,
}

/// A non-universal (or unrecognized universal) element, preserving its tag
/// class, number and primitive/constructed form so encoding round-trips.
#[derive(Debug, Clone, PartialEq)]
pub struct Tagged {
    pub class: TagClass,
    pub number: u32,
    pub content: TaggedContent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaggedContent {
    Primitive(Vec<u8>),
    Constructed(Vec<BerValue>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum BerValue {
    Boolean(bool),
    Integer(i64),
    Enumerated(i64),
    OctetString(Vec<u8>),
    Null,
    Sequence(Vec<BerValue>),
    Set(Vec<BerValue>),
    Tagged(Tagged),
}

impl BerValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            BerValue::Integer(v) | BerValue::Enumerated(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            BerValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BerValue::OctetString(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_sequence(&self) -> Option<&[BerValue]> {
        match self {
            BerValue::Sequence(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_tagged(&self) -> Option<&Tagged> {
        match self {
            BerValue::Tagged(t) => Some(t),
            _ => None,
        }
    }
}

/// Compute the total size of the element at the head of `buf`, or None when
/// more bytes are needed to know. `max_bytes` bounds the declared size.
fn element_len(buf: &[u8], max_bytes: usize) -> Result<Option<usize>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let mut pos = 1;
    if buf[0] & 0x1F == 0x1F {
        // Long-form tag: continuation bytes carry 7 bits each.
        loop {
            match buf.get(pos) {
                None => return Ok(None),
                Some(b) => {
                    pos += 1;
                    if b & 0x80 == 0 {
                        break;
                    }
                }
            }
        }
    }
    let first = match buf.get(pos) {
        None => return Ok(None),
        Some(b) => *b,
    };
    pos += 1;
    let content = if first & 0x80 == 0 {
        first as usize
    } else {
        let octets = (first & 0x7F) as usize;
        if octets == 0 {
            return Err(FrameError::IndefiniteLength);
        }
        if octets > MAX_LENGTH_OCTETS {
            return Err(FrameError::LengthOverflow(octets));
        }
        if buf.len() < pos + octets {
            return Ok(None);
        }
        let mut len = 0usize;
        for i in 0..octets {
            len = (len << 8) | buf[pos + i] as usize;
        }
        pos += octets;
        len
    };
    let total = pos + content;
    if total > max_bytes {
        return Err(FrameError::TooLarge(total, max_bytes));
    }
    Ok(Some(total))
}

/// Read exactly one TLV element off the stream. Returns Ok(None) when the
/// peer closed the stream on an element boundary; EOF mid-element is a
/// framing error. Leftover bytes from pipelined clients stay in `buf`.
pub async fn read_element<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
    max_bytes: usize,
) -> Result<Option<BytesMut>, FrameError> {
    loop {
        if let Some(total) = element_len(buf, max_bytes)? {
            if buf.len() >= total {
                return Ok(Some(buf.split_to(total)));
            }
        } else if buf.len() > max_bytes {
            return Err(FrameError::TooLarge(buf.len(), max_bytes));
        }
        let n = reader.read_buf(buf).await?;
        if n == 0 {
            return if buf.is_empty() {
                Ok(None)
            } else {
                Err(FrameError::Truncated)
            };
        }
    }
}

struct Header {
    class: TagClass,
    number: u32,
    constructed: bool,
    header_len: usize,
    content_len: usize,
}

fn parse_header(input: &[u8]) -> Result<Header, DecodeError> {
    let first = *input.first().ok_or(DecodeError::Truncated)?;
    let class = match first >> 6 {
        0 => TagClass::Universal,
        1 => TagClass::Application,
        2 => TagClass::Context,
        _ => TagClass::Private,
    };
    let constructed = first & 0x20 != 0;
    let mut pos = 1;
    let number = if first & 0x1F != 0x1F {
        (first & 0x1F) as u32
    } else {
        let mut n: u32 = 0;
        loop {
            let b = *input.get(pos).ok_or(DecodeError::Truncated)?;
            pos += 1;
            n = n
                .checked_mul(128)
                .and_then(|v| v.checked_add((b & 0x7F) as u32))
                .ok_or(DecodeError::TagOverflow)?;
            if b & 0x80 == 0 {
                break;
            }
        }
        n
    };
    let lb = *input.get(pos).ok_or(DecodeError::Truncated)?;
    pos += 1;
    let content_len = if lb & 0x80 == 0 {
        lb as usize
    } else {
        let octets = (lb & 0x7F) as usize;
        if octets == 0 {
            return Err(DecodeError::IndefiniteLength);
        }
        if octets > MAX_LENGTH_OCTETS {
            return Err(DecodeError::LengthOverflow(octets));
        }
        if input.len() < pos + octets {
            return Err(DecodeError::Truncated);
        }
        let mut len = 0usize;
        for i in 0..octets {
            len = (len << 8) | input[pos + i] as usize;
        }
        pos += octets;
        len
    };
    if input.len() < pos + content_len {
        return Err(DecodeError::Truncated);
    }
    Ok(Header {
        class,
        number,
        constructed,
        header_len: pos,
        content_len,
    })
}

/// Decode one complete element; trailing bytes are an error.
pub fn decode(input: &[u8]) -> Result<BerValue, DecodeError> {
    let (value, used) = decode_element(input)?;
    if used != input.len() {
        return Err(DecodeError::TrailingBytes(input.len() - used));
    }
    Ok(value)
}

fn decode_element(input: &[u8]) -> Result<(BerValue, usize), DecodeError> {
    let h = parse_header(input)?;
    let content = &input[h.header_len..h.header_len + h.content_len];
    let used = h.header_len + h.content_len;
    let value = match h.class {
        TagClass::Universal => decode_universal(h.number, h.constructed, content)?,
        class => BerValue::Tagged(Tagged {
            class,
            number: h.number,
            content: if h.constructed {
                TaggedContent::Constructed(decode_all(content)?)
            } else {
                TaggedContent::Primitive(content.to_vec())
            },
        }),
    };
    Ok((value, used))
}

fn decode_universal(number: u32, constructed: bool, content: &[u8]) -> Result<BerValue, DecodeError> {
    match number {
        0x01 => {
            if content.len() != 1 {
                return Err(DecodeError::BadBoolean(content.len()));
            }
            Ok(BerValue::Boolean(content[0] != 0))
        }
        0x02 => Ok(BerValue::Integer(integer_from_bytes(content)?)),
        0x0A => Ok(BerValue::Enumerated(integer_from_bytes(content)?)),
        0x04 => {
            if constructed {
                return Err(DecodeError::ExpectedPrimitive(number));
            }
            Ok(BerValue::OctetString(content.to_vec()))
        }
        0x05 => {
            if !content.is_empty() {
                return Err(DecodeError::BadNull);
            }
            Ok(BerValue::Null)
        }
        0x10 => {
            if !constructed {
                return Err(DecodeError::ExpectedConstructed(number));
            }
            Ok(BerValue::Sequence(decode_all(content)?))
        }
        0x11 => {
            if !constructed {
                return Err(DecodeError::ExpectedConstructed(number));
            }
            Ok(BerValue::Set(decode_all(content)?))
        }
        _ => Ok(BerValue::Tagged(Tagged {
            class: TagClass::Universal,
            number,
            content: if constructed {
                TaggedContent::Constructed(decode_all(content)?)
            } else {
                TaggedContent::Primitive(content.to_vec())
            },
        })),
    }
}

fn decode_all(mut input: &[u8]) -> Result<Vec<BerValue>, DecodeError> {
    let mut items = Vec::new();
    while !input.is_empty() {
        let (value, used) = decode_element(input)?;
        items.push(value);
        input = &input[used..];
    }
    Ok(items)
}

/// Big-endian two's-complement integer content.
pub fn integer_from_bytes(content: &[u8]) -> Result<i64, DecodeError> {
    if content.is_empty() || content.len() > 8 {
        return Err(DecodeError::IntegerSize(content.len()));
    }
    let mut v: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
    for &b in content {
        v = (v << 8) | b as i64;
    }
    Ok(v)
}

fn integer_to_bytes(v: i64) -> Vec<u8> {
    let mut out = v.to_be_bytes().to_vec();
    while out.len() > 1
        && ((out[0] == 0x00 && out[1] & 0x80 == 0) || (out[0] == 0xFF && out[1] & 0x80 != 0))
    {
        out.remove(0);
    }
    out
}

pub fn encode(value: &BerValue) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &BerValue, out: &mut Vec<u8>) {
    match value {
        BerValue::Boolean(b) => {
            out.extend_from_slice(&[0x01, 0x01, if *b { 0xFF } else { 0x00 }]);
        }
        BerValue::Integer(v) => put_primitive(out, 0x02, &integer_to_bytes(*v)),
        BerValue::Enumerated(v) => put_primitive(out, 0x0A, &integer_to_bytes(*v)),
        BerValue::OctetString(b) => put_primitive(out, 0x04, b),
        BerValue::Null => out.extend_from_slice(&[0x05, 0x00]),
        BerValue::Sequence(items) => put_constructed(out, 0x30, items),
        BerValue::Set(items) => put_constructed(out, 0x31, items),
        BerValue::Tagged(t) => {
            let bits = match t.class {
                TagClass::Universal => 0x00,
                TagClass::Application => 0x40,
                TagClass::Context => 0x80,
                TagClass::Private => 0xC0,
            };
            match &t.content {
                TaggedContent::Primitive(bytes) => {
                    put_tag(out, bits, t.number);
                    put_length(out, bytes.len());
                    out.extend_from_slice(bytes);
                }
                TaggedContent::Constructed(items) => {
                    let mut body = Vec::new();
                    for item in items {
                        encode_into(item, &mut body);
                    }
                    put_tag(out, bits | 0x20, t.number);
                    put_length(out, body.len());
                    out.extend_from_slice(&body);
                }
            }
        }
    }
}

fn put_primitive(out: &mut Vec<u8>, tag: u8, content: &[u8]) {
    out.push(tag);
    put_length(out, content.len());
    out.extend_from_slice(content);
}

fn put_constructed(out: &mut Vec<u8>, tag: u8, items: &[BerValue]) {
    let mut body = Vec::new();
    for item in items {
        encode_into(item, &mut body);
    }
    out.push(tag);
    put_length(out, body.len());
    out.extend_from_slice(&body);
}

fn put_tag(out: &mut Vec<u8>, bits: u8, number: u32) {
    if number < 31 {
        out.push(bits | number as u8);
        return;
    }
    out.push(bits | 0x1F);
    let mut groups = Vec::new();
    let mut n = number;
    loop {
        groups.push((n & 0x7F) as u8);
        n >>= 7;
        if n == 0 {
            break;
        }
    }
    groups.reverse();
    let last = groups.len() - 1;
    for (i, g) in groups.iter().enumerate() {
        out.push(if i < last { g | 0x80 } else { *g });
    }
}

fn put_length(out: &mut Vec<u8>, len: usize) {
    if len < 128 {
        out.push(len as u8);
        return;
    }
    let mut octets = Vec::new();
    let mut l = len;
    while l > 0 {
        octets.push((l & 0xFF) as u8);
        l >>= 8;
    }
    octets.reverse();
    out.push(0x80 | octets.len() as u8);
    out.extend_from_slice(&octets);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(number: u32, items: Vec<BerValue>) -> BerValue {
        BerValue::Tagged(Tagged {
            class: TagClass::Application,
            number,
            content: TaggedContent::Constructed(items),
        })
    }

    #[test]
    fn test_integer_roundtrip() {
        for v in [0i64, 1, 127, 128, 255, 256, -1, -128, -129, i64::MAX, i64::MIN] {
            let encoded = encode(&BerValue::Integer(v));
            assert_eq!(decode(&encoded).unwrap(), BerValue::Integer(v), "value {}", v);
        }
    }

    #[test]
    fn test_integer_minimal_encoding() {
        assert_eq!(encode(&BerValue::Integer(0)), vec![0x02, 0x01, 0x00]);
        assert_eq!(encode(&BerValue::Integer(127)), vec![0x02, 0x01, 0x7F]);
        assert_eq!(encode(&BerValue::Integer(128)), vec![0x02, 0x02, 0x00, 0x80]);
        assert_eq!(encode(&BerValue::Integer(-1)), vec![0x02, 0x01, 0xFF]);
        assert_eq!(encode(&BerValue::Integer(-128)), vec![0x02, 0x01, 0x80]);
    }

    #[test]
    fn test_boolean_encoding() {
        assert_eq!(encode(&BerValue::Boolean(true)), vec![0x01, 0x01, 0xFF]);
        assert_eq!(encode(&BerValue::Boolean(false)), vec![0x01, 0x01, 0x00]);
        assert_eq!(decode(&[0x01, 0x01, 0x01]).unwrap(), BerValue::Boolean(true));
    }

    #[test]
    fn test_octet_string_length_boundaries() {
        for len in [0usize, 1, 127, 128, 256, 65536] {
            let value = BerValue::OctetString(vec![0x58; len]);
            let encoded = encode(&value);
            assert_eq!(decode(&encoded).unwrap(), value, "length {}", len);
        }
    }

    #[test]
    fn test_nested_structure_roundtrip() {
        let value = BerValue::Sequence(vec![
            BerValue::Integer(7),
            app(
                3,
                vec![
                    BerValue::OctetString(b"dc=example,dc=com".to_vec()),
                    BerValue::Enumerated(2),
                    BerValue::Set(vec![BerValue::Boolean(false), BerValue::Null]),
                ],
            ),
            BerValue::Tagged(Tagged {
                class: TagClass::Context,
                number: 0,
                content: TaggedContent::Primitive(b"secret".to_vec()),
            }),
        ]);
        let encoded = encode(&value);
        assert_eq!(decode(&encoded).unwrap(), value);
        // DER canonical input re-encodes byte-identically.
        assert_eq!(encode(&decode(&encoded).unwrap()), encoded);
    }

    #[test]
    fn test_encode_decode_identity_on_canonical_bytes() {
        // BindRequest envelope: SEQUENCE { messageID 1, [APPLICATION 0] { 3, "", [0] "" } }
        let bytes = vec![
            0x30, 0x0C, 0x02, 0x01, 0x01, 0x60, 0x07, 0x02, 0x01, 0x03, 0x04, 0x00, 0x80, 0x00,
        ];
        let value = decode(&bytes).unwrap();
        assert_eq!(encode(&value), bytes);
    }

    #[test]
    fn test_long_form_tag_roundtrip() {
        let value = BerValue::Tagged(Tagged {
            class: TagClass::Context,
            number: 128,
            content: TaggedContent::Primitive(vec![0xAB]),
        });
        let encoded = encode(&value);
        assert_eq!(&encoded[..3], &[0x9F, 0x81, 0x00]);
        assert_eq!(decode(&encoded).unwrap(), value);
    }

    #[test]
    fn test_decode_long_form_tag() {
        // Application primitive, tag number 1000 = 0x87 0x68 in base-128.
        let bytes = vec![0x5F, 0x87, 0x68, 0x01, 0x2A];
        match decode(&bytes).unwrap() {
            BerValue::Tagged(t) => {
                assert_eq!(t.class, TagClass::Application);
                assert_eq!(t.number, 1000);
                assert_eq!(t.content, TaggedContent::Primitive(vec![0x2A]));
            }
            other => panic!("unexpected value: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_universal_tag_preserved() {
        // OBJECT IDENTIFIER is outside the LDAP subset; kept as a raw element.
        let bytes = vec![0x06, 0x03, 0x2A, 0x86, 0x48];
        let value = decode(&bytes).unwrap();
        match &value {
            BerValue::Tagged(t) => {
                assert_eq!(t.class, TagClass::Universal);
                assert_eq!(t.number, 6);
            }
            other => panic!("unexpected value: {:?}", other),
        }
        assert_eq!(encode(&value), bytes);
    }

    #[test]
    fn test_decode_rejects_indefinite_length() {
        assert_eq!(
            decode(&[0x30, 0x80, 0x00, 0x00]).unwrap_err(),
            DecodeError::IndefiniteLength
        );
    }

    #[test]
    fn test_decode_rejects_truncated_content() {
        assert_eq!(decode(&[0x04, 0x05, 0x61, 0x62]).unwrap_err(), DecodeError::Truncated);
        assert_eq!(decode(&[0x02, 0x02, 0xFF]).unwrap_err(), DecodeError::Truncated);
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        assert_eq!(
            decode(&[0x05, 0x00, 0x05, 0x00]).unwrap_err(),
            DecodeError::TrailingBytes(2)
        );
    }

    #[test]
    fn test_decode_rejects_bad_boolean_and_null() {
        assert_eq!(decode(&[0x01, 0x02, 0x00, 0x00]).unwrap_err(), DecodeError::BadBoolean(2));
        assert_eq!(decode(&[0x05, 0x01, 0x00]).unwrap_err(), DecodeError::BadNull);
    }

    #[tokio::test]
    async fn test_read_element_single_frame() {
        let frame = encode(&BerValue::Sequence(vec![BerValue::Integer(5)]));
        let mut input: &[u8] = &frame;
        let mut buf = BytesMut::new();
        let element = read_element(&mut input, &mut buf, 1 << 20).await.unwrap().unwrap();
        assert_eq!(&element[..], &frame[..]);
        // Stream ends exactly on the element boundary: clean close.
        assert!(read_element(&mut input, &mut buf, 1 << 20).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_element_pipelined_frames() {
        let a = encode(&BerValue::Integer(1));
        let b = encode(&BerValue::Integer(2));
        let mut joined = a.clone();
        joined.extend_from_slice(&b);
        let mut input: &[u8] = &joined;
        let mut buf = BytesMut::new();
        let first = read_element(&mut input, &mut buf, 1 << 20).await.unwrap().unwrap();
        assert_eq!(&first[..], &a[..]);
        let second = read_element(&mut input, &mut buf, 1 << 20).await.unwrap().unwrap();
        assert_eq!(&second[..], &b[..]);
    }

    #[tokio::test]
    async fn test_read_element_eof_mid_element() {
        // Declared length 5, only 2 content bytes delivered.
        let mut input: &[u8] = &[0x04, 0x05, 0x61, 0x62];
        let mut buf = BytesMut::new();
        match read_element(&mut input, &mut buf, 1 << 20).await {
            Err(FrameError::Truncated) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_element_rejects_indefinite_length() {
        let mut input: &[u8] = &[0x30, 0x80, 0x00, 0x00];
        let mut buf = BytesMut::new();
        match read_element(&mut input, &mut buf, 1 << 20).await {
            Err(FrameError::IndefiniteLength) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_element_enforces_size_limit() {
        // Declared content length 0x0200 with a 16-byte limit.
        let mut input: &[u8] = &[0x30, 0x82, 0x02, 0x00, 0x00];
        let mut buf = BytesMut::new();
        match read_element(&mut input, &mut buf, 16).await {
            Err(FrameError::TooLarge(_, 16)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_element_long_form_tag() {
        let frame = vec![0x5F, 0x87, 0x68, 0x01, 0x2A];
        let mut input: &[u8] = &frame;
        let mut buf = BytesMut::new();
        let element = read_element(&mut input, &mut buf, 1 << 20).await.unwrap().unwrap();
        assert_eq!(&element[..], &frame[..]);
    }
}
