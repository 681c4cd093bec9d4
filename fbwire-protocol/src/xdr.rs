//! XDR stream framing.
//!
//! Every value on the wire is big-endian and 4-byte aligned:
//!
//! ```text
//! int32   : 4 bytes
//! int64   : 8 bytes
//! buffer  : int32 length | bytes | zero padding to a multiple of 4
//! string  : buffer holding the text in the session encoding
//! typed   : int32 (length + 1) | type byte | bytes | padding
//! ```
//!
//! Writes are buffered until [`XdrWriter::flush`]. A [`WireCipher`] may be
//! installed on either direction and only affects bytes sent or received
//! after installation.

use crate::consts::OP_DUMMY;
use crate::error::ProtocolError;
use crate::MAX_BUFFER_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::borrow::Cow;
use std::io::{self, Read, Write};

/// Size of the read chunk pulled from the channel at once.
const READ_CHUNK_SIZE: usize = 8 * 1024;

const PADDING: [u8; 3] = [0; 3];

/// Number of pad bytes following a value of `len` bytes.
#[inline]
pub fn padding_for(len: usize) -> usize {
    (4 - (len & 3)) & 3
}

/// Byte encoding used for strings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encoding {
    #[default]
    Utf8,
    /// ISO-8859-1; characters outside the range are sent as `?`.
    Latin1,
}

impl Encoding {
    pub fn encode<'a>(&self, text: &'a str) -> Cow<'a, [u8]> {
        match self {
            Encoding::Utf8 => Cow::Borrowed(text.as_bytes()),
            Encoding::Latin1 if text.is_ascii() => Cow::Borrowed(text.as_bytes()),
            Encoding::Latin1 => Cow::Owned(
                text.chars()
                    .map(|c| if (c as u32) < 0x100 { c as u8 } else { b'?' })
                    .collect(),
            ),
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<String, ProtocolError> {
        match self {
            Encoding::Utf8 => std::str::from_utf8(bytes)
                .map(str::to_owned)
                .map_err(|_| ProtocolError::InvalidUtf8),
            Encoding::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
        }
    }
}

/// A symmetric stream cipher applied in place to one direction of the wire.
pub trait WireCipher: Send {
    fn apply(&mut self, data: &mut [u8]);
}

/// Buffered XDR writer.
pub struct XdrWriter<W> {
    inner: W,
    buffer: BytesMut,
    encoding: Encoding,
    cipher: Option<Box<dyn WireCipher>>,
}

impl<W: Write> XdrWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
            encoding: Encoding::Utf8,
            cipher: None,
        }
    }

    pub fn set_encoding(&mut self, encoding: Encoding) {
        self.encoding = encoding;
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buffer.put_i32(value);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buffer.put_i64(value);
    }

    /// Writes bytes without length prefix or padding.
    pub fn write_raw(&mut self, data: &[u8]) {
        self.buffer.put_slice(data);
    }

    pub fn write_padding(&mut self, len: usize, fill: u8) {
        self.buffer.put_bytes(fill, len);
    }

    /// Writes a length-prefixed buffer padded to 4-byte alignment.
    pub fn write_buffer(&mut self, data: &[u8]) {
        self.buffer.put_i32(data.len() as i32);
        self.buffer.put_slice(data);
        self.buffer.put_slice(&PADDING[..padding_for(data.len())]);
    }

    /// Writes a buffer, or a zero length when absent.
    pub fn write_opt_buffer(&mut self, data: Option<&[u8]>) {
        match data {
            Some(data) => self.write_buffer(data),
            None => self.write_i32(0),
        }
    }

    pub fn write_string(&mut self, text: &str) {
        let encoded = self.encoding.encode(text);
        self.write_buffer(&encoded);
    }

    /// Writes a parameter buffer prefixed by its type (version) byte.
    pub fn write_typed(&mut self, buffer_type: u8, content: &[u8]) {
        let len = content.len() + 1;
        self.buffer.put_i32(len as i32);
        self.buffer.put_u8(buffer_type);
        self.buffer.put_slice(content);
        self.buffer.put_slice(&PADDING[..padding_for(len)]);
    }

    /// Number of bytes waiting for the next flush.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Sends all buffered bytes, encrypting them if a cipher is installed.
    pub fn flush(&mut self) -> Result<(), ProtocolError> {
        if !self.buffer.is_empty() {
            if let Some(cipher) = self.cipher.as_mut() {
                cipher.apply(&mut self.buffer);
            }
            let result = self.inner.write_all(&self.buffer);
            self.buffer.clear();
            result.map_err(ProtocolError::Write)?;
        }
        self.inner.flush().map_err(ProtocolError::Write)
    }

    /// Installs the outgoing cipher after flushing pending plaintext.
    pub fn set_cipher(&mut self, cipher: Box<dyn WireCipher>) -> Result<(), ProtocolError> {
        self.flush()?;
        self.cipher = Some(cipher);
        Ok(())
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }
}

/// Buffered XDR reader.
pub struct XdrReader<R> {
    inner: R,
    buffer: BytesMut,
    encoding: Encoding,
    cipher: Option<Box<dyn WireCipher>>,
}

impl<R: Read> XdrReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
            encoding: Encoding::Utf8,
            cipher: None,
        }
    }

    pub fn set_encoding(&mut self, encoding: Encoding) {
        self.encoding = encoding;
    }

    /// Installs the incoming cipher. Bytes already buffered were received
    /// before the switch and stay untouched.
    pub fn set_cipher(&mut self, cipher: Box<dyn WireCipher>) {
        self.cipher = Some(cipher);
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Number of received bytes not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn fill(&mut self, needed: usize) -> Result<(), ProtocolError> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        while self.buffer.len() < needed {
            let n = match self.inner.read(&mut chunk) {
                Ok(0) => {
                    return Err(ProtocolError::Read(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    )))
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ProtocolError::Read(e)),
            };
            if let Some(cipher) = self.cipher.as_mut() {
                cipher.apply(&mut chunk[..n]);
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }

    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        self.fill(4)?;
        Ok(self.buffer.get_i32())
    }

    pub fn read_i64(&mut self) -> Result<i64, ProtocolError> {
        self.fill(8)?;
        Ok(self.buffer.get_i64())
    }

    /// Reads the next operation code, skipping keep-alive packets.
    pub fn read_operation(&mut self) -> Result<i32, ProtocolError> {
        loop {
            let op = self.read_i32()?;
            if op != OP_DUMMY {
                return Ok(op);
            }
        }
    }

    /// Reads exactly `len` bytes without any framing.
    pub fn read_raw(&mut self, len: usize) -> Result<Bytes, ProtocolError> {
        self.fill(len)?;
        Ok(self.buffer.split_to(len).freeze())
    }

    pub fn skip(&mut self, len: usize) -> Result<(), ProtocolError> {
        self.fill(len)?;
        self.buffer.advance(len);
        Ok(())
    }

    /// Skips the alignment padding following a value of `len` bytes.
    pub fn skip_padding(&mut self, len: usize) -> Result<(), ProtocolError> {
        self.skip(padding_for(len))
    }

    fn read_length(&mut self) -> Result<usize, ProtocolError> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(ProtocolError::NegativeLength(len));
        }
        let len = len as usize;
        if len > MAX_BUFFER_SIZE {
            return Err(ProtocolError::BufferTooLarge {
                size: len,
                max: MAX_BUFFER_SIZE,
            });
        }
        Ok(len)
    }

    pub fn read_buffer(&mut self) -> Result<Bytes, ProtocolError> {
        let len = self.read_length()?;
        self.fill(len + padding_for(len))?;
        let data = self.buffer.split_to(len).freeze();
        self.buffer.advance(padding_for(len));
        Ok(data)
    }

    pub fn skip_buffer(&mut self) -> Result<(), ProtocolError> {
        let len = self.read_length()?;
        self.skip(len + padding_for(len))
    }

    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let data = self.read_buffer()?;
        self.encoding.decode(&data)
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    /// XOR "cipher" used to observe where encryption starts.
    struct Xor(u8);

    impl WireCipher for Xor {
        fn apply(&mut self, data: &mut [u8]) {
            for b in data {
                *b ^= self.0;
            }
        }
    }

    fn written(writer: &mut XdrWriter<Vec<u8>>) -> Vec<u8> {
        writer.flush().unwrap();
        writer.get_ref().clone()
    }

    #[test]
    fn test_buffer_padding() {
        let mut writer = XdrWriter::new(Vec::new());
        writer.write_buffer(b"abc");
        let bytes = written(&mut writer);
        assert_eq!(bytes, vec![0, 0, 0, 3, b'a', b'b', b'c', 0]);

        let mut writer = XdrWriter::new(Vec::new());
        writer.write_buffer(b"abcd");
        assert_eq!(written(&mut writer).len(), 8);
    }

    #[test]
    fn test_null_buffer_is_zero_length() {
        let mut writer = XdrWriter::new(Vec::new());
        writer.write_opt_buffer(None);
        assert_eq!(written(&mut writer), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_typed_buffer() {
        let mut writer = XdrWriter::new(Vec::new());
        writer.write_typed(1, &[28, 1, b'A']);
        assert_eq!(written(&mut writer), vec![0, 0, 0, 4, 1, 28, 1, b'A']);
    }

    #[test]
    fn test_writes_are_buffered_until_flush() {
        let mut writer = XdrWriter::new(Vec::new());
        writer.write_i32(42);
        assert_eq!(writer.buffered(), 4);
        assert!(writer.get_ref().is_empty());
        writer.flush().unwrap();
        assert_eq!(writer.buffered(), 0);
        assert_eq!(writer.get_ref(), &vec![0, 0, 0, 42]);
    }

    #[test]
    fn test_read_operation_skips_dummy() {
        let mut writer = XdrWriter::new(Vec::new());
        writer.write_i32(OP_DUMMY);
        writer.write_i32(OP_DUMMY);
        writer.write_i32(9);
        let mut reader = XdrReader::new(Cursor::new(written(&mut writer)));
        assert_eq!(reader.read_operation().unwrap(), 9);
    }

    #[test]
    fn test_eof_is_read_error() {
        let mut reader = XdrReader::new(Cursor::new(vec![0, 0]));
        match reader.read_i32() {
            Err(ProtocolError::Read(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected read error, got {:?}", other),
        }
    }

    #[test]
    fn test_negative_length_rejected() {
        let mut reader = XdrReader::new(Cursor::new(vec![0xFF, 0xFF, 0xFF, 0xFE]));
        assert!(matches!(
            reader.read_buffer(),
            Err(ProtocolError::NegativeLength(-2))
        ));
    }

    #[test]
    fn test_latin1_encoding() {
        let encoded = Encoding::Latin1.encode("caf\u{e9}\u{20ac}");
        assert_eq!(&encoded[..], &[b'c', b'a', b'f', 0xE9, b'?']);
        assert_eq!(Encoding::Latin1.decode(&[0xE9]).unwrap(), "\u{e9}");
        assert!(Encoding::Utf8.decode(&[0xE9]).is_err());
    }

    #[test]
    fn test_cipher_applies_after_installation_only() {
        let mut writer = XdrWriter::new(Vec::new());
        writer.write_i32(1);
        writer.set_cipher(Box::new(Xor(0xFF))).unwrap();
        writer.write_i32(2);
        let bytes = written(&mut writer);
        assert_eq!(&bytes[..4], &[0, 0, 0, 1]);
        assert_eq!(&bytes[4..], &[0xFF, 0xFF, 0xFF, 0xFD]);

        let mut reader = XdrReader::new(Cursor::new(bytes[4..].to_vec()));
        reader.set_cipher(Box::new(Xor(0xFF)));
        assert_eq!(reader.read_i32().unwrap(), 2);
        assert!(reader.is_encrypted());
    }

    proptest! {
        #[test]
        fn prop_values_survive_framing(
            a in any::<i32>(),
            b in any::<i64>(),
            data in proptest::collection::vec(any::<u8>(), 0..64),
            text in "\\PC{0,24}",
        ) {
            let mut writer = XdrWriter::new(Vec::new());
            writer.write_i32(a);
            writer.write_buffer(&data);
            writer.write_i64(b);
            writer.write_string(&text);
            let bytes = written(&mut writer);
            prop_assert_eq!(bytes.len() % 4, 0);

            let mut reader = XdrReader::new(Cursor::new(bytes));
            prop_assert_eq!(reader.read_i32().unwrap(), a);
            prop_assert_eq!(&reader.read_buffer().unwrap()[..], &data[..]);
            prop_assert_eq!(reader.read_i64().unwrap(), b);
            prop_assert_eq!(reader.read_string().unwrap(), text);
            prop_assert_eq!(reader.buffered(), 0);
        }

        #[test]
        fn prop_buffer_padding_is_exact(len in 0usize..40) {
            let mut writer = XdrWriter::new(Vec::new());
            writer.write_buffer(&vec![7u8; len]);
            let bytes = written(&mut writer);
            prop_assert_eq!(bytes.len(), 4 + len + padding_for(len));
            prop_assert!(bytes[4 + len..].iter().all(|&b| b == 0));
        }
    }
}
