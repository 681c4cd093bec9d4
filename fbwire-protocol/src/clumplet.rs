//! Clumplet parsing and parameter buffer construction.
//!
//! Three layouts are used on the wire:
//!
//! ```text
//! traditional : tag (1) | length (1)     | data
//! wide        : tag (1) | length (4, LE) | data
//! info        : item (1) | length (2, LE) | data, terminated by isc_info_end
//! ```

use crate::consts::{
    ISC_BPB_VERSION1, ISC_DPB_VERSION1, ISC_INFO_END, ISC_INFO_TRUNCATED, ISC_TPB_VERSION3,
};
use crate::error::ProtocolError;

/// DPB version using 4-byte clumplet lengths.
const ISC_DPB_VERSION2: u8 = 2;

/// Decodes a little-endian integer of 1 to 8 bytes ("VAX" integer).
pub fn vax_integer(data: &[u8]) -> i64 {
    let mut value: i64 = 0;
    for (shift, byte) in data.iter().take(8).enumerate() {
        value |= (*byte as i64) << (shift * 8);
    }
    // Sign-extend values shorter than 8 bytes
    let len = data.len().min(8);
    if len > 0 && len < 8 && data[len - 1] & 0x80 != 0 {
        value |= -1i64 << (len * 8);
    }
    value
}

/// Reader over traditional (1-byte length) clumplets without a leading
/// version byte.
pub struct ClumpletReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> ClumpletReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }
}

impl<'a> Iterator for ClumpletReader<'a> {
    type Item = Result<(u8, &'a [u8]), ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.data.len() {
            return None;
        }
        let data = self.data;
        let remaining = &data[self.position..];
        if remaining.len() < 2 {
            self.position = self.data.len();
            return Some(Err(ProtocolError::malformed(
                "clumplet",
                "truncated header",
            )));
        }
        let tag = remaining[0];
        let len = remaining[1] as usize;
        if remaining.len() < 2 + len {
            self.position = self.data.len();
            return Some(Err(ProtocolError::malformed(
                "clumplet",
                format!("tag {} declares {} bytes, {} left", tag, len, remaining.len() - 2),
            )));
        }
        self.position += 2 + len;
        Some(Ok((tag, &remaining[2..2 + len])))
    }
}

/// One item of an info response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoItem<'a> {
    Value { item: u8, data: &'a [u8] },
    /// The response did not fit the requested buffer size.
    Truncated,
}

/// Reader over an info response (2-byte item lengths).
pub struct InfoReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> InfoReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Reads the next raw item byte without a length.
    pub fn next_byte(&mut self) -> Option<u8> {
        let byte = self.data.get(self.position).copied();
        if byte.is_some() {
            self.position += 1;
        }
        byte
    }

    pub fn peek_byte(&self) -> Option<u8> {
        self.data.get(self.position).copied()
    }

    /// Reads a 2-byte length followed by that many bytes.
    pub fn read_value(&mut self) -> Result<&'a [u8], ProtocolError> {
        let data = self.data;
        let rest = &data[self.position.min(data.len())..];
        if rest.len() < 2 {
            return Err(ProtocolError::malformed("info response", "truncated length"));
        }
        let len = u16::from_le_bytes([rest[0], rest[1]]) as usize;
        if rest.len() < 2 + len {
            return Err(ProtocolError::malformed(
                "info response",
                format!("item declares {} bytes, {} left", len, rest.len() - 2),
            ));
        }
        self.position += 2 + len;
        Ok(&rest[2..2 + len])
    }

    pub fn read_int(&mut self) -> Result<i64, ProtocolError> {
        self.read_value().map(vax_integer)
    }
}

impl<'a> Iterator for InfoReader<'a> {
    type Item = Result<InfoItem<'a>, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_byte()? {
            ISC_INFO_END => {
                self.position = self.data.len();
                None
            }
            ISC_INFO_TRUNCATED => {
                self.position = self.data.len();
                Some(Ok(InfoItem::Truncated))
            }
            item => Some(self.read_value().map(|data| InfoItem::Value { item, data })),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Argument {
    Flag(u8),
    Bytes(u8, Vec<u8>),
}

/// Builder for database, transaction and blob parameter buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterBuffer {
    version: u8,
    wide_version: Option<u8>,
    arguments: Vec<Argument>,
}

impl ParameterBuffer {
    /// Database parameter buffer (upgrades to version 2 for long values).
    pub fn dpb() -> Self {
        Self {
            version: ISC_DPB_VERSION1,
            wide_version: Some(ISC_DPB_VERSION2),
            arguments: Vec::new(),
        }
    }

    /// Transaction parameter buffer.
    pub fn tpb() -> Self {
        Self {
            version: ISC_TPB_VERSION3,
            wide_version: None,
            arguments: Vec::new(),
        }
    }

    /// Blob parameter buffer.
    pub fn bpb() -> Self {
        Self {
            version: ISC_BPB_VERSION1,
            wide_version: None,
            arguments: Vec::new(),
        }
    }

    /// Adds a tag without value (e.g. TPB isolation flags).
    pub fn add_flag(&mut self, tag: u8) -> &mut Self {
        self.arguments.push(Argument::Flag(tag));
        self
    }

    pub fn add_bytes(&mut self, tag: u8, value: &[u8]) -> &mut Self {
        self.arguments.push(Argument::Bytes(tag, value.to_vec()));
        self
    }

    pub fn add_string(&mut self, tag: u8, value: &str) -> &mut Self {
        self.add_bytes(tag, value.as_bytes())
    }

    /// Adds a 4-byte little-endian integer.
    pub fn add_int(&mut self, tag: u8, value: i32) -> &mut Self {
        self.add_bytes(tag, &value.to_le_bytes())
    }

    pub fn add_byte(&mut self, tag: u8, value: u8) -> &mut Self {
        self.add_bytes(tag, &[value])
    }

    pub fn contains(&self, tag: u8) -> bool {
        self.arguments.iter().any(|a| match a {
            Argument::Flag(t) | Argument::Bytes(t, _) => *t == tag,
        })
    }

    /// Removes every argument with the given tag.
    pub fn remove(&mut self, tag: u8) {
        self.arguments.retain(|a| match a {
            Argument::Flag(t) | Argument::Bytes(t, _) => *t != tag,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.arguments.is_empty()
    }

    fn needs_wide(&self) -> bool {
        self.arguments
            .iter()
            .any(|a| matches!(a, Argument::Bytes(_, v) if v.len() > u8::MAX as usize))
    }

    /// Version byte the buffer is sent with.
    pub fn version(&self) -> u8 {
        match self.wide_version {
            Some(wide) if self.needs_wide() => wide,
            _ => self.version,
        }
    }

    /// Encodes the arguments without the leading version byte.
    pub fn content(&self) -> Result<Vec<u8>, ProtocolError> {
        let wide = self.wide_version.is_some() && self.needs_wide();
        let mut out = Vec::new();
        for argument in &self.arguments {
            match argument {
                Argument::Flag(tag) => out.push(*tag),
                Argument::Bytes(tag, value) => {
                    out.push(*tag);
                    if wide {
                        out.extend_from_slice(&(value.len() as u32).to_le_bytes());
                    } else if value.len() > u8::MAX as usize {
                        return Err(ProtocolError::malformed(
                            "parameter buffer",
                            format!("value of tag {} exceeds 255 bytes", tag),
                        ));
                    } else {
                        out.push(value.len() as u8);
                    }
                    out.extend_from_slice(value);
                }
            }
        }
        Ok(out)
    }

    /// Encodes the complete buffer including the version byte.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = vec![self.version()];
        out.extend(self.content()?);
        Ok(out)
    }
}
