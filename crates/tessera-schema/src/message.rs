//! Multi-valued records and their binary packing
//!
//! Packed layout, all integers little-endian u32:
//!
//! ```text
//! format | element_count | dn_len dn | { name_len name value_count { value_len value }* }*
//! ```

use crate::error::{SchemaError, SchemaResult};

/// Format marker at the start of every packed message: "TSM1"
const MESSAGE_FORMAT: u32 = u32::from_le_bytes(*b"TSM1");

/// Store key prefix for records
const KEY_PREFIX: &[u8] = b"DN=";

/// Store key for the record named `dn`
pub fn record_key(dn: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(KEY_PREFIX.len() + dn.len());
    key.extend_from_slice(KEY_PREFIX);
    key.extend_from_slice(dn.as_bytes());
    key
}

/// Special records are reserved for metadata; their names start with `@`.
pub fn is_special_dn(dn: &str) -> bool {
    dn.starts_with('@')
}

/// One named, multi-valued attribute of a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub values: Vec<Vec<u8>>,
}

/// A record: a name plus elements
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub dn: String,
    pub elements: Vec<Element>,
}

impl Message {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            elements: Vec::new(),
        }
    }

    /// Builder form of [`Message::add_value`]
    pub fn with_value(mut self, name: &str, value: impl Into<Vec<u8>>) -> Self {
        self.add_value(name, value);
        self
    }

    /// Append `value` to element `name`, creating the element if needed.
    pub fn add_value(&mut self, name: &str, value: impl Into<Vec<u8>>) -> &mut Self {
        let value = value.into();
        match self.element_mut(name) {
            Some(element) => element.values.push(value),
            None => self.elements.push(Element {
                name: name.to_string(),
                values: vec![value],
            }),
        }
        self
    }

    /// Replace all values of element `name` with `value`.
    pub fn set_value(&mut self, name: &str, value: impl Into<Vec<u8>>) -> &mut Self {
        let value = value.into();
        match self.element_mut(name) {
            Some(element) => element.values = vec![value],
            None => self.elements.push(Element {
                name: name.to_string(),
                values: vec![value],
            }),
        }
        self
    }

    /// Element names match exactly, like attribute names in the schema tables.
    pub fn element(&self, name: &str) -> Option<&Element> {
        self.elements.iter().find(|e| e.name == name)
    }

    fn element_mut(&mut self, name: &str) -> Option<&mut Element> {
        self.elements.iter_mut().find(|e| e.name == name)
    }

    /// First value of `name` as a string
    pub fn first_str(&self, name: &str) -> Option<&str> {
        self.element(name)?.values.first().and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.packed_size());
        put_u32(&mut out, MESSAGE_FORMAT);
        put_u32(&mut out, self.elements.len() as u32);
        put_bytes(&mut out, self.dn.as_bytes());
        for element in &self.elements {
            put_bytes(&mut out, element.name.as_bytes());
            put_u32(&mut out, element.values.len() as u32);
            for value in &element.values {
                put_bytes(&mut out, value);
            }
        }
        out
    }

    fn packed_size(&self) -> usize {
        12 + self.dn.len()
            + self
                .elements
                .iter()
                .map(|e| 8 + e.name.len() + e.values.iter().map(|v| 4 + v.len()).sum::<usize>())
                .sum::<usize>()
    }

    /// Decode a packed message. `dn_hint` only names the record in errors.
    pub fn unpack(data: &[u8], dn_hint: &str) -> SchemaResult<Self> {
        let mut reader = Reader { data, pos: 0, dn: dn_hint };

        let format = reader.u32()?;
        if format != MESSAGE_FORMAT {
            return Err(SchemaError::malformed_record(dn_hint, format!("unknown format 0x{:08x}", format)));
        }
        let count = reader.u32()? as usize;
        let dn = reader.string()?;

        // Every element needs at least 8 bytes; bound the allocation by what's there.
        let mut elements = Vec::with_capacity(count.min(reader.remaining() / 8));
        for _ in 0..count {
            let name = reader.string()?;
            let value_count = reader.u32()? as usize;
            let mut values = Vec::with_capacity(value_count.min(reader.remaining() / 4));
            for _ in 0..value_count {
                values.push(reader.bytes()?.to_vec());
            }
            elements.push(Element { name, values });
        }
        if reader.remaining() != 0 {
            return Err(SchemaError::malformed_record(
                dn_hint,
                format!("{} trailing bytes", reader.remaining()),
            ));
        }
        Ok(Self { dn, elements })
    }
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    dn: &'a str,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> SchemaResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(SchemaError::malformed_record(
                self.dn,
                format!("truncated at byte {}: need {} more, have {}", self.pos, n, self.remaining()),
            ));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u32(&mut self) -> SchemaResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn bytes(&mut self) -> SchemaResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn string(&mut self) -> SchemaResult<String> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| SchemaError::malformed_record(self.dn, format!("non UTF-8 name at byte {}", self.pos)))
    }
}
