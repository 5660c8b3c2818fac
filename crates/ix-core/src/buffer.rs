//! Shared immutable value objects.

use crate::object::Interface;
use crate::ObjRef;
use std::fmt;

/// A shared, immutable string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct XString {
    text: Box<str>,
}

impl XString {
    #[track_caller]
    pub fn new(text: impl Into<Box<str>>) -> ObjRef<XString> {
        ObjRef::new(XString { text: text.into() })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

impl fmt::Display for XString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl AsRef<str> for XString {
    fn as_ref(&self) -> &str {
        &self.text
    }
}

impl Interface for XString {}

/// A shared, immutable byte buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct MemBuf {
    bytes: Box<[u8]>,
}

impl MemBuf {
    #[track_caller]
    pub fn new(bytes: impl Into<Box<[u8]>>) -> ObjRef<MemBuf> {
        ObjRef::new(MemBuf {
            bytes: bytes.into(),
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.bytes
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

impl AsRef<[u8]> for MemBuf {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl Interface for MemBuf {}
