//! # Packing
//!
//! A small, bounded tag-length-value format.
//!
//! ## Layout
//!
//! | item      | bytes                          |
//! |-----------|--------------------------------|
//! | u32, s32  | tag, 4 data bytes              |
//! | none      | tag                            |
//! | string    | tag, u32 length, utf-8 data    |
//! | bytes     | tag, u32 length, data          |
//! | container | tag, u32 length, nested items  |
//!
//! Numbers are little-endian. A record is a map whose entries are named
//! variants, one per field; readers skip names they do not recognize.

use thiserror::Error;

/// Packing and unpacking errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PackError {
    /// Unknown tag byte, or a tag other than the one being read.
    #[error("invalid tag byte: {0:#04x}")]
    InvalidTag(u8),
    #[error("string data is not valid utf-8")]
    InvalidUtf8,
    #[error("scope mismatch: expected {expected:?}, found {actual:?}")]
    ScopeMismatch { expected: Scope, actual: Scope },
    /// Close without a matching open.
    #[error("no open scope to close")]
    ScopeUnderflow,
    /// `into_bytes` while a container is still open.
    #[error("cannot finalize with open scopes")]
    ScopeStillOpen,
    #[error("unexpected end of buffer")]
    UnexpectedEnd,
    /// Length does not fit the u32 header.
    #[error("blob of {0} bytes is too large")]
    BlobTooLarge(usize),
    /// Second item written into an option or variant.
    #[error("too many items in scope {0:?}; expected exactly 1")]
    TooManyItems(Scope),
    /// Option or variant closed without its item.
    #[error("empty scope {0:?}; expected exactly 1 item")]
    EmptyScope(Scope),
    /// Map entries must be variants.
    #[error("only variants may be written into a map")]
    InvalidMapEntry,
}

pub type Result<T> = std::result::Result<T, PackError>;

/// First byte of every item.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    U32 = 0x05,
    S32 = 0x09,
    OptionNone = 0x0F,
    String = 0x10,
    Bytes = 0x11,
    List = 0x20,
    Map = 0x21,
    OptionSome = 0x30,
    Variant = 0x33,
}

impl TryFrom<u8> for Tag {
    type Error = PackError;

    fn try_from(byte: u8) -> Result<Self> {
        let tag = match byte {
            0x05 => Self::U32,
            0x09 => Self::S32,
            0x0F => Self::OptionNone,
            0x10 => Self::String,
            0x11 => Self::Bytes,
            0x20 => Self::List,
            0x21 => Self::Map,
            0x30 => Self::OptionSome,
            0x33 => Self::Variant,
            other => return Err(PackError::InvalidTag(other)),
        };
        Ok(tag)
    }
}

/// Kind of container an `Encoder` is currently writing into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Top level, outside any container.
    Root,
    /// Ordered sequence of any number of items.
    List,
    /// Field container; only Variants allowed.
    Map,
    /// Exactly one item.
    Option,
    /// Exactly one item after the name.
    Variant,
}

struct Open {
    /// Offset of the first body byte; the length header sits just before.
    body: usize,
    scope: Scope,
    items: usize,
}

/// Writes items into a growing buffer.
///
/// Containers get a zeroed length header when opened; it is filled in when
/// they close. Every write is checked against the innermost open container.
pub struct Encoder {
    buf: Vec<u8>,
    /// Never empty: `Scope::Root` sits at the bottom.
    open: Vec<Open>,
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(256),
            open: vec![Open { body: 0, scope: Scope::Root, items: 0 }],
        }
    }

    /// The encoded bytes, once every container is closed.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        if self.open.len() != 1 {
            return Err(PackError::ScopeStillOpen);
        }
        Ok(self.buf)
    }

    fn innermost(&mut self) -> Result<&mut Open> {
        self.open.last_mut().ok_or(PackError::ScopeUnderflow)
    }

    /// Fails if an item with `tag` may not go into the innermost container.
    fn admit(&mut self, tag: Tag) -> Result<()> {
        let open = self.innermost()?;
        match (open.scope, tag) {
            (Scope::Map, Tag::Variant) | (Scope::Root | Scope::List, _) => Ok(()),
            (Scope::Map, _) => Err(PackError::InvalidMapEntry),
            (scope @ (Scope::Option | Scope::Variant), _) if open.items > 0 => Err(PackError::TooManyItems(scope)),
            (Scope::Option | Scope::Variant, _) => Ok(()),
        }
    }

    fn counted(&mut self) -> Result<()> {
        self.innermost()?.items += 1;
        Ok(())
    }

    fn header(len: usize) -> Result<[u8; 4]> {
        u32::try_from(len)
            .map(u32::to_le_bytes)
            .map_err(|_| PackError::BlobTooLarge(len))
    }

    fn fixed(&mut self, tag: Tag, data: &[u8]) -> Result<()> {
        self.admit(tag)?;
        self.buf.push(tag as u8);
        self.buf.extend(data);
        self.counted()
    }

    fn blob(&mut self, tag: Tag, data: &[u8]) -> Result<()> {
        let header = Self::header(data.len())?;
        self.admit(tag)?;
        self.buf.push(tag as u8);
        self.buf.extend(header);
        self.buf.extend(data);
        self.counted()
    }

    fn open(&mut self, tag: Tag, scope: Scope) -> Result<()> {
        self.admit(tag)?;
        self.buf.push(tag as u8);
        self.buf.extend([0u8; 4]);
        let body = self.buf.len();
        self.open.push(Open { body, scope, items: 0 });
        Ok(())
    }

    fn close(&mut self, expected: Scope) -> Result<()> {
        if self.open.len() < 2 {
            return Err(PackError::ScopeUnderflow);
        }
        let open = self.open.pop().ok_or(PackError::ScopeUnderflow)?;
        if open.scope != expected {
            return Err(PackError::ScopeMismatch { expected, actual: open.scope });
        }
        if open.items == 0 && matches!(open.scope, Scope::Option | Scope::Variant) {
            return Err(PackError::EmptyScope(open.scope));
        }

        let header = Self::header(self.buf.len() - open.body)?;
        self.buf[open.body - 4..open.body].copy_from_slice(&header);
        self.counted()
    }

    pub fn u32(&mut self, v: u32) -> Result<()> {
        self.fixed(Tag::U32, &v.to_le_bytes())
    }

    pub fn s32(&mut self, v: i32) -> Result<()> {
        self.fixed(Tag::S32, &v.to_le_bytes())
    }

    /// Writes an absent optional value.
    pub fn option_none(&mut self) -> Result<()> {
        self.fixed(Tag::OptionNone, &[])
    }

    pub fn str(&mut self, v: &str) -> Result<()> {
        self.blob(Tag::String, v.as_bytes())
    }

    pub fn bytes(&mut self, v: &[u8]) -> Result<()> {
        self.blob(Tag::Bytes, v)
    }

    pub fn list_begin(&mut self) -> Result<()> {
        self.open(Tag::List, Scope::List)
    }

    pub fn list_end(&mut self) -> Result<()> {
        self.close(Scope::List)
    }

    /// Opens a map; its entries are written with `variant_begin`.
    pub fn map_begin(&mut self) -> Result<()> {
        self.open(Tag::Map, Scope::Map)
    }

    pub fn map_end(&mut self) -> Result<()> {
        self.close(Scope::Map)
    }

    /// Opens a present optional value; write exactly one item, then close.
    pub fn option_some_begin(&mut self) -> Result<()> {
        self.open(Tag::OptionSome, Scope::Option)
    }

    pub fn option_some_end(&mut self) -> Result<()> {
        self.close(Scope::Option)
    }

    /// Opens the entry `name`; write exactly one item, then close.
    pub fn variant_begin(&mut self, name: &str) -> Result<()> {
        self.open(Tag::Variant, Scope::Variant)?;
        self.str(name)?;
        self.innermost()?.items = 0;
        Ok(())
    }

    pub fn variant_end(&mut self) -> Result<()> {
        self.close(Scope::Variant)
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads items from a borrowed slice without copying.
///
/// Entering a container yields a `Decoder` over just its body.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    rest: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { rest: buf }
    }

    /// Unread byte count.
    pub fn remaining(&self) -> usize {
        self.rest.len()
    }

    pub fn peek_tag(&self) -> Result<Tag> {
        match self.rest.first() {
            Some(&byte) => Tag::try_from(byte),
            None => Err(PackError::UnexpectedEnd),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let head = self.rest.get(..n).ok_or(PackError::UnexpectedEnd)?;
        self.rest = &self.rest[n..];
        Ok(head)
    }

    fn word(&mut self) -> Result<[u8; 4]> {
        let mut word = [0u8; 4];
        word.copy_from_slice(self.take(4)?);
        Ok(word)
    }

    /// A length header followed by that many bytes.
    fn sized(&mut self) -> Result<&'a [u8]> {
        let len = u32::from_le_bytes(self.word()?) as usize;
        self.take(len)
    }

    fn expect_tag(&mut self, expected: Tag) -> Result<()> {
        match self.peek_tag()? {
            tag if tag == expected => self.take(1).map(drop),
            tag => Err(PackError::InvalidTag(tag as u8)),
        }
    }

    fn body(&mut self, tag: Tag) -> Result<Decoder<'a>> {
        self.expect_tag(tag)?;
        self.sized().map(Decoder::new)
    }

    /// Steps over the next item, nested contents included.
    pub fn skip(&mut self) -> Result<()> {
        let tag = self.peek_tag()?;
        self.take(1)?;
        match tag {
            Tag::OptionNone => Ok(()),
            Tag::U32 | Tag::S32 => self.take(4).map(drop),
            _ => self.sized().map(drop),
        }
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.expect_tag(Tag::U32)?;
        self.word().map(u32::from_le_bytes)
    }

    pub fn s32(&mut self) -> Result<i32> {
        self.expect_tag(Tag::S32)?;
        self.word().map(i32::from_le_bytes)
    }

    pub fn str(&mut self) -> Result<&'a str> {
        self.expect_tag(Tag::String)?;
        let raw = self.sized()?;
        std::str::from_utf8(raw).map_err(|_| PackError::InvalidUtf8)
    }

    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        self.expect_tag(Tag::Bytes)?;
        self.sized()
    }

    pub fn list(&mut self) -> Result<ListIter<'a>> {
        self.body(Tag::List).map(|items| ListIter { items })
    }

    pub fn map(&mut self) -> Result<MapIter<'a>> {
        self.body(Tag::Map).map(|entries| MapIter { entries })
    }

    /// `None`, or a decoder over the present value.
    pub fn option(&mut self) -> Result<Option<Decoder<'a>>> {
        if self.peek_tag()? == Tag::OptionNone {
            self.take(1)?;
            return Ok(None);
        }
        self.body(Tag::OptionSome).map(Some)
    }

    /// The entry name and a decoder over its value.
    pub fn variant(&mut self) -> Result<(&'a str, Decoder<'a>)> {
        let mut entry = self.body(Tag::Variant)?;
        let name = entry.str()?;
        Ok((name, entry))
    }
}

#[derive(Debug)]
pub struct ListIter<'a> {
    items: Decoder<'a>,
}

impl<'a> ListIter<'a> {
    /// A decoder holding exactly the next item.
    pub fn next(&mut self) -> Result<Option<Decoder<'a>>> {
        if self.items.remaining() == 0 {
            return Ok(None);
        }
        let before = self.items.rest;
        self.items.skip()?;
        let used = before.len() - self.items.remaining();
        Ok(Some(Decoder::new(&before[..used])))
    }
}

#[derive(Debug)]
pub struct MapIter<'a> {
    entries: Decoder<'a>,
}

impl<'a> MapIter<'a> {
    pub fn next(&mut self) -> Result<Option<(&'a str, Decoder<'a>)>> {
        if self.entries.remaining() == 0 {
            return Ok(None);
        }
        self.entries.variant().map(Some)
    }
}
