//! Structural check of lib0 v1 updates before they reach Yrs.
//!
//! Yrs decodes string payloads without UTF-8 validation and sizes some
//! allocations straight from length prefixes. Updates come from untrusted
//! peers, so [`check_update_v1`] walks the fields `Update::decode_v1` reads,
//! in the same order, and rejects anything the decoder cannot take safely:
//!
//! - string payloads that are not UTF-8
//! - element counts larger than the bytes left to hold them
//! - varints wider than the integer they decode into
//! - block clocks and delete ranges that overflow `u32`
//! - `Any` values nested deeper than [`MAX_ANY_DEPTH`]
//! - content kinds this server does not relay (moves, weak links)
//!
//! Layout walked:
//! ```text
//! update      = clients:var { blocks:var client:var clock:var block* } delete_set
//! block       = info:u8 ( len:var                       ; GC, Skip
//!                       | [origin] [right] [parent] content )
//! delete_set  = clients:var { client:var ranges:var { clock:var len:var }* }
//! ```

use yrs::block::{
    BLOCK_GC_REF_NUMBER, BLOCK_ITEM_ANY_REF_NUMBER, BLOCK_ITEM_BINARY_REF_NUMBER,
    BLOCK_ITEM_DELETED_REF_NUMBER, BLOCK_ITEM_DOC_REF_NUMBER, BLOCK_ITEM_EMBED_REF_NUMBER,
    BLOCK_ITEM_FORMAT_REF_NUMBER, BLOCK_ITEM_JSON_REF_NUMBER, BLOCK_ITEM_STRING_REF_NUMBER,
    BLOCK_ITEM_TYPE_REF_NUMBER, BLOCK_SKIP_REF_NUMBER, HAS_ORIGIN, HAS_PARENT_SUB,
    HAS_RIGHT_ORIGIN,
};
use yrs::encoding::read::Error;
use yrs::types::{
    TYPE_REFS_ARRAY, TYPE_REFS_DOC, TYPE_REFS_MAP, TYPE_REFS_TEXT, TYPE_REFS_UNDEFINED,
    TYPE_REFS_XML_ELEMENT, TYPE_REFS_XML_FRAGMENT, TYPE_REFS_XML_HOOK, TYPE_REFS_XML_TEXT,
};

/// Deepest `Any` array/map nesting accepted.
pub const MAX_ANY_DEPTH: usize = 64;

/// Content ref bits of a block's info byte.
const CONTENT_REF_MASK: u8 = 0b0000_1111;

/// Longest lib0 signed varint accepted; covers every integer a JS number holds.
const MAX_SIGNED_VARINT_LEN: usize = 9;

/// Walk a v1 update without decoding it.
///
/// `Ok` means `Update::decode_v1` only sees UTF-8 strings, allocation sizes
/// backed by input bytes and clocks that fit in `u32`.
pub fn check_update_v1(update: &[u8]) -> Result<(), Error> {
    let mut reader = Reader::new(update);

    // blocks count + client + clock
    let clients = reader.count(3)?;
    for _ in 0..clients {
        let blocks = reader.count(1)?;
        reader.var_u32()?;
        let mut clock = u64::from(reader.var_u32()?);
        for _ in 0..blocks {
            clock += block(&mut reader)?;
            if clock > u64::from(u32::MAX) {
                return Err(Error::Custom("block clock overflows u32".into()));
            }
        }
    }

    delete_set(&mut reader)
}

/// Walk one block. Returns an upper bound of the clock span it covers.
fn block(reader: &mut Reader<'_>) -> Result<u64, Error> {
    let info = reader.u8()?;
    if info == BLOCK_GC_REF_NUMBER || info == BLOCK_SKIP_REF_NUMBER {
        return Ok(u64::from(reader.var_u32()?));
    }

    let cant_copy_parent_info = info & (HAS_ORIGIN | HAS_RIGHT_ORIGIN) == 0;
    if info & HAS_ORIGIN != 0 {
        id(reader)?;
    }
    if info & HAS_RIGHT_ORIGIN != 0 {
        id(reader)?;
    }
    if cant_copy_parent_info {
        if reader.var_u32()? == 1 {
            reader.string()?;
        } else {
            id(reader)?;
        }
        if info & HAS_PARENT_SUB != 0 {
            reader.string()?;
        }
    }

    content(reader, info & CONTENT_REF_MASK)
}

fn content(reader: &mut Reader<'_>, content_ref: u8) -> Result<u64, Error> {
    match content_ref {
        BLOCK_ITEM_DELETED_REF_NUMBER => Ok(u64::from(reader.var_u32()?)),
        BLOCK_ITEM_JSON_REF_NUMBER => {
            // Decoder reads one entry past the count
            let entries = reader.count(1)? + 1;
            if entries > reader.remaining() {
                return Err(Error::EndOfBuffer(entries));
            }
            for _ in 0..entries {
                reader.string()?;
            }
            Ok(entries as u64)
        }
        BLOCK_ITEM_BINARY_REF_NUMBER => {
            reader.buf()?;
            Ok(1)
        }
        // UTF-8 byte length bounds the UTF-16 length Yrs counts
        BLOCK_ITEM_STRING_REF_NUMBER => Ok(reader.string()?.len() as u64),
        BLOCK_ITEM_EMBED_REF_NUMBER => {
            reader.string()?;
            Ok(1)
        }
        BLOCK_ITEM_FORMAT_REF_NUMBER => {
            reader.string()?;
            reader.string()?;
            Ok(1)
        }
        BLOCK_ITEM_TYPE_REF_NUMBER => {
            type_ref(reader)?;
            Ok(1)
        }
        BLOCK_ITEM_ANY_REF_NUMBER => {
            let values = reader.count(1)?;
            for _ in 0..values {
                any(reader, 0)?;
            }
            Ok(values as u64)
        }
        BLOCK_ITEM_DOC_REF_NUMBER => {
            reader.string()?;
            any(reader, 0)?;
            Ok(1)
        }
        _ => Err(Error::UnexpectedValue),
    }
}

fn type_ref(reader: &mut Reader<'_>) -> Result<(), Error> {
    match reader.u8()? {
        TYPE_REFS_XML_ELEMENT => reader.string().map(drop),
        TYPE_REFS_ARRAY | TYPE_REFS_MAP | TYPE_REFS_TEXT | TYPE_REFS_XML_FRAGMENT
        | TYPE_REFS_XML_HOOK | TYPE_REFS_XML_TEXT | TYPE_REFS_DOC | TYPE_REFS_UNDEFINED => Ok(()),
        _ => Err(Error::UnexpectedValue),
    }
}

/// lib0 `Any`, tags 116..=127.
fn any(reader: &mut Reader<'_>, depth: usize) -> Result<(), Error> {
    if depth > MAX_ANY_DEPTH {
        return Err(Error::Custom("value nested too deeply".into()));
    }
    match reader.u8()? {
        // undefined, null, false, true
        127 | 126 | 121 | 120 => Ok(()),
        125 => reader.var_i64(),
        124 => reader.bytes(4).map(drop),
        123 | 122 => reader.bytes(8).map(drop),
        119 => reader.string().map(drop),
        118 => {
            // key length + value tag
            let entries = reader.count(2)?;
            for _ in 0..entries {
                reader.string()?;
                any(reader, depth + 1)?;
            }
            Ok(())
        }
        117 => {
            let values = reader.count(1)?;
            for _ in 0..values {
                any(reader, depth + 1)?;
            }
            Ok(())
        }
        116 => reader.buf(),
        _ => Err(Error::UnexpectedValue),
    }
}

fn id(reader: &mut Reader<'_>) -> Result<(), Error> {
    reader.var_u32()?;
    reader.var_u32()?;
    Ok(())
}

fn delete_set(reader: &mut Reader<'_>) -> Result<(), Error> {
    // client + ranges count
    let clients = reader.count(2)?;
    for _ in 0..clients {
        reader.var_u32()?;
        let ranges = reader.count(2)?;
        for _ in 0..ranges {
            let clock = reader.var_u32()?;
            let len = reader.var_u32()?;
            if clock.checked_add(len).is_none() {
                return Err(Error::Custom("delete range overflows u32".into()));
            }
        }
    }
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    next: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, next: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.next
    }

    fn u8(&mut self) -> Result<u8, Error> {
        let byte = *self.buf.get(self.next).ok_or(Error::EndOfBuffer(1))?;
        self.next += 1;
        Ok(byte)
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if len > self.remaining() {
            return Err(Error::EndOfBuffer(len));
        }
        let slice = &self.buf[self.next..self.next + len];
        self.next += len;
        Ok(slice)
    }

    /// Unsigned LEB128 holding at most 64 significant bits.
    fn var_u64(&mut self) -> Result<u64, Error> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = self.u8()?;
            let payload = u64::from(byte & 0x7F);
            if shift == 63 && payload > 1 {
                return Err(Error::InvalidVarInt);
            }
            value |= payload << shift;
            if byte < 0x80 {
                return Ok(value);
            }
        }
        Err(Error::InvalidVarInt)
    }

    fn var_u32(&mut self) -> Result<u32, Error> {
        u32::try_from(self.var_u64()?).map_err(|_| Error::InvalidVarInt)
    }

    /// lib0 signed varint: sign and six bits, then seven bits per byte.
    fn var_i64(&mut self) -> Result<(), Error> {
        for _ in 0..MAX_SIGNED_VARINT_LEN {
            if self.u8()? < 0x80 {
                return Ok(());
            }
        }
        Err(Error::InvalidVarInt)
    }

    /// Element count where each element takes at least `min_size` bytes.
    fn count(&mut self, min_size: usize) -> Result<usize, Error> {
        let count = self.var_u32()? as usize;
        if count.saturating_mul(min_size) > self.remaining() {
            return Err(Error::EndOfBuffer(count));
        }
        Ok(count)
    }

    fn buf(&mut self) -> Result<(), Error> {
        let len = self.var_u32()? as usize;
        self.bytes(len).map(drop)
    }

    fn string(&mut self) -> Result<&'a str, Error> {
        let len = self.var_u32()? as usize;
        let bytes = self.bytes(len)?;
        std::str::from_utf8(bytes).map_err(|e| Error::Custom(format!("invalid string: {e}")))
    }
}
