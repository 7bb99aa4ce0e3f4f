//! Decoded PDB records, independent of the container reader.
//!
//! Only the record kinds the queries need are modelled; everything else decodes
//! to `Other`. Primitive types are encoded entirely in their index; readers
//! decode them into `TypeRecord::Primitive` like any other lookup.

use crate::error::QpdbResult;
use std::collections::HashMap;

/// Index of a record in the TPI stream.
pub type TypeIndex = u32;

/// A record from the type stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeRecord {
    /// Class, struct, interface or union.
    Structure {
        name: String,
        forward_ref: bool,
        field_list: Option<TypeIndex>,
        size: u64,
    },
    FieldList {
        entries: Vec<FieldEntry>,
        continuation: Option<TypeIndex>,
    },
    Bitfield {
        base_type: TypeIndex,
        bit_offset: u8,
        bit_size: u8,
    },
    Enum {
        name: String,
        forward_ref: bool,
        underlying_type: TypeIndex,
        field_list: TypeIndex,
    },
    /// const/volatile/unaligned wrapper.
    Modifier { underlying_type: TypeIndex },
    /// Integer primitive (no indirection). Pointers and floats decode to `Other`.
    Primitive(IntegerLayout),
    Other,
}

/// An entry of a field list.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldEntry {
    Member {
        name: String,
        type_ref: TypeIndex,
        offset: u64,
    },
    /// Enumerator; `value` is the stored constant widened to i64 by its own leaf type.
    Enumerate { name: String, value: i64 },
    Other,
}

/// A named address from the symbol stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolRecord {
    pub name: String,
    /// Relative virtual address.
    pub address: u64,
}

/// Width and signedness of an integer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegerLayout {
    pub size: u8,
    pub signed: bool,
}

impl IntegerLayout {
    pub const fn new(size: u8, signed: bool) -> Self {
        IntegerLayout { size, signed }
    }

    /// Reinterpret `raw` as an integer of this width, then sign- or zero-extend it.
    pub fn extend(self, raw: i64) -> i64 {
        let bits = u32::from(self.size) * 8;
        if bits == 0 || bits >= 64 {
            return raw;
        }
        let shift = 64 - bits;
        if self.signed {
            (raw << shift) >> shift
        } else {
            ((raw as u64) << shift >> shift) as i64
        }
    }
}

/// Random access into the type stream by index.
pub trait TypeLookup {
    /// Fetch a record; `Ok(None)` when the index is not present in the stream.
    fn lookup(&self, index: TypeIndex) -> QpdbResult<Option<TypeRecord>>;
}

impl TypeLookup for HashMap<TypeIndex, TypeRecord> {
    fn lookup(&self, index: TypeIndex) -> QpdbResult<Option<TypeRecord>> {
        Ok(self.get(&index).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extend_signed_32() {
        assert_eq!(IntegerLayout::new(4, true).extend(0xFFFF_FFFF), -1);
        assert_eq!(IntegerLayout::new(4, true).extend(0x7FFF_FFFF), 0x7FFF_FFFF);
    }

    #[test]
    fn test_extend_unsigned_32() {
        assert_eq!(IntegerLayout::new(4, false).extend(0xFFFF_FFFF), 0xFFFF_FFFF);
        // A negative leaf under an unsigned type is truncated to the type width.
        assert_eq!(IntegerLayout::new(4, false).extend(-1), 0xFFFF_FFFF);
    }

    #[test]
    fn test_extend_narrow_and_wide() {
        assert_eq!(IntegerLayout::new(1, true).extend(0x80), -128);
        assert_eq!(IntegerLayout::new(2, false).extend(-2), 0xFFFE);
        assert_eq!(IntegerLayout::new(8, true).extend(-5), -5);
        assert_eq!(IntegerLayout::new(8, false).extend(i64::MIN), i64::MIN);
    }

    #[test]
    fn test_hashmap_lookup() {
        let mut table = HashMap::new();
        table.insert(0x1000, TypeRecord::Modifier { underlying_type: 0x74 });
        assert!(table.lookup(0x1000).unwrap().is_some());
        assert!(table.lookup(0x1001).unwrap().is_none());
    }
}
