//! PDB-backed query engine.
//!
//! A `PdbFile` is opened once per request and answers symbol, struct and enum
//! queries against the file's global symbol stream and TPI stream. Records are
//! decoded from the `pdb` crate's `TypeData`/`SymbolData` into the reader-neutral
//! model in [`crate::records`], then resolved by [`crate::resolve`].

use crate::error::{QpdbError, QpdbResult};
use crate::records::{FieldEntry, IntegerLayout, SymbolRecord, TypeIndex, TypeLookup, TypeRecord};
use crate::resolve::{self, CompleteTypes, SymbolCollector};
use crate::types::{EnumMap, NestedQuery, StructMap, SymbolMap};
use pdb::{FallibleIterator, PrimitiveKind, TypeData, TypeFinder, Variant};
use std::collections::BTreeSet;
use std::fs::File;
use std::path::Path;
use tracing::debug;

/// An open PDB file.
pub struct PdbFile {
    pdb: pdb::PDB<'static, File>,
}

impl PdbFile {
    /// Open a PDB and validate its MSF container.
    pub fn open(path: impl AsRef<Path>) -> QpdbResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            QpdbError::MalformedPdb(format!("opening {}: {}", path.display(), e))
        })?;
        let pdb = pdb::PDB::open(file).map_err(|e| {
            QpdbError::MalformedPdb(format!("{}: {}", path.display(), e))
        })?;
        Ok(PdbFile { pdb })
    }

    /// Addresses (RVAs) of the requested public and global data symbols.
    pub fn resolve_symbols(&mut self, names: &BTreeSet<String>) -> QpdbResult<SymbolMap> {
        let global_symbols = self.pdb.global_symbols()?;
        let address_map = self.pdb.address_map()?;

        let mut collector = SymbolCollector::new(names);
        let mut iter = global_symbols.iter();
        while let Some(sym) = iter.next()? {
            let (name, offset) = match sym.parse() {
                Ok(pdb::SymbolData::Public(p)) => (p.name, p.offset),
                Ok(pdb::SymbolData::Data(d)) if d.global => (d.name, d.offset),
                _ => continue,
            };
            if let Some(rva) = offset.to_rva(&address_map) {
                collector.offer(SymbolRecord {
                    name: name.to_string().into_owned(),
                    address: u64::from(rva.0),
                });
            }
            if collector.is_complete() {
                break;
            }
        }

        let found = collector.finish();
        debug!("Resolved {}/{} symbols", found.len(), names.len());
        Ok(found)
    }

    /// Field offsets of the requested structures.
    pub fn resolve_structs(&mut self, query: &NestedQuery) -> QpdbResult<StructMap> {
        let type_info = self.pdb.type_information()?;
        let (finder, complete) = index_types(&type_info, query)?;
        debug!(
            "Found {}/{} complete struct definitions",
            complete.struct_count(),
            query.len()
        );
        resolve::resolve_structs(&PdbTypes { finder }, &complete, query)
    }

    /// Enumerator values of the requested enums.
    pub fn resolve_enums(&mut self, query: &NestedQuery) -> QpdbResult<EnumMap> {
        let type_info = self.pdb.type_information()?;
        let (finder, complete) = index_types(&type_info, query)?;
        debug!(
            "Found {}/{} complete enum definitions",
            complete.enum_count(),
            query.len()
        );
        resolve::resolve_enums(&PdbTypes { finder }, &complete, query)
    }
}

/// Single pass over the TPI stream: fill the random-access finder and note the
/// complete definitions of every requested name.
fn index_types<'t>(
    type_info: &'t pdb::TypeInformation<'_>,
    query: &NestedQuery,
) -> QpdbResult<(TypeFinder<'t>, CompleteTypes)> {
    let mut finder = type_info.finder();
    let mut complete = CompleteTypes::new();

    let mut iter = type_info.iter();
    while let Some(item) = iter.next()? {
        finder.update(&iter);
        // Only named definitions matter here; skip decoding the rest.
        if let Ok(data) = item.parse() {
            if matches!(
                data,
                TypeData::Class(_) | TypeData::Union(_) | TypeData::Enumeration(_)
            ) {
                complete.observe(&convert_type(data), query);
            }
        }
    }

    Ok((finder, complete))
}

/// Random access over the TPI stream through the crate's `TypeFinder`.
struct PdbTypes<'t> {
    finder: TypeFinder<'t>,
}

impl TypeLookup for PdbTypes<'_> {
    fn lookup(&self, index: TypeIndex) -> QpdbResult<Option<TypeRecord>> {
        let item = match self.finder.find(pdb::TypeIndex(index)) {
            Ok(item) => item,
            Err(pdb::Error::TypeNotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match item.parse() {
            Ok(data) => Ok(Some(convert_type(data))),
            Err(e) => {
                debug!("Skipping undecodable type {:#x}: {}", index, e);
                Ok(None)
            }
        }
    }
}

/// Convert a decoded `pdb` type record into the reader-neutral model.
fn convert_type(data: TypeData<'_>) -> TypeRecord {
    match data {
        TypeData::Class(c) => TypeRecord::Structure {
            name: c.name.to_string().into_owned(),
            forward_ref: c.properties.forward_reference(),
            field_list: c.fields.map(|f| f.0),
            size: c.size,
        },
        TypeData::Union(u) => TypeRecord::Structure {
            name: u.name.to_string().into_owned(),
            forward_ref: u.properties.forward_reference(),
            field_list: Some(u.fields.0),
            size: u.size,
        },
        TypeData::Enumeration(e) => TypeRecord::Enum {
            name: e.name.to_string().into_owned(),
            forward_ref: e.properties.forward_reference(),
            underlying_type: e.underlying_type.0,
            field_list: e.fields.0,
        },
        TypeData::FieldList(fl) => TypeRecord::FieldList {
            entries: fl.fields.into_iter().map(convert_field).collect(),
            continuation: fl.continuation.map(|c| c.0),
        },
        TypeData::Bitfield(b) => TypeRecord::Bitfield {
            base_type: b.underlying_type.0,
            bit_offset: b.position,
            bit_size: b.length,
        },
        TypeData::Modifier(m) => TypeRecord::Modifier {
            underlying_type: m.underlying_type.0,
        },
        TypeData::Primitive(p) if p.indirection.is_none() => match primitive_kind_layout(&p.kind) {
            Some(layout) => TypeRecord::Primitive(layout),
            None => TypeRecord::Other,
        },
        _ => TypeRecord::Other,
    }
}

fn convert_field(data: TypeData<'_>) -> FieldEntry {
    match data {
        TypeData::Member(m) => FieldEntry::Member {
            name: m.name.to_string().into_owned(),
            type_ref: m.field_type.0,
            offset: m.offset,
        },
        TypeData::Enumerate(e) => FieldEntry::Enumerate {
            name: e.name.to_string().into_owned(),
            value: variant_to_i64(&e.value),
        },
        _ => FieldEntry::Other,
    }
}

/// Widen a numeric leaf to i64 according to its own signedness.
pub fn variant_to_i64(v: &Variant) -> i64 {
    match *v {
        Variant::U8(x) => i64::from(x),
        Variant::U16(x) => i64::from(x),
        Variant::U32(x) => i64::from(x),
        Variant::U64(x) => x as i64,
        Variant::I8(x) => i64::from(x),
        Variant::I16(x) => i64::from(x),
        Variant::I32(x) => i64::from(x),
        Variant::I64(x) => x,
    }
}

/// Integer layout of a primitive kind; `None` for non-integers.
fn primitive_kind_layout(kind: &PrimitiveKind) -> Option<IntegerLayout> {
    let layout = match kind {
        PrimitiveKind::Char | PrimitiveKind::RChar | PrimitiveKind::I8 => IntegerLayout::new(1, true),
        PrimitiveKind::UChar | PrimitiveKind::U8 | PrimitiveKind::Bool8 => {
            IntegerLayout::new(1, false)
        }
        PrimitiveKind::Short | PrimitiveKind::I16 => IntegerLayout::new(2, true),
        PrimitiveKind::UShort
        | PrimitiveKind::U16
        | PrimitiveKind::Bool16
        | PrimitiveKind::WChar
        | PrimitiveKind::RChar16 => IntegerLayout::new(2, false),
        PrimitiveKind::Long | PrimitiveKind::I32 | PrimitiveKind::HRESULT => {
            IntegerLayout::new(4, true)
        }
        PrimitiveKind::ULong | PrimitiveKind::U32 | PrimitiveKind::Bool32 | PrimitiveKind::RChar32 => {
            IntegerLayout::new(4, false)
        }
        PrimitiveKind::Quad | PrimitiveKind::I64 => IntegerLayout::new(8, true),
        PrimitiveKind::UQuad | PrimitiveKind::U64 | PrimitiveKind::Bool64 => {
            IntegerLayout::new(8, false)
        }
        _ => return None,
    };
    Some(layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture;
    use crate::types::FieldInfo;
    use tempfile::NamedTempFile;

    fn open_sample() -> (NamedTempFile, PdbFile) {
        let tmp = NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), fixture::kernel_sample()).unwrap();
        let pdb = PdbFile::open(tmp.path()).unwrap();
        (tmp, pdb)
    }

    fn names(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn nested(entries: &[(&str, &[&str])]) -> NestedQuery {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), names(v)))
            .collect()
    }

    #[test]
    fn test_variant_to_i64() {
        assert_eq!(variant_to_i64(&Variant::U8(42)), 42);
        assert_eq!(variant_to_i64(&Variant::U32(0xFFFF_FFFF)), 0xFFFF_FFFF);
        assert_eq!(variant_to_i64(&Variant::U64(u64::MAX)), -1);
        assert_eq!(variant_to_i64(&Variant::I8(-1)), -1);
        assert_eq!(variant_to_i64(&Variant::I16(-100)), -100);
        assert_eq!(variant_to_i64(&Variant::I64(i64::MIN)), i64::MIN);
    }

    #[test]
    fn test_primitive_kind_layout() {
        assert_eq!(primitive_kind_layout(&PrimitiveKind::Long), Some(IntegerLayout::new(4, true)));
        assert_eq!(primitive_kind_layout(&PrimitiveKind::ULong), Some(IntegerLayout::new(4, false)));
        assert_eq!(primitive_kind_layout(&PrimitiveKind::UChar), Some(IntegerLayout::new(1, false)));
        assert_eq!(primitive_kind_layout(&PrimitiveKind::I64), Some(IntegerLayout::new(8, true)));
        assert_eq!(primitive_kind_layout(&PrimitiveKind::U8), Some(IntegerLayout::new(1, false)));
        assert_eq!(primitive_kind_layout(&PrimitiveKind::RChar), Some(IntegerLayout::new(1, true)));
        assert_eq!(primitive_kind_layout(&PrimitiveKind::F64), None);
        assert_eq!(primitive_kind_layout(&PrimitiveKind::Void), None);
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let res = PdbFile::open(dir.path().join("absent.pdb"));
        assert!(matches!(res, Err(QpdbError::MalformedPdb(_))));
    }

    #[test]
    fn test_open_garbage() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), vec![0x41u8; 4096]).unwrap();
        assert!(matches!(PdbFile::open(tmp.path()), Err(QpdbError::MalformedPdb(_))));
    }

    #[test]
    fn test_resolve_symbols_from_pdb() {
        let (_tmp, mut pdb) = open_sample();
        let found = pdb
            .resolve_symbols(&names(&[
                "PsActiveProcessHead",
                "KiServiceTable",
                "KiLocalOnly",
                "NoSuchSymbol",
            ]))
            .unwrap();
        assert_eq!(found.len(), 2);
        // First of the two public records wins.
        assert_eq!(found["PsActiveProcessHead"], 0x20_0010);
        assert_eq!(found["KiServiceTable"], 0x1800);
    }

    #[test]
    fn test_resolve_structs_from_pdb() {
        let (_tmp, mut pdb) = open_sample();
        let q = nested(&[
            (
                "_KPROCESS",
                &["DirectoryTableBase", "AutoAlignment", "ProcessListEntry", "NoSuchField"],
            ),
            ("_EPROCESS", &["UniqueProcessId", "ActiveProcessLinks"]),
            ("_NO_SUCH_STRUCT", &["x"]),
        ]);
        let result = pdb.resolve_structs(&q).unwrap();

        assert_eq!(result.len(), 2);
        let kprocess = &result["_KPROCESS"];
        assert_eq!(kprocess.len(), 3);
        assert_eq!(kprocess["DirectoryTableBase"], FieldInfo::new(0x28, 0));
        assert_eq!(kprocess["AutoAlignment"], FieldInfo::new(0x278, 4));
        assert_eq!(kprocess["ProcessListEntry"], FieldInfo::new(0x350, 0));
        assert_eq!(result["_EPROCESS"]["UniqueProcessId"], FieldInfo::new(0x440, 0));
        assert_eq!(result["_EPROCESS"]["ActiveProcessLinks"], FieldInfo::new(0x448, 0));
    }

    #[test]
    fn test_resolve_enums_from_pdb() {
        let (_tmp, mut pdb) = open_sample();
        let q = nested(&[
            ("_POOL_TYPE", &["NonPagedPool", "PagedPool", "NonPagedPoolNx", "Invalid"]),
            ("_BYTE_FLAGS", &["Low", "High"]),
            ("_CHAR_FLAGS", &["High"]),
            ("_MASK", &["All", "NoSuchValue"]),
            ("_NO_SUCH_ENUM", &["x"]),
        ]);
        let result = pdb.resolve_enums(&q).unwrap();

        assert_eq!(result.len(), 4);
        assert_eq!(result["_POOL_TYPE"]["NonPagedPool"], 0);
        assert_eq!(result["_POOL_TYPE"]["PagedPool"], 1);
        assert_eq!(result["_POOL_TYPE"]["NonPagedPoolNx"], 512);
        assert_eq!(result["_POOL_TYPE"]["Invalid"], -1);
        assert_eq!(result["_BYTE_FLAGS"]["Low"], 1);
        assert_eq!(result["_BYTE_FLAGS"]["High"], 255);
        assert_eq!(result["_CHAR_FLAGS"]["High"], -1);
        assert_eq!(result["_MASK"].len(), 1);
        assert_eq!(result["_MASK"]["All"], 0xFFFF_FFFF);
    }

    #[test]
    fn test_type_lookup_decodes_primitive_indices() {
        let (_tmp, mut pdb) = open_sample();
        let type_info = pdb.pdb.type_information().unwrap();
        let (finder, _) = index_types(&type_info, &NestedQuery::new()).unwrap();
        let types = PdbTypes { finder };

        assert_eq!(
            types.lookup(fixture::T_UINT1).unwrap(),
            Some(TypeRecord::Primitive(IntegerLayout::new(1, false)))
        );
        assert_eq!(
            types.lookup(fixture::T_RCHAR).unwrap(),
            Some(TypeRecord::Primitive(IntegerLayout::new(1, true)))
        );
        assert_eq!(
            types.lookup(fixture::T_INT4).unwrap(),
            Some(TypeRecord::Primitive(IntegerLayout::new(4, true)))
        );
        assert_eq!(types.lookup(fixture::T_64PVOID).unwrap(), Some(TypeRecord::Other));
        assert_eq!(
            types.lookup(0x1001).unwrap(),
            Some(TypeRecord::Bitfield {
                base_type: fixture::T_ULONG,
                bit_offset: 4,
                bit_size: 1,
            })
        );
        assert_eq!(types.lookup(0x2000).unwrap(), None);
    }
}
