//! Name-based resolution over decoded records.
//!
//! Each query is answered from a single pass over the type stream: the pass
//! records the first complete (non-forward) definition of every requested
//! structure or enum, and field lists are then fetched by index. Forward
//! references therefore resolve to the complete definition wherever it sits in
//! the stream.
//!
//! Names that cannot be resolved are omitted from the results.

use crate::error::QpdbResult;
use crate::records::{FieldEntry, IntegerLayout, SymbolRecord, TypeIndex, TypeLookup, TypeRecord};
use crate::types::{EnumMap, FieldInfo, NestedQuery, StructMap, SymbolMap};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

/// Enum underlying type when it cannot be determined (C `int`).
const DEFAULT_ENUM_LAYOUT: IntegerLayout = IntegerLayout::new(4, true);
/// Bound on modifier/typedef chains when resolving an enum's width.
const MAX_TYPE_CHAIN: usize = 16;

#[derive(Debug, Clone, Copy)]
struct EnumDef {
    underlying_type: TypeIndex,
    field_list: TypeIndex,
}

/// First complete definition of each requested structure and enum.
#[derive(Debug, Default)]
pub struct CompleteTypes {
    structs: HashMap<String, Option<TypeIndex>>,
    enums: HashMap<String, EnumDef>,
}

impl CompleteTypes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `record` if it is a complete definition of a name in `query`.
    pub fn observe(&mut self, record: &TypeRecord, query: &NestedQuery) {
        match record {
            TypeRecord::Structure {
                name,
                forward_ref: false,
                field_list,
                ..
            } if query.contains_key(name) => {
                self.structs.entry(name.clone()).or_insert(*field_list);
            }
            TypeRecord::Enum {
                name,
                forward_ref: false,
                underlying_type,
                field_list,
            } if query.contains_key(name) => {
                self.enums.entry(name.clone()).or_insert(EnumDef {
                    underlying_type: *underlying_type,
                    field_list: *field_list,
                });
            }
            _ => {}
        }
    }

    pub fn struct_count(&self) -> usize {
        self.structs.len()
    }

    pub fn enum_count(&self) -> usize {
        self.enums.len()
    }
}

/// Resolve requested fields of requested structures.
pub fn resolve_structs(
    types: &impl TypeLookup,
    complete: &CompleteTypes,
    query: &NestedQuery,
) -> QpdbResult<StructMap> {
    let mut result = StructMap::new();

    for (name, wanted) in query {
        let Some(field_list) = complete.structs.get(name) else {
            debug!("No complete definition for struct {}", name);
            continue;
        };

        let mut fields = BTreeMap::new();
        if let Some(list) = field_list {
            walk_field_list(types, *list, |entry| {
                if let FieldEntry::Member {
                    name,
                    type_ref,
                    offset,
                } = entry
                {
                    if wanted.contains(name) && !fields.contains_key(name) {
                        let bit = bitfield_position(types, *type_ref)?;
                        fields.insert(name.clone(), FieldInfo::new(*offset as i64, bit));
                    }
                }
                Ok(())
            })?;
        }
        result.insert(name.clone(), fields);
    }

    Ok(result)
}

/// Resolve requested enumerators of requested enums.
pub fn resolve_enums(
    types: &impl TypeLookup,
    complete: &CompleteTypes,
    query: &NestedQuery,
) -> QpdbResult<EnumMap> {
    let mut result = EnumMap::new();

    for (name, wanted) in query {
        let Some(def) = complete.enums.get(name) else {
            debug!("No complete definition for enum {}", name);
            continue;
        };

        let layout = integer_layout(types, def.underlying_type)?;
        let mut values = BTreeMap::new();
        walk_field_list(types, def.field_list, |entry| {
            if let FieldEntry::Enumerate { name, value } = entry {
                if wanted.contains(name) {
                    values.entry(name.clone()).or_insert(layout.extend(*value));
                }
            }
            Ok(())
        })?;
        result.insert(name.clone(), values);
    }

    Ok(result)
}

/// Visit every entry of a field list, following continuation records.
fn walk_field_list<F>(types: &impl TypeLookup, start: TypeIndex, mut visit: F) -> QpdbResult<()>
where
    F: FnMut(&FieldEntry) -> QpdbResult<()>,
{
    let mut next = Some(start);
    let mut seen = HashSet::new();

    while let Some(index) = next {
        if !seen.insert(index) {
            warn!("Field list continuation cycle at type {:#x}", index);
            break;
        }
        match types.lookup(index)? {
            Some(TypeRecord::FieldList {
                entries,
                continuation,
            }) => {
                for entry in &entries {
                    visit(entry)?;
                }
                next = continuation;
            }
            _ => {
                debug!("Type {:#x} is not a field list", index);
                break;
            }
        }
    }
    Ok(())
}

/// Bit position of a member whose type is a bitfield, `0` otherwise.
fn bitfield_position(types: &impl TypeLookup, type_ref: TypeIndex) -> QpdbResult<i64> {
    match types.lookup(type_ref)? {
        Some(TypeRecord::Bitfield { bit_offset, .. }) => Ok(i64::from(bit_offset)),
        _ => Ok(0),
    }
}

/// Width and signedness of an enum's underlying type.
fn integer_layout(types: &impl TypeLookup, index: TypeIndex) -> QpdbResult<IntegerLayout> {
    let mut current = index;
    for _ in 0..MAX_TYPE_CHAIN {
        match types.lookup(current)? {
            Some(TypeRecord::Primitive(layout)) => return Ok(layout),
            Some(TypeRecord::Modifier { underlying_type })
            | Some(TypeRecord::Enum {
                underlying_type, ..
            }) => current = underlying_type,
            _ => break,
        }
    }
    debug!("Falling back to 32-bit signed layout for type {:#x}", index);
    Ok(DEFAULT_ENUM_LAYOUT)
}

/// Collects addresses for a fixed set of symbol names; the first record for a name wins.
#[derive(Debug)]
pub struct SymbolCollector<'q> {
    wanted: &'q BTreeSet<String>,
    found: SymbolMap,
}

impl<'q> SymbolCollector<'q> {
    pub fn new(wanted: &'q BTreeSet<String>) -> Self {
        SymbolCollector {
            wanted,
            found: SymbolMap::new(),
        }
    }

    pub fn offer(&mut self, symbol: SymbolRecord) {
        if self.wanted.contains(&symbol.name) && !self.found.contains_key(&symbol.name) {
            self.found.insert(symbol.name, symbol.address as i64);
        }
    }

    /// True once every requested name has an address.
    pub fn is_complete(&self) -> bool {
        self.found.len() == self.wanted.len()
    }

    pub fn finish(self) -> SymbolMap {
        self.found
    }
}
