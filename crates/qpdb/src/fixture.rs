//! In-memory PDB writer for tests.
//!
//! Emits an MSF 7.00 container holding only what the query engine reads: a
//! TPI stream, a DBI header whose debug-header list names the section header
//! stream, the global symbol records and the section headers. Type records are
//! laid out and padded the way the MSVC linker writes them.

use crate::records::TypeIndex;

const MSF_MAGIC: &[u8; 32] = b"Microsoft C/C++ MSF 7.00\r\n\x1a\x44\x53\x00\x00\x00";
const PAGE_SIZE: usize = 0x1000;

const TPI_VERSION_V80: u32 = 20040203;
const TPI_HEADER_SIZE: u32 = 56;
const DBI_VERSION_V70: u32 = 19990903;
const NO_STREAM: u16 = 0xffff;

const TPI_STREAM: usize = 2;
const DBI_STREAM: usize = 3;
const SYMBOL_RECORDS_STREAM: u16 = 5;
const SECTION_HEADERS_STREAM: u16 = 6;

const LF_MODIFIER: u16 = 0x1001;
const LF_FIELDLIST: u16 = 0x1203;
const LF_BITFIELD: u16 = 0x1205;
const LF_INDEX: u16 = 0x1404;
const LF_ENUMERATE: u16 = 0x1502;
const LF_STRUCTURE: u16 = 0x1505;
const LF_ENUM: u16 = 0x1507;
const LF_MEMBER: u16 = 0x150d;

const LF_SHORT: u16 = 0x8001;
const LF_USHORT: u16 = 0x8002;
const LF_LONG: u16 = 0x8003;
const LF_ULONG: u16 = 0x8004;
const LF_QUADWORD: u16 = 0x8009;
const LF_UQUADWORD: u16 = 0x800a;

const S_LDATA32: u16 = 0x110c;
const S_GDATA32: u16 = 0x110d;
const S_PUB32: u16 = 0x110e;

const PROP_FORWARD_REF: u16 = 0x0080;
const ATTR_PUBLIC: u16 = 0x0003;
const MODIFIER_CONST: u16 = 0x0001;

/// An entry of a field list record.
#[derive(Debug, Clone)]
pub enum Field<'a> {
    Member {
        name: &'a str,
        type_index: TypeIndex,
        offset: u64,
    },
    Enumerate { name: &'a str, value: i64 },
}

/// Builds a PDB image one record at a time.
#[derive(Debug, Default)]
pub struct PdbBuilder {
    types: Vec<Vec<u8>>,
    symbols: Vec<u8>,
    section_addresses: Vec<u32>,
}

impl PdbBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a section at `virtual_address`; returns its 1-based section number.
    pub fn section(&mut self, virtual_address: u32) -> u16 {
        self.section_addresses.push(virtual_address);
        self.section_addresses.len() as u16
    }

    pub fn structure(
        &mut self,
        name: &str,
        field_list: Option<TypeIndex>,
        size: u64,
        member_count: u16,
    ) -> TypeIndex {
        self.class_record(name, field_list, size, member_count, 0)
    }

    /// A forward reference: no field list, no size.
    pub fn forward_structure(&mut self, name: &str) -> TypeIndex {
        self.class_record(name, None, 0, 0, PROP_FORWARD_REF)
    }

    fn class_record(
        &mut self,
        name: &str,
        field_list: Option<TypeIndex>,
        size: u64,
        member_count: u16,
        properties: u16,
    ) -> TypeIndex {
        let mut body = Vec::new();
        put_u16(&mut body, member_count);
        put_u16(&mut body, properties);
        put_u32(&mut body, field_list.unwrap_or(0));
        put_u32(&mut body, 0); // derived
        put_u32(&mut body, 0); // vshape
        put_unsigned(&mut body, size);
        put_cstr(&mut body, name);
        self.push_type(LF_STRUCTURE, body)
    }

    pub fn enumeration(
        &mut self,
        name: &str,
        underlying_type: TypeIndex,
        field_list: TypeIndex,
        count: u16,
    ) -> TypeIndex {
        let mut body = Vec::new();
        put_u16(&mut body, count);
        put_u16(&mut body, 0);
        put_u32(&mut body, underlying_type);
        put_u32(&mut body, field_list);
        put_cstr(&mut body, name);
        self.push_type(LF_ENUM, body)
    }

    pub fn field_list(&mut self, fields: &[Field<'_>], continuation: Option<TypeIndex>) -> TypeIndex {
        let mut body = Vec::new();
        for field in fields {
            let mut entry = Vec::new();
            match *field {
                Field::Member {
                    name,
                    type_index,
                    offset,
                } => {
                    put_u16(&mut entry, LF_MEMBER);
                    put_u16(&mut entry, ATTR_PUBLIC);
                    put_u32(&mut entry, type_index);
                    put_unsigned(&mut entry, offset);
                    put_cstr(&mut entry, name);
                }
                Field::Enumerate { name, value } => {
                    put_u16(&mut entry, LF_ENUMERATE);
                    put_u16(&mut entry, ATTR_PUBLIC);
                    put_signed(&mut entry, value);
                    put_cstr(&mut entry, name);
                }
            }
            pad_to_dword(&mut entry, 0);
            body.extend_from_slice(&entry);
        }
        if let Some(next) = continuation {
            let mut entry = Vec::new();
            put_u16(&mut entry, LF_INDEX);
            put_u32(&mut entry, next);
            pad_to_dword(&mut entry, 0);
            body.extend_from_slice(&entry);
        }
        self.push_type(LF_FIELDLIST, body)
    }

    pub fn bitfield(&mut self, base_type: TypeIndex, length: u8, position: u8) -> TypeIndex {
        let mut body = Vec::new();
        put_u32(&mut body, base_type);
        body.push(length);
        body.push(position);
        self.push_type(LF_BITFIELD, body)
    }

    /// A `const` wrapper around `underlying_type`.
    pub fn constant(&mut self, underlying_type: TypeIndex) -> TypeIndex {
        let mut body = Vec::new();
        put_u32(&mut body, underlying_type);
        put_u16(&mut body, MODIFIER_CONST);
        self.push_type(LF_MODIFIER, body)
    }

    fn push_type(&mut self, leaf: u16, body: Vec<u8>) -> TypeIndex {
        let mut data = Vec::with_capacity(body.len() + 4);
        put_u16(&mut data, leaf);
        data.extend_from_slice(&body);
        // The record's u16 length prefix counts towards alignment.
        pad_to_dword(&mut data, 2);
        self.types.push(data);
        0x1000 + self.types.len() as TypeIndex - 1
    }

    pub fn public(&mut self, name: &str, section: u16, offset: u32) {
        let mut body = Vec::new();
        put_u32(&mut body, 0); // flags
        put_u32(&mut body, offset);
        put_u16(&mut body, section);
        put_cstr(&mut body, name);
        self.push_symbol(S_PUB32, body);
    }

    pub fn global_data(&mut self, name: &str, type_index: TypeIndex, section: u16, offset: u32) {
        self.data_symbol(S_GDATA32, name, type_index, section, offset);
    }

    pub fn local_data(&mut self, name: &str, type_index: TypeIndex, section: u16, offset: u32) {
        self.data_symbol(S_LDATA32, name, type_index, section, offset);
    }

    fn data_symbol(&mut self, kind: u16, name: &str, type_index: TypeIndex, section: u16, offset: u32) {
        let mut body = Vec::new();
        put_u32(&mut body, type_index);
        put_u32(&mut body, offset);
        put_u16(&mut body, section);
        put_cstr(&mut body, name);
        self.push_symbol(kind, body);
    }

    fn push_symbol(&mut self, kind: u16, body: Vec<u8>) {
        let mut data = Vec::with_capacity(body.len() + 4);
        put_u16(&mut data, kind);
        data.extend_from_slice(&body);
        while (data.len() + 2) % 4 != 0 {
            data.push(0);
        }
        put_u16(&mut self.symbols, data.len() as u16);
        self.symbols.extend_from_slice(&data);
    }

    /// Serialize the container.
    pub fn build(&self) -> Vec<u8> {
        let mut streams: Vec<Option<Vec<u8>>> = vec![None; 7];
        streams[TPI_STREAM] = Some(self.tpi_stream());
        streams[DBI_STREAM] = Some(dbi_stream());
        streams[usize::from(SYMBOL_RECORDS_STREAM)] = Some(self.symbols.clone());
        streams[usize::from(SECTION_HEADERS_STREAM)] = Some(self.section_headers());
        write_msf(&streams)
    }

    fn tpi_stream(&self) -> Vec<u8> {
        let records: Vec<u8> = self
            .types
            .iter()
            .flat_map(|data| {
                let mut record = (data.len() as u16).to_le_bytes().to_vec();
                record.extend_from_slice(data);
                record
            })
            .collect();

        let mut stream = Vec::with_capacity(TPI_HEADER_SIZE as usize + records.len());
        put_u32(&mut stream, TPI_VERSION_V80);
        put_u32(&mut stream, TPI_HEADER_SIZE);
        put_u32(&mut stream, 0x1000);
        put_u32(&mut stream, 0x1000 + self.types.len() as u32);
        put_u32(&mut stream, records.len() as u32);
        put_u16(&mut stream, NO_STREAM); // hash stream
        put_u16(&mut stream, NO_STREAM); // hash aux stream
        put_u32(&mut stream, 4); // hash key size
        put_u32(&mut stream, 0x3ffff); // hash buckets
        stream.extend_from_slice(&[0; 24]); // hash value / index offset / adjuster slices
        stream.extend_from_slice(&records);
        stream
    }

    fn section_headers(&self) -> Vec<u8> {
        let mut stream = Vec::with_capacity(self.section_addresses.len() * 40);
        for (i, va) in self.section_addresses.iter().enumerate() {
            let mut name = [0u8; 8];
            let label = format!(".sec{}", i + 1);
            name[..label.len()].copy_from_slice(label.as_bytes());
            stream.extend_from_slice(&name);
            put_u32(&mut stream, 0x1000); // virtual size
            put_u32(&mut stream, *va);
            stream.extend_from_slice(&[0; 20]); // raw data, relocations, line numbers
            put_u32(&mut stream, 0x4000_0040); // initialized, readable
        }
        stream
    }
}

fn dbi_stream() -> Vec<u8> {
    let mut extra = Vec::new();
    // Eleven optional debug streams; slot 5 holds the section headers.
    for slot in 0..11 {
        put_u16(&mut extra, if slot == 5 { SECTION_HEADERS_STREAM } else { NO_STREAM });
    }

    let mut stream = Vec::with_capacity(64 + extra.len());
    put_u32(&mut stream, u32::MAX); // new-style header
    put_u32(&mut stream, DBI_VERSION_V70);
    put_u32(&mut stream, 1); // age
    put_u16(&mut stream, NO_STREAM); // global symbol hash
    put_u16(&mut stream, 0);
    put_u16(&mut stream, NO_STREAM); // public symbol hash
    put_u16(&mut stream, 0);
    put_u16(&mut stream, SYMBOL_RECORDS_STREAM);
    put_u16(&mut stream, 0);
    for _ in 0..6 {
        put_u32(&mut stream, 0); // modules, contributions, section map, files, type servers, MFC index
    }
    put_u32(&mut stream, extra.len() as u32);
    put_u32(&mut stream, 0); // EC substream
    put_u16(&mut stream, 0); // flags
    put_u16(&mut stream, 0x8664); // AMD64
    put_u32(&mut stream, 0);
    stream.extend_from_slice(&extra);
    stream
}

/// Lay out `streams` as an MSF file: header page, directory page list,
/// directory, then each stream on consecutive pages. `None` marks an absent stream.
fn write_msf(streams: &[Option<Vec<u8>>]) -> Vec<u8> {
    let pages_for = |len: usize| len.div_ceil(PAGE_SIZE);
    let stream_pages: usize = streams.iter().flatten().map(|s| pages_for(s.len())).sum();

    let mut directory = Vec::new();
    put_u32(&mut directory, streams.len() as u32);
    for stream in streams {
        put_u32(&mut directory, stream.as_ref().map_or(u32::MAX, |s| s.len() as u32));
    }
    let directory_pages = pages_for(directory.len() + 4 * stream_pages);
    let first_stream_page = 2 + directory_pages;
    let mut next_page = first_stream_page as u32;
    for stream in streams.iter().flatten() {
        for _ in 0..pages_for(stream.len()) {
            put_u32(&mut directory, next_page);
            next_page += 1;
        }
    }
    let total_pages = next_page as usize;

    let mut file = vec![0u8; total_pages * PAGE_SIZE];

    let mut header = MSF_MAGIC.to_vec();
    put_u32(&mut header, PAGE_SIZE as u32);
    put_u32(&mut header, 1); // free page map
    put_u32(&mut header, total_pages as u32);
    put_u32(&mut header, directory.len() as u32);
    put_u32(&mut header, 0);
    put_u32(&mut header, 1); // page holding the directory page list
    write_page(&mut file, 0, &header);

    let mut directory_page_list = Vec::new();
    for page in 0..directory_pages {
        put_u32(&mut directory_page_list, (2 + page) as u32);
    }
    write_page(&mut file, 1, &directory_page_list);
    write_page(&mut file, 2, &directory);

    let mut page = first_stream_page;
    for stream in streams.iter().flatten() {
        write_page(&mut file, page, stream);
        page += pages_for(stream.len());
    }
    file
}

fn write_page(file: &mut [u8], page: usize, data: &[u8]) {
    let start = page * PAGE_SIZE;
    file[start..start + data.len()].copy_from_slice(data);
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_cstr(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

/// Numeric leaf for sizes and offsets.
fn put_unsigned(buf: &mut Vec<u8>, v: u64) {
    if v < 0x8000 {
        put_u16(buf, v as u16);
    } else if let Ok(v) = u16::try_from(v) {
        put_u16(buf, LF_USHORT);
        put_u16(buf, v);
    } else if let Ok(v) = u32::try_from(v) {
        put_u16(buf, LF_ULONG);
        put_u32(buf, v);
    } else {
        put_u16(buf, LF_UQUADWORD);
        buf.extend_from_slice(&v.to_le_bytes());
    }
}

/// Numeric leaf for enumerator values, using the narrowest encoding.
fn put_signed(buf: &mut Vec<u8>, v: i64) {
    if v >= 0 {
        return put_unsigned(buf, v as u64);
    }
    if let Ok(v) = i16::try_from(v) {
        put_u16(buf, LF_SHORT);
        buf.extend_from_slice(&v.to_le_bytes());
    } else if let Ok(v) = i32::try_from(v) {
        put_u16(buf, LF_LONG);
        buf.extend_from_slice(&v.to_le_bytes());
    } else {
        put_u16(buf, LF_QUADWORD);
        buf.extend_from_slice(&v.to_le_bytes());
    }
}

/// Append `LF_PAD` bytes until `buf.len() + offset` is a multiple of four.
fn pad_to_dword(buf: &mut Vec<u8>, offset: usize) {
    let pad = (4 - (buf.len() + offset) % 4) % 4;
    for remaining in (1..=pad).rev() {
        buf.push(0xf0 | remaining as u8);
    }
}

/// Type index of `unsigned __int64`.
pub const T_UQUAD: TypeIndex = 0x23;
/// Type index of `unsigned long`.
pub const T_ULONG: TypeIndex = 0x22;
/// Type index of `int`.
pub const T_INT4: TypeIndex = 0x74;
/// Type index of `unsigned int`.
pub const T_UINT4: TypeIndex = 0x75;
/// Type index of `unsigned __int8`.
pub const T_UINT1: TypeIndex = 0x69;
/// Type index of `char`.
pub const T_RCHAR: TypeIndex = 0x70;
/// Type index of a 64-bit `void *`.
pub const T_64PVOID: TypeIndex = 0x0603;

/// A small kernel-shaped PDB.
///
/// Types:
/// - `_KPROCESS`: forward reference first, then the complete definition with
///   `Header` (0x0), `DirectoryTableBase` (0x28), `AutoAlignment` (bitfield at
///   bit 4 of the ULONG at 0x278) and `ProcessListEntry` (0x350), the last one
///   in a continuation field list.
/// - `_EPROCESS`: `Pcb` (0x0), `UniqueProcessId` (0x440), `ActiveProcessLinks` (0x448).
/// - `_POOL_TYPE` over `int`: `NonPagedPool` 0, `PagedPool` 1, `NonPagedPoolNx` 512,
///   `Invalid` -1.
/// - `_BYTE_FLAGS` over `unsigned __int8` and `_CHAR_FLAGS` over `char`, both
///   with `Low` 1 and `High` 0xFF.
/// - `_MASK` over `const unsigned int`: `All` 0xFFFFFFFF.
///
/// Symbols (section 1 at 0x1000, section 2 at 0x200000):
/// - public `PsActiveProcessHead` at 0x200010, then a second public with the
///   same name at 0x200090
/// - global data `KiServiceTable` at 0x1800
/// - local data `KiLocalOnly` at 0x200020
pub fn kernel_sample() -> Vec<u8> {
    let mut b = PdbBuilder::new();

    b.forward_structure("_KPROCESS");
    let auto_alignment = b.bitfield(T_ULONG, 1, 4);
    let tail = b.field_list(
        &[Field::Member {
            name: "ProcessListEntry",
            type_index: T_UQUAD,
            offset: 0x350,
        }],
        None,
    );
    let head = b.field_list(
        &[
            Field::Member {
                name: "Header",
                type_index: T_INT4,
                offset: 0,
            },
            Field::Member {
                name: "DirectoryTableBase",
                type_index: T_UQUAD,
                offset: 0x28,
            },
            Field::Member {
                name: "AutoAlignment",
                type_index: auto_alignment,
                offset: 0x278,
            },
        ],
        Some(tail),
    );
    let kprocess = b.structure("_KPROCESS", Some(head), 0x438, 4);

    let eprocess_fields = b.field_list(
        &[
            Field::Member {
                name: "Pcb",
                type_index: kprocess,
                offset: 0,
            },
            Field::Member {
                name: "UniqueProcessId",
                type_index: T_64PVOID,
                offset: 0x440,
            },
            Field::Member {
                name: "ActiveProcessLinks",
                type_index: T_UQUAD,
                offset: 0x448,
            },
        ],
        None,
    );
    b.structure("_EPROCESS", Some(eprocess_fields), 0xa40, 3);

    let pool_values = b.field_list(
        &[
            Field::Enumerate { name: "NonPagedPool", value: 0 },
            Field::Enumerate { name: "PagedPool", value: 1 },
            Field::Enumerate { name: "NonPagedPoolNx", value: 512 },
            Field::Enumerate { name: "Invalid", value: -1 },
        ],
        None,
    );
    b.enumeration("_POOL_TYPE", T_INT4, pool_values, 4);

    let byte_values = b.field_list(
        &[
            Field::Enumerate { name: "Low", value: 1 },
            Field::Enumerate { name: "High", value: 0xFF },
        ],
        None,
    );
    b.enumeration("_BYTE_FLAGS", T_UINT1, byte_values, 2);
    b.enumeration("_CHAR_FLAGS", T_RCHAR, byte_values, 2);

    let const_uint = b.constant(T_UINT4);
    let mask_values = b.field_list(
        &[Field::Enumerate {
            name: "All",
            value: 0xFFFF_FFFF,
        }],
        None,
    );
    b.enumeration("_MASK", const_uint, mask_values, 1);

    let text = b.section(0x1000);
    let data = b.section(0x20_0000);
    b.public("PsActiveProcessHead", data, 0x10);
    b.global_data("KiServiceTable", T_64PVOID, text, 0x800);
    b.local_data("KiLocalOnly", T_UINT4, data, 0x20);
    b.public("PsActiveProcessHead", data, 0x90);

    b.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_records_are_dword_aligned() {
        let mut b = PdbBuilder::new();
        b.forward_structure("_A");
        b.bitfield(T_ULONG, 1, 4);
        b.field_list(
            &[Field::Enumerate {
                name: "Negative",
                value: -70000,
            }],
            Some(0x1000),
        );
        for data in &b.types {
            assert_eq!((data.len() + 2) % 4, 0);
        }
    }

    #[test]
    fn test_numeric_leaves() {
        let mut buf = Vec::new();
        put_unsigned(&mut buf, 0x7fff);
        put_unsigned(&mut buf, 0x8000);
        put_signed(&mut buf, -1);
        assert_eq!(buf, [0xff, 0x7f, 0x02, 0x80, 0x00, 0x80, 0x01, 0x80, 0xff, 0xff]);
    }

    #[test]
    fn test_msf_layout() {
        let file = kernel_sample();
        assert_eq!(file.len() % PAGE_SIZE, 0);
        assert!(file.starts_with(MSF_MAGIC));
        let pages = u32::from_le_bytes([file[40], file[41], file[42], file[43]]);
        assert_eq!(pages as usize * PAGE_SIZE, file.len());
    }
}
