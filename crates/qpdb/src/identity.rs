//! PE debug directory decoding: the PDB identity of an executable image.
//!
//! Every PE image built with debug info carries a CodeView record in its debug
//! directory. Two record formats are in use:
//!
//! - `RSDS` (PDB 7.0): 16-byte GUID, u32 age, NUL-terminated PDB path
//! - `NB10` (PDB 2.0): u32 offset (unused), u32 signature, u32 age, NUL-terminated PDB path
//!
//! The (name, GUID/signature, age) triple pins the exact PDB that describes the
//! image and is the key used by symbol servers.
//!
//! All header fields are read with explicit bounds-checked little-endian readers;
//! nothing derived from the file is trusted before it is range-checked.

use crate::error::{QpdbError, QpdbResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

const DOS_MAGIC: &[u8; 2] = b"MZ";
const PE_SIGNATURE: &[u8; 4] = b"PE\0\0";
/// Offset of `e_lfanew` inside the DOS header.
const E_LFANEW_OFFSET: usize = 0x3c;
const FILE_HEADER_SIZE: usize = 20;

const MACHINE_I386: u16 = 0x014c;
const MACHINE_AMD64: u16 = 0x8664;
const MACHINE_ARM64: u16 = 0xaa64;

const DEBUG_DIRECTORY_INDEX: usize = 6;
const DATA_DIRECTORY_SIZE: usize = 8;
const SECTION_HEADER_SIZE: usize = 40;
const DEBUG_ENTRY_SIZE: usize = 28;
const DEBUG_TYPE_CODEVIEW: u32 = 2;

const RSDS_SIGNATURE: &[u8; 4] = b"RSDS";
const NB10_SIGNATURE: &[u8; 4] = b"NB10";
/// 4 (sig) + 16 (GUID) + 4 (age).
const RSDS_HEADER_SIZE: usize = 24;
/// 4 (sig) + 4 (offset) + 4 (signature) + 4 (age).
const NB10_HEADER_SIZE: usize = 16;

/// The (PDB name, unique id, age) triple embedded in an executable image.
///
/// Serialized with the wire names used by the query endpoints: `name`, `guid`, `age`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DebugIdentity {
    /// PDB file name without directories (e.g. "ntkrnlmp.pdb").
    #[serde(rename = "name")]
    pub file_name: String,
    /// 32 uppercase hex chars (RSDS GUID) or 8 uppercase hex chars (NB10 signature).
    #[serde(rename = "guid", deserialize_with = "crate::types::deserialize_unique_id")]
    pub unique_id: String,
    #[serde(deserialize_with = "crate::types::deserialize_age")]
    pub age: u32,
}

impl DebugIdentity {
    pub fn new(file_name: impl Into<String>, unique_id: impl Into<String>, age: u32) -> Self {
        DebugIdentity {
            file_name: file_name.into(),
            unique_id: unique_id.into(),
            age,
        }
    }

    /// An identity is usable only when both the PDB name and the unique id are present.
    pub fn is_valid(&self) -> bool {
        !self.file_name.is_empty() && !self.unique_id.is_empty()
    }

    /// Decode the identity from raw image bytes.
    pub fn from_image(image: &[u8]) -> QpdbResult<Self> {
        extract_identity(image)
    }

    /// Read an image from disk and decode its identity.
    pub fn from_file(path: impl AsRef<Path>) -> QpdbResult<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        extract_identity(&bytes)
    }
}

/// Bounds-checked little-endian reads over an image buffer.
struct ImageBytes<'a> {
    data: &'a [u8],
}

impl<'a> ImageBytes<'a> {
    fn slice(&self, offset: usize, len: usize, what: &str) -> QpdbResult<&'a [u8]> {
        offset
            .checked_add(len)
            .and_then(|end| self.data.get(offset..end))
            .ok_or_else(|| {
                QpdbError::malformed_image(format!(
                    "{} at {:#x} (+{}) is outside the image ({} bytes)",
                    what,
                    offset,
                    len,
                    self.data.len()
                ))
            })
    }

    fn u16(&self, offset: usize, what: &str) -> QpdbResult<u16> {
        let b = self.slice(offset, 2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&self, offset: usize, what: &str) -> QpdbResult<u32> {
        let b = self.slice(offset, 4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// One entry of the section header table.
#[derive(Debug, Clone, Copy)]
struct Section {
    virtual_address: u32,
    virtual_size: u32,
    raw_size: u32,
    raw_pointer: u32,
}

impl Section {
    fn read(img: &ImageBytes<'_>, offset: usize) -> QpdbResult<Self> {
        Ok(Section {
            virtual_size: img.u32(offset + 8, "section VirtualSize")?,
            virtual_address: img.u32(offset + 12, "section VirtualAddress")?,
            raw_size: img.u32(offset + 16, "section SizeOfRawData")?,
            raw_pointer: img.u32(offset + 20, "section PointerToRawData")?,
        })
    }

    fn contains(&self, rva: u32) -> bool {
        let start = u64::from(self.virtual_address);
        let extent = u64::from(self.virtual_size.max(self.raw_size));
        let rva = u64::from(rva);
        rva >= start && rva < start + extent
    }
}

/// Translate an RVA into a file offset via the first section that maps it.
fn rva_to_offset(sections: &[Section], rva: u32) -> Option<usize> {
    let section = sections.iter().find(|s| s.contains(rva))?;
    let offset = u64::from(rva - section.virtual_address) + u64::from(section.raw_pointer);
    usize::try_from(offset).ok()
}

/// Locate the debug directory and decode the CodeView record it points at.
///
/// Returns an empty (invalid) identity when the image simply has no usable
/// debug record; returns an error when the headers themselves are inconsistent.
pub fn extract_identity(image: &[u8]) -> QpdbResult<DebugIdentity> {
    let img = ImageBytes { data: image };

    if img.slice(0, 2, "DOS header")? != DOS_MAGIC {
        return Err(QpdbError::malformed_image("missing MZ signature"));
    }
    let nt_offset = img.u32(E_LFANEW_OFFSET, "e_lfanew")? as usize;
    if img.slice(nt_offset, 4, "PE signature")? != PE_SIGNATURE {
        return Err(QpdbError::malformed_image(format!(
            "missing PE signature at {:#x}",
            nt_offset
        )));
    }

    let file_header = nt_offset + 4;
    let machine = img.u16(file_header, "Machine")?;
    let section_count = img.u16(file_header + 2, "NumberOfSections")? as usize;
    let optional_size = img.u16(file_header + 16, "SizeOfOptionalHeader")? as usize;
    let optional_header = file_header + FILE_HEADER_SIZE;

    // PE32 and PE32+ share a prefix but differ in where the directory array starts.
    let (rva_count_offset, directories_offset) = match machine {
        MACHINE_I386 => (92, 96),
        MACHINE_AMD64 | MACHINE_ARM64 => (108, 112),
        other => return Err(QpdbError::UnsupportedImage(other)),
    };

    let rva_count = img.u32(optional_header + rva_count_offset, "NumberOfRvaAndSizes")? as usize;
    if rva_count <= DEBUG_DIRECTORY_INDEX {
        debug!("Image has {} data directories, no debug directory", rva_count);
        return Ok(DebugIdentity::default());
    }

    let debug_dir =
        optional_header + directories_offset + DEBUG_DIRECTORY_INDEX * DATA_DIRECTORY_SIZE;
    let debug_rva = img.u32(debug_dir, "debug directory RVA")?;
    let debug_size = img.u32(debug_dir + 4, "debug directory size")? as usize;
    if debug_rva == 0 || debug_size == 0 {
        debug!("Image debug directory is empty");
        return Ok(DebugIdentity::default());
    }

    let section_table = optional_header + optional_size;
    let sections = (0..section_count)
        .map(|i| Section::read(&img, section_table + i * SECTION_HEADER_SIZE))
        .collect::<QpdbResult<Vec<_>>>()?;

    let debug_offset = rva_to_offset(&sections, debug_rva).ok_or_else(|| {
        QpdbError::malformed_image(format!(
            "debug directory RVA {:#x} is not mapped by any section",
            debug_rva
        ))
    })?;

    let entry = select_debug_entry(&img, debug_offset, (debug_size / DEBUG_ENTRY_SIZE).max(1))?;
    let data_size = img.u32(entry + 16, "debug SizeOfData")? as usize;
    let data_pointer = img.u32(entry + 24, "debug PointerToRawData")? as usize;
    if data_size == 0 {
        debug!("Debug directory entry has no data");
        return Ok(DebugIdentity::default());
    }

    parse_codeview(image, data_pointer, data_size)
}

/// Pick the first CodeView entry of the debug directory, or the first entry if none is.
fn select_debug_entry(img: &ImageBytes<'_>, offset: usize, count: usize) -> QpdbResult<usize> {
    for i in 0..count {
        let entry = offset + i * DEBUG_ENTRY_SIZE;
        if img.u32(entry + 12, "debug entry Type")? == DEBUG_TYPE_CODEVIEW {
            return Ok(entry);
        }
    }
    Ok(offset)
}

/// Decode an RSDS or NB10 CodeView record at `pointer`.
fn parse_codeview(image: &[u8], pointer: usize, size: usize) -> QpdbResult<DebugIdentity> {
    if pointer >= image.len() {
        return Err(QpdbError::malformed_image(format!(
            "CodeView record at {:#x} is outside the image",
            pointer
        )));
    }
    let end = pointer.saturating_add(size).min(image.len());
    let record = &image[pointer..end];

    let signature = record.get(..4).unwrap_or_default();
    if signature == RSDS_SIGNATURE {
        let header = record.get(..RSDS_HEADER_SIZE).ok_or_else(|| {
            QpdbError::malformed_image(format!("truncated RSDS record ({} bytes)", record.len()))
        })?;
        let mut guid_bytes = [0u8; 16];
        guid_bytes.copy_from_slice(&header[4..20]);
        let age = u32::from_le_bytes([header[20], header[21], header[22], header[23]]);
        Ok(DebugIdentity {
            file_name: read_name(&record[RSDS_HEADER_SIZE..]),
            unique_id: format_guid(&guid_bytes),
            age,
        })
    } else if signature == NB10_SIGNATURE {
        let header = record.get(..NB10_HEADER_SIZE).ok_or_else(|| {
            QpdbError::malformed_image(format!("truncated NB10 record ({} bytes)", record.len()))
        })?;
        let pdb_signature = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        let age = u32::from_le_bytes([header[12], header[13], header[14], header[15]]);
        Ok(DebugIdentity {
            file_name: read_name(&record[NB10_HEADER_SIZE..]),
            unique_id: format!("{:08X}", pdb_signature),
            age,
        })
    } else {
        debug!("Unrecognized CodeView signature {:02x?}", signature);
        Ok(DebugIdentity::default())
    }
}

/// Read a NUL-terminated name, stopping at the end of the record if no NUL is present.
///
/// Linkers often record the full build path (`D:\\out\\foo.pdb`); symbol
/// servers key on the file name alone, so only the last component is kept.
fn read_name(bytes: &[u8]) -> String {
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let name = String::from_utf8_lossy(&bytes[..len]);
    match name.rfind(|c: char| c == '\\' || c == '/') {
        Some(pos) => name[pos + 1..].to_string(),
        None => name.into_owned(),
    }
}

/// Format a 16-byte GUID as 32 uppercase hex chars, symbol-server style.
///
/// The GUID is stored as:
///   - Data1: u32 LE (bytes 0..4)
///   - Data2: u16 LE (bytes 4..6)
///   - Data3: u16 LE (bytes 6..8)
///   - Data4: 8 bytes as-is (bytes 8..16)
pub fn format_guid(guid_bytes: &[u8; 16]) -> String {
    let data1 = u32::from_le_bytes([guid_bytes[0], guid_bytes[1], guid_bytes[2], guid_bytes[3]]);
    let data2 = u16::from_le_bytes([guid_bytes[4], guid_bytes[5]]);
    let data3 = u16::from_le_bytes([guid_bytes[6], guid_bytes[7]]);

    let mut out = format!("{:08X}{:04X}{:04X}", data1, data2, data3);
    for b in &guid_bytes[8..] {
        out.push_str(&format!("{:02X}", b));
    }
    out
}
