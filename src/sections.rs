//! Section table parsing and RVA translation.
//!
//! The section table is parsed once, right after the NT headers; from then on
//! it is the authority for converting RVAs into file offsets. Sections keep
//! their on-disk order and the first section containing an RVA wins.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::*;
use crate::utils::ReadExt;

/// Parsed section table for RVA resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionTable {
    sections: Vec<Section>,
    data_len: usize,
}

impl SectionTable {
    pub fn new(sections: Vec<Section>, data_len: usize) -> Self {
        Self { sections, data_len }
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Find a section by its short (8-byte) name.
    pub fn section_by_name(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.header.name() == name)
    }

    /// First section whose virtual range contains `rva`.
    pub fn section_containing_rva(&self, rva: u64) -> Option<&Section> {
        self.sections.iter().find(|s| s.header.contains_rva(rva))
    }

    /// Translate an RVA to a file offset through the enclosing section.
    /// Fails when no section contains the RVA or the computed offset points
    /// past the end of the image.
    pub fn rva_to_offset(&self, rva: u64) -> Option<usize> {
        let section = self.section_containing_rva(rva)?;
        let delta = rva - section.header.virtual_address as u64;
        let offset = (section.header.pointer_to_raw_data as u64).checked_add(delta)?;
        if offset > self.data_len as u64 {
            return None;
        }
        Some(offset as usize)
    }
}

/// Parse the section table that follows the optional header. Truncated
/// headers end the walk; the sections read so far are kept.
pub fn parse_sections(data: &[u8], nt: &NtHeaderInfo) -> Vec<Section> {
    let coff = &nt.headers.file_header;
    let first = nt.offset as usize + 24 + coff.size_of_optional_header as usize;
    let count = coff.number_of_sections as usize;
    let mut sections = Vec::new();

    for i in 0..count {
        let offset = first + i * SECTION_HEADER_SIZE;
        let header = match read_section_header(data, offset) {
            Some(h) => h,
            None => {
                debug!(index = i, "section table truncated");
                break;
            }
        };
        let real_name = resolve_section_name(data, &header, coff);
        sections.push(Section {
            offset: offset as u32,
            header,
            real_name,
        });
    }

    sections
}

fn read_section_header(data: &[u8], offset: usize) -> Option<SectionHeader> {
    let name_bytes = data.read_slice_at(offset, 8)?;
    let mut name = [0u8; 8];
    name.copy_from_slice(name_bytes);

    Some(SectionHeader {
        name,
        virtual_size: data.read_u32_le_at(offset + 8)?,
        virtual_address: data.read_u32_le_at(offset + 12)?,
        size_of_raw_data: data.read_u32_le_at(offset + 16)?,
        pointer_to_raw_data: data.read_u32_le_at(offset + 20)?,
        pointer_to_relocations: data.read_u32_le_at(offset + 24)?,
        pointer_to_line_numbers: data.read_u32_le_at(offset + 28)?,
        number_of_relocations: data.read_u16_le_at(offset + 32)?,
        number_of_line_numbers: data.read_u16_le_at(offset + 34)?,
        characteristics: data.read_u32_le_at(offset + 36)?,
    })
}

/// Resolve a section's real name. A name beginning with `/` is a decimal
/// offset into the COFF string table, which sits right after the symbol
/// table (18 bytes per symbol). Unresolvable long names come back empty.
fn resolve_section_name(data: &[u8], header: &SectionHeader, coff: &CoffHeader) -> String {
    if header.name[0] != b'/' {
        return header.name();
    }

    let digits = &header.name[1..];
    let end = digits.iter().position(|&b| b == 0).unwrap_or(digits.len());
    let offset: usize = match std::str::from_utf8(&digits[..end])
        .ok()
        .and_then(|s| s.parse().ok())
    {
        Some(n) => n,
        None => return String::new(),
    };

    let string_table = coff.pointer_to_symbol_table as usize;
    let table_offset = string_table
        .checked_add(coff.number_of_symbols as usize * COFF_SYMBOL_SIZE)
        .and_then(|base| base.checked_add(offset));

    table_offset
        .and_then(|o| data.read_cstring_at(o, MAX_NAME_LEN))
        .map(str::to_string)
        .unwrap_or_default()
}
