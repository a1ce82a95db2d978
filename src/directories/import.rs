//! Import directory parsing.
//!
//! One `IMAGE_IMPORT_DESCRIPTOR` per module, terminated by a descriptor with
//! a zero name. Each descriptor points at a zero-terminated chain of
//! pointer-width thunks; a thunk with the high bit set imports by ordinal,
//! anything else addresses a hint/name record. PE32 and PE32+ share the walk
//! and differ only in thunk width and ordinal flag.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::directories::{directory_entry, read_string_at_rva};
use crate::sections::SectionTable;
use crate::types::{
    DataDirectory, DIRECTORY_ENTRY_IMPORT, MAX_NAME_LEN, ORDINAL_FLAG32, ORDINAL_FLAG64,
};
use crate::utils::ReadExt;

/// Very unlikely a real PE imports more than 1000 modules; anything past the
/// cap is a bogus count and the walk ends silently.
pub const MAX_IMPORT_MODULES: usize = 1000;
/// Same reasoning per module.
pub const MAX_IMPORT_FUNCTIONS: usize = 5000;

pub(crate) const IMPORT_DESCRIPTOR_SIZE: usize = 20;

/// Raw `IMAGE_IMPORT_DESCRIPTOR` (20 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportDescriptor {
    pub original_first_thunk: u32,
    pub time_date_stamp: u32,
    pub forwarder_chain: u32,
    pub name: u32,
    pub first_thunk: u32,
}

/// One imported function: the raw thunk slot plus its decoded meaning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportFunction {
    /// Raw thunk value, widened to 64 bits for PE32 images.
    pub thunk: u64,
    pub ordinal: Option<u16>,
    pub hint: Option<u16>,
    pub name: Option<String>,
}

/// All functions imported from one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportModule {
    /// File offset of this import descriptor.
    pub offset: u32,
    pub descriptor: ImportDescriptor,
    pub dll_name: String,
    pub functions: Vec<ImportFunction>,
}

pub(crate) fn read_import_descriptor(data: &[u8], offset: usize) -> Option<ImportDescriptor> {
    Some(ImportDescriptor {
        original_first_thunk: data.read_u32_le_at(offset)?,
        time_date_stamp: data.read_u32_le_at(offset + 4)?,
        forwarder_chain: data.read_u32_le_at(offset + 8)?,
        name: data.read_u32_le_at(offset + 12)?,
        first_thunk: data.read_u32_le_at(offset + 16)?,
    })
}

/// Walk the import descriptor table. `None` when the directory address does
/// not resolve to a section; `Some(vec![])` is a present-but-empty table.
pub fn parse_imports(
    data: &[u8],
    sections: &SectionTable,
    dirs: &[DataDirectory],
    is_64: bool,
) -> Option<Vec<ImportModule>> {
    let dir = directory_entry(dirs, DIRECTORY_ENTRY_IMPORT)?;
    let mut desc_offset = sections.rva_to_offset(dir.virtual_address as u64)?;

    let mut modules = Vec::new();
    let mut module_count = 0usize;

    loop {
        let descriptor = match read_import_descriptor(data, desc_offset) {
            Some(d) => d,
            None => break,
        };
        if descriptor.name == 0 {
            break;
        }

        // Prefer the original (unbound) thunk chain; fall back to the IAT.
        let thunk_rva = if descriptor.original_first_thunk != 0 {
            descriptor.original_first_thunk
        } else {
            descriptor.first_thunk
        };

        if thunk_rva != 0 {
            let thunk_offset = match sections.rva_to_offset(thunk_rva as u64) {
                Some(o) => o,
                None => break,
            };
            let functions = walk_thunks(data, sections, thunk_offset, is_64);
            let dll_name = read_string_at_rva(data, sections, descriptor.name);
            modules.push(ImportModule {
                offset: desc_offset as u32,
                descriptor,
                dll_name,
                functions,
            });
        }

        desc_offset += IMPORT_DESCRIPTOR_SIZE;
        module_count += 1;
        if module_count == MAX_IMPORT_MODULES {
            warn!(cap = MAX_IMPORT_MODULES, "import module cap reached");
            break;
        }
    }

    Some(modules)
}

pub(crate) fn read_thunk(data: &[u8], offset: usize, is_64: bool) -> Option<u64> {
    if is_64 {
        data.read_u64_le_at(offset)
    } else {
        data.read_u32_le_at(offset).map(u64::from)
    }
}

pub(crate) fn is_ordinal_thunk(thunk: u64, is_64: bool) -> bool {
    if is_64 {
        thunk & ORDINAL_FLAG64 != 0
    } else {
        thunk & u64::from(ORDINAL_FLAG32) != 0
    }
}

/// Resolve a thunk's hint/name record. The caller has already excluded the
/// ordinal flag, so the low 32 bits of the thunk are the record's RVA; for
/// PE32+ thunks bit 31 is a live RVA bit, not a flag.
pub(crate) fn resolve_hint_name(
    data: &[u8],
    sections: &SectionTable,
    thunk: u64,
) -> (Option<u16>, Option<String>) {
    let hint_name_rva = thunk as u32;
    match sections.rva_to_offset(hint_name_rva as u64) {
        Some(offset) => {
            let hint = data.read_u16_le_at(offset);
            let name = data
                .read_cstring_at(offset + 2, MAX_NAME_LEN)
                .map(str::to_string);
            (hint, name)
        }
        None => (None, None),
    }
}

fn walk_thunks(
    data: &[u8],
    sections: &SectionTable,
    mut offset: usize,
    is_64: bool,
) -> Vec<ImportFunction> {
    let width = if is_64 { 8 } else { 4 };
    let mut functions = Vec::new();

    while functions.len() < MAX_IMPORT_FUNCTIONS {
        let thunk = match read_thunk(data, offset, is_64) {
            Some(t) => t,
            None => break,
        };
        if thunk == 0 {
            break;
        }

        if is_ordinal_thunk(thunk, is_64) {
            functions.push(ImportFunction {
                thunk,
                ordinal: Some((thunk & 0xFFFF) as u16),
                hint: None,
                name: None,
            });
        } else {
            let (hint, name) = resolve_hint_name(data, sections, thunk);
            functions.push(ImportFunction {
                thunk,
                ordinal: None,
                hint,
                name,
            });
        }

        offset += width;
    }

    functions
}
