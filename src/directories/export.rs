//! Export directory parsing.
//!
//! Three parallel arrays hang off the export directory: function RVAs,
//! name-string RVAs, and biased name ordinals. A function's name is found by
//! locating its index in the ordinal array; a function whose RVA lands back
//! inside the export directory is a forwarder and the "code" is actually a
//! `"OtherDll.OtherSymbol"` string.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::directories::{directory_entry, read_string_at_rva};
use crate::sections::SectionTable;
use crate::types::{DataDirectory, DIRECTORY_ENTRY_EXPORT, MAX_NAME_LEN};
use crate::utils::ReadExt;

/// Keeps the ordinal/name triangulation linear for bogus counts.
pub const MAX_EXPORT_FUNCTIONS: usize = 10_000;

/// Raw `IMAGE_EXPORT_DIRECTORY` (40 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportDirectory {
    pub characteristics: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub name: u32,
    pub base: u32,
    pub number_of_functions: u32,
    pub number_of_names: u32,
    pub address_of_functions: u32,
    pub address_of_names: u32,
    pub address_of_name_ordinals: u32,
}

/// One exported function.
///
/// `ordinal` is the function-table index; add the directory's `base` to
/// recover the biased ordinal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportFunction {
    pub func_rva: u32,
    pub ordinal: u32,
    pub name_rva: u32,
    pub name: Option<String>,
    pub forwarder: Option<String>,
}

/// The parsed export table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Export {
    /// File offset of the export directory.
    pub offset: u32,
    pub directory: ExportDirectory,
    /// Module name the directory points at; empty when unreadable.
    pub module_name: String,
    pub functions: Vec<ExportFunction>,
}

fn read_export_directory(data: &[u8], offset: usize) -> Option<ExportDirectory> {
    Some(ExportDirectory {
        characteristics: data.read_u32_le_at(offset)?,
        time_date_stamp: data.read_u32_le_at(offset + 4)?,
        major_version: data.read_u16_le_at(offset + 8)?,
        minor_version: data.read_u16_le_at(offset + 10)?,
        name: data.read_u32_le_at(offset + 12)?,
        base: data.read_u32_le_at(offset + 16)?,
        number_of_functions: data.read_u32_le_at(offset + 20)?,
        number_of_names: data.read_u32_le_at(offset + 24)?,
        address_of_functions: data.read_u32_le_at(offset + 28)?,
        address_of_names: data.read_u32_le_at(offset + 32)?,
        address_of_name_ordinals: data.read_u32_le_at(offset + 36)?,
    })
}

/// Parse the export directory. `None` when the directory or its function
/// address table does not resolve.
pub fn parse_export(
    data: &[u8],
    sections: &SectionTable,
    dirs: &[DataDirectory],
) -> Option<Export> {
    let dir = directory_entry(dirs, DIRECTORY_ENTRY_EXPORT)?;
    let dir_offset = sections.rva_to_offset(dir.virtual_address as u64)?;
    let directory = read_export_directory(data, dir_offset)?;

    let funcs_offset = sections.rva_to_offset(directory.address_of_functions as u64)?;

    // Index -> (name RVA, name). Built in one pass over the parallel
    // name/ordinal arrays; the first ordinal claiming an index wins.
    let mut names: HashMap<usize, (u32, Option<String>)> = HashMap::new();
    if let (Some(names_offset), Some(ordinals_offset)) = (
        sections.rva_to_offset(directory.address_of_names as u64),
        sections.rva_to_offset(directory.address_of_name_ordinals as u64),
    ) {
        let name_count = (directory.number_of_names as usize).min(MAX_EXPORT_FUNCTIONS);
        for j in 0..name_count {
            let ordinal = match data.read_u16_le_at(ordinals_offset + j * 2) {
                Some(o) => o as usize,
                None => break,
            };
            let name_rva = match data.read_u32_le_at(names_offset + j * 4) {
                Some(rva) => rva,
                None => break,
            };
            names.entry(ordinal).or_insert_with(|| {
                let name = sections
                    .rva_to_offset(name_rva as u64)
                    .and_then(|o| data.read_cstring_at(o, MAX_NAME_LEN))
                    .map(str::to_string);
                (name_rva, name)
            });
        }
    }

    let export_start = dir.virtual_address;
    let export_end = dir.virtual_address.saturating_add(dir.size);
    let count = (directory.number_of_functions as usize).min(MAX_EXPORT_FUNCTIONS);

    let mut functions = Vec::new();
    for i in 0..count {
        let func_rva = match data.read_u32_le_at(funcs_offset + i * 4) {
            Some(rva) => rva,
            None => break,
        };
        if func_rva == 0 {
            continue;
        }

        let (name_rva, name) = names.get(&i).cloned().unwrap_or((0, None));

        // A function RVA inside the export directory itself is a forwarder.
        let forwarder = if func_rva >= export_start && func_rva <= export_end {
            sections
                .rva_to_offset(func_rva as u64)
                .and_then(|o| data.read_cstring_at(o, MAX_NAME_LEN))
                .map(str::to_string)
        } else {
            None
        };

        functions.push(ExportFunction {
            func_rva,
            ordinal: i as u32,
            name_rva,
            name,
            forwarder,
        });
    }

    let module_name = read_string_at_rva(data, sections, directory.name);

    Some(Export {
        offset: dir_offset as u32,
        directory,
        module_name,
        functions,
    })
}
