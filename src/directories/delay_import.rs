//! Delay-load import directory parsing.
//!
//! Parallel to ordinary imports, but each descriptor carries four thunk
//! tables (name, address, bound address, unload information) that advance in
//! lockstep. The name table drives the walk; the trailing tables may
//! legitimately be absent.

use serde::{Deserialize, Serialize};

use crate::directories::import::{
    is_ordinal_thunk, read_thunk, resolve_hint_name, MAX_IMPORT_FUNCTIONS, MAX_IMPORT_MODULES,
};
use crate::directories::{directory_entry, read_string_at_rva};
use crate::sections::SectionTable;
use crate::types::{DataDirectory, DIRECTORY_ENTRY_DELAY_IMPORT};
use crate::utils::ReadExt;

const DELAY_DESCRIPTOR_SIZE: usize = 32;

/// Raw `IMAGE_DELAYLOAD_DESCRIPTOR` (32 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayLoadDescriptor {
    pub attributes: u32,
    pub dll_name_rva: u32,
    pub module_handle_rva: u32,
    pub import_address_table_rva: u32,
    pub import_name_table_rva: u32,
    pub bound_import_address_table_rva: u32,
    pub unload_information_table_rva: u32,
    pub time_date_stamp: u32,
}

/// One delay-imported function: the four parallel thunk slots plus the
/// decoded hint/name. Slots from absent tables are zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayImportFunction {
    pub name_thunk: u64,
    pub iat_thunk: u64,
    pub bound_iat_thunk: u64,
    pub unload_info_thunk: u64,
    pub ordinal: Option<u16>,
    pub hint: Option<u16>,
    pub name: Option<String>,
}

/// All functions delay-imported from one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayImportModule {
    /// File offset of this delay-load descriptor.
    pub offset: u32,
    pub descriptor: DelayLoadDescriptor,
    pub dll_name: String,
    pub functions: Vec<DelayImportFunction>,
}

fn read_delay_descriptor(data: &[u8], offset: usize) -> Option<DelayLoadDescriptor> {
    Some(DelayLoadDescriptor {
        attributes: data.read_u32_le_at(offset)?,
        dll_name_rva: data.read_u32_le_at(offset + 4)?,
        module_handle_rva: data.read_u32_le_at(offset + 8)?,
        import_address_table_rva: data.read_u32_le_at(offset + 12)?,
        import_name_table_rva: data.read_u32_le_at(offset + 16)?,
        bound_import_address_table_rva: data.read_u32_le_at(offset + 20)?,
        unload_information_table_rva: data.read_u32_le_at(offset + 24)?,
        time_date_stamp: data.read_u32_le_at(offset + 28)?,
    })
}

/// Walk the delay-load descriptor table.
pub fn parse_delay_imports(
    data: &[u8],
    sections: &SectionTable,
    dirs: &[DataDirectory],
    is_64: bool,
) -> Option<Vec<DelayImportModule>> {
    let dir = directory_entry(dirs, DIRECTORY_ENTRY_DELAY_IMPORT)?;
    let mut desc_offset = sections.rva_to_offset(dir.virtual_address as u64)?;

    let mut modules = Vec::new();
    let mut module_count = 0usize;

    loop {
        let descriptor = match read_delay_descriptor(data, desc_offset) {
            Some(d) => d,
            None => break,
        };
        if descriptor.dll_name_rva == 0 {
            break;
        }

        if descriptor.import_name_table_rva != 0 {
            let name_offset = match sections.rva_to_offset(descriptor.import_name_table_rva as u64)
            {
                Some(o) => o,
                None => break,
            };
            let iat_offset = sections.rva_to_offset(descriptor.import_address_table_rva as u64);
            let bound_offset =
                sections.rva_to_offset(descriptor.bound_import_address_table_rva as u64);
            let unload_offset =
                sections.rva_to_offset(descriptor.unload_information_table_rva as u64);

            let functions = walk_delay_thunks(
                data,
                sections,
                name_offset,
                iat_offset,
                bound_offset,
                unload_offset,
                is_64,
            );
            let dll_name = read_string_at_rva(data, sections, descriptor.dll_name_rva);
            modules.push(DelayImportModule {
                offset: desc_offset as u32,
                descriptor,
                dll_name,
                functions,
            });
        }

        desc_offset += DELAY_DESCRIPTOR_SIZE;
        module_count += 1;
        if module_count == MAX_IMPORT_MODULES {
            break;
        }
    }

    Some(modules)
}

#[allow(clippy::too_many_arguments)]
fn walk_delay_thunks(
    data: &[u8],
    sections: &SectionTable,
    mut name_offset: usize,
    mut iat_offset: Option<usize>,
    mut bound_offset: Option<usize>,
    mut unload_offset: Option<usize>,
    is_64: bool,
) -> Vec<DelayImportFunction> {
    let width = if is_64 { 8usize } else { 4 };
    let mut functions = Vec::new();

    while functions.len() < MAX_IMPORT_FUNCTIONS {
        let name_thunk = match read_thunk(data, name_offset, is_64) {
            Some(t) => t,
            None => break,
        };
        if name_thunk == 0 {
            break;
        }

        let side_thunk =
            |offset: Option<usize>| offset.and_then(|o| read_thunk(data, o, is_64)).unwrap_or(0);
        let iat_thunk = side_thunk(iat_offset);
        let bound_iat_thunk = side_thunk(bound_offset);
        let unload_info_thunk = side_thunk(unload_offset);

        let (ordinal, hint, name) = if is_ordinal_thunk(name_thunk, is_64) {
            (Some((name_thunk & 0xFFFF) as u16), None, None)
        } else {
            let (hint, name) = resolve_hint_name(data, sections, name_thunk);
            (None, hint, name)
        };

        functions.push(DelayImportFunction {
            name_thunk,
            iat_thunk,
            bound_iat_thunk,
            unload_info_thunk,
            ordinal,
            hint,
            name,
        });

        name_offset += width;
        if let Some(o) = iat_offset.as_mut() {
            *o += width;
        }
        if let Some(o) = bound_offset.as_mut() {
            *o += width;
        }
        if let Some(o) = unload_offset.as_mut() {
            *o += width;
        }
    }

    functions
}
