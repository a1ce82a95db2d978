//! Exception directory parsing.
//!
//! A flat array of fixed-width `RUNTIME_FUNCTION` records; the directory
//! size divided by the record size gives the count.

use serde::{Deserialize, Serialize};

use crate::directories::directory_entry;
use crate::sections::SectionTable;
use crate::types::{DataDirectory, DIRECTORY_ENTRY_EXCEPTION};
use crate::utils::ReadExt;

const RUNTIME_FUNCTION_SIZE: usize = 12;

/// Raw `IMAGE_RUNTIME_FUNCTION_ENTRY` (12 bytes, x64 layout).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeFunction {
    pub begin_address: u32,
    pub end_address: u32,
    pub unwind_info_address: u32,
}

/// One exception record with its file offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionEntry {
    pub offset: u32,
    pub runtime_function: RuntimeFunction,
}

fn read_runtime_function(data: &[u8], offset: usize) -> Option<RuntimeFunction> {
    Some(RuntimeFunction {
        begin_address: data.read_u32_le_at(offset)?,
        end_address: data.read_u32_le_at(offset + 4)?,
        unwind_info_address: data.read_u32_le_at(offset + 8)?,
    })
}

/// Parse the runtime-function array.
pub fn parse_exceptions(
    data: &[u8],
    sections: &SectionTable,
    dirs: &[DataDirectory],
) -> Option<Vec<ExceptionEntry>> {
    let dir = directory_entry(dirs, DIRECTORY_ENTRY_EXCEPTION)?;
    let offset = sections.rva_to_offset(dir.virtual_address as u64)?;

    let count = dir.size as usize / RUNTIME_FUNCTION_SIZE;
    if count == 0 {
        return None;
    }

    let mut entries = Vec::with_capacity(count.min(1024));
    for i in 0..count {
        let entry_offset = offset + i * RUNTIME_FUNCTION_SIZE;
        let runtime_function = match read_runtime_function(data, entry_offset) {
            Some(r) => r,
            None => break,
        };
        entries.push(ExceptionEntry {
            offset: entry_offset as u32,
            runtime_function,
        });
    }

    if entries.is_empty() {
        return None;
    }
    Some(entries)
}
