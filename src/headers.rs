//! DOS header, NT headers and data directory parsing.

use crate::error::{PeError, Result};
use crate::types::*;
use crate::utils::ReadExt;

/// Parse the MS-DOS header at the start of the buffer.
///
/// The two leading bytes must be `MZ`; anything with that much is treated as
/// a minimally correct PE file and parsed further.
pub fn parse_dos_header(data: &[u8]) -> Result<DosHeader> {
    if data.len() < DOS_HEADER_SIZE {
        return Err(PeError::FileSizeTooSmall {
            size: data.len() as u64,
        });
    }

    let e_magic = data.read_u16_le_at(0).unwrap_or(0);
    if e_magic != DOS_SIGNATURE {
        return Err(PeError::NoDosHeader);
    }

    let mut e_res = [0u16; 4];
    for (i, word) in e_res.iter_mut().enumerate() {
        *word = data.read_u16_le_at(28 + i * 2).unwrap_or(0);
    }
    let mut e_res2 = [0u16; 10];
    for (i, word) in e_res2.iter_mut().enumerate() {
        *word = data.read_u16_le_at(40 + i * 2).unwrap_or(0);
    }

    Ok(DosHeader {
        e_magic,
        e_cblp: data.read_u16_le_at(2).unwrap_or(0),
        e_cp: data.read_u16_le_at(4).unwrap_or(0),
        e_crlc: data.read_u16_le_at(6).unwrap_or(0),
        e_cparhdr: data.read_u16_le_at(8).unwrap_or(0),
        e_minalloc: data.read_u16_le_at(10).unwrap_or(0),
        e_maxalloc: data.read_u16_le_at(12).unwrap_or(0),
        e_ss: data.read_u16_le_at(14).unwrap_or(0),
        e_sp: data.read_u16_le_at(16).unwrap_or(0),
        e_csum: data.read_u16_le_at(18).unwrap_or(0),
        e_ip: data.read_u16_le_at(20).unwrap_or(0),
        e_cs: data.read_u16_le_at(22).unwrap_or(0),
        e_lfarlc: data.read_u16_le_at(24).unwrap_or(0),
        e_ovno: data.read_u16_le_at(26).unwrap_or(0),
        e_res,
        e_oemid: data.read_u16_le_at(36).unwrap_or(0),
        e_oeminfo: data.read_u16_le_at(38).unwrap_or(0),
        e_res2,
        e_lfanew: data.read_u32_le_at(60).unwrap_or(0),
    })
}

/// Parse COFF file header at `offset`.
pub fn parse_coff_header(data: &[u8], offset: usize) -> Option<CoffHeader> {
    Some(CoffHeader {
        machine: Machine::from(data.read_u16_le_at(offset)?),
        number_of_sections: data.read_u16_le_at(offset + 2)?,
        time_date_stamp: data.read_u32_le_at(offset + 4)?,
        pointer_to_symbol_table: data.read_u32_le_at(offset + 8)?,
        number_of_symbols: data.read_u32_le_at(offset + 12)?,
        size_of_optional_header: data.read_u16_le_at(offset + 16)?,
        characteristics: data.read_u16_le_at(offset + 18)?,
    })
}

fn parse_optional_header32(data: &[u8], offset: usize) -> Option<OptionalHeader> {
    let common = OptionalHeaderCommon {
        magic: data.read_u16_le_at(offset)?,
        major_linker_version: data.read_u8_at(offset + 2)?,
        minor_linker_version: data.read_u8_at(offset + 3)?,
        size_of_code: data.read_u32_le_at(offset + 4)?,
        size_of_initialized_data: data.read_u32_le_at(offset + 8)?,
        size_of_uninitialized_data: data.read_u32_le_at(offset + 12)?,
        address_of_entry_point: data.read_u32_le_at(offset + 16)?,
        base_of_code: data.read_u32_le_at(offset + 20)?,
    };

    let header = OptionalHeader32 {
        common,
        base_of_data: data.read_u32_le_at(offset + 24)?,
        image_base: data.read_u32_le_at(offset + 28)?,
        section_alignment: data.read_u32_le_at(offset + 32)?,
        file_alignment: data.read_u32_le_at(offset + 36)?,
        major_operating_system_version: data.read_u16_le_at(offset + 40)?,
        minor_operating_system_version: data.read_u16_le_at(offset + 42)?,
        major_image_version: data.read_u16_le_at(offset + 44)?,
        minor_image_version: data.read_u16_le_at(offset + 46)?,
        major_subsystem_version: data.read_u16_le_at(offset + 48)?,
        minor_subsystem_version: data.read_u16_le_at(offset + 50)?,
        win32_version_value: data.read_u32_le_at(offset + 52)?,
        size_of_image: data.read_u32_le_at(offset + 56)?,
        size_of_headers: data.read_u32_le_at(offset + 60)?,
        checksum: data.read_u32_le_at(offset + 64)?,
        subsystem: Subsystem::from(data.read_u16_le_at(offset + 68)?),
        dll_characteristics: data.read_u16_le_at(offset + 70)?,
        size_of_stack_reserve: data.read_u32_le_at(offset + 72)?,
        size_of_stack_commit: data.read_u32_le_at(offset + 76)?,
        size_of_heap_reserve: data.read_u32_le_at(offset + 80)?,
        size_of_heap_commit: data.read_u32_le_at(offset + 84)?,
        loader_flags: data.read_u32_le_at(offset + 88)?,
        number_of_rva_and_sizes: data.read_u32_le_at(offset + 92)?,
    };

    Some(OptionalHeader::Pe32(header))
}

fn parse_optional_header64(data: &[u8], offset: usize) -> Option<OptionalHeader> {
    let common = OptionalHeaderCommon {
        magic: data.read_u16_le_at(offset)?,
        major_linker_version: data.read_u8_at(offset + 2)?,
        minor_linker_version: data.read_u8_at(offset + 3)?,
        size_of_code: data.read_u32_le_at(offset + 4)?,
        size_of_initialized_data: data.read_u32_le_at(offset + 8)?,
        size_of_uninitialized_data: data.read_u32_le_at(offset + 12)?,
        address_of_entry_point: data.read_u32_le_at(offset + 16)?,
        base_of_code: data.read_u32_le_at(offset + 20)?,
    };

    let header = OptionalHeader64 {
        common,
        image_base: data.read_u64_le_at(offset + 24)?,
        section_alignment: data.read_u32_le_at(offset + 32)?,
        file_alignment: data.read_u32_le_at(offset + 36)?,
        major_operating_system_version: data.read_u16_le_at(offset + 40)?,
        minor_operating_system_version: data.read_u16_le_at(offset + 42)?,
        major_image_version: data.read_u16_le_at(offset + 44)?,
        minor_image_version: data.read_u16_le_at(offset + 46)?,
        major_subsystem_version: data.read_u16_le_at(offset + 48)?,
        minor_subsystem_version: data.read_u16_le_at(offset + 50)?,
        win32_version_value: data.read_u32_le_at(offset + 52)?,
        size_of_image: data.read_u32_le_at(offset + 56)?,
        size_of_headers: data.read_u32_le_at(offset + 60)?,
        checksum: data.read_u32_le_at(offset + 64)?,
        subsystem: Subsystem::from(data.read_u16_le_at(offset + 68)?),
        dll_characteristics: data.read_u16_le_at(offset + 70)?,
        size_of_stack_reserve: data.read_u64_le_at(offset + 72)?,
        size_of_stack_commit: data.read_u64_le_at(offset + 80)?,
        size_of_heap_reserve: data.read_u64_le_at(offset + 88)?,
        size_of_heap_commit: data.read_u64_le_at(offset + 96)?,
        loader_flags: data.read_u32_le_at(offset + 104)?,
        number_of_rva_and_sizes: data.read_u32_le_at(offset + 108)?,
    };

    Some(OptionalHeader::Pe32Plus(header))
}

// Fixed (pre-directory) optional header sizes.
const OPTIONAL_HEADER32_SIZE: usize = 96;
const OPTIONAL_HEADER64_SIZE: usize = 112;

/// Parse the NT headers at `e_lfanew` along with the raw data directory
/// table. Returns `None` on a missing `PE\0\0` signature, an unknown
/// optional-header magic, or truncation.
pub fn parse_nt_headers(data: &[u8], e_lfanew: usize) -> Option<(NtHeaderInfo, Vec<DataDirectory>)> {
    let signature = data.read_u32_le_at(e_lfanew)?;
    if signature != PE_SIGNATURE {
        return None;
    }

    let file_header = parse_coff_header(data, e_lfanew.checked_add(4)?)?;

    let opt_offset = e_lfanew + 24; // 4 (signature) + 20 (COFF)
    let magic = data.read_u16_le_at(opt_offset)?;
    let (optional_header, fixed_size) = match magic {
        PE32_MAGIC => (parse_optional_header32(data, opt_offset)?, OPTIONAL_HEADER32_SIZE),
        PE32PLUS_MAGIC => (parse_optional_header64(data, opt_offset)?, OPTIONAL_HEADER64_SIZE),
        _ => return None,
    };

    let directories = parse_data_directories(
        data,
        opt_offset + fixed_size,
        optional_header.number_of_rva_and_sizes(),
    );

    let info = NtHeaderInfo {
        offset: e_lfanew as u32,
        headers: NtHeaders {
            signature,
            file_header,
            optional_header,
        },
    };

    Some((info, directories))
}

/// Read up to `min(count, 16)` data directory entries starting at `offset`.
/// Entries past the end of the buffer are dropped, not errors.
pub fn parse_data_directories(data: &[u8], offset: usize, count: u32) -> Vec<DataDirectory> {
    let count = (count as usize).min(MAX_DATA_DIRECTORIES);
    let mut directories = Vec::with_capacity(count);

    for i in 0..count {
        let dir_offset = offset + i * 8;
        let (virtual_address, size) = match (
            data.read_u32_le_at(dir_offset),
            data.read_u32_le_at(dir_offset + 4),
        ) {
            (Some(va), Some(size)) => (va, size),
            _ => break,
        };
        directories.push(DataDirectory {
            virtual_address,
            size,
        });
    }

    directories
}
