//! Load configuration directory parsing.
//!
//! Variant-specific layouts that diverge beyond field widths: the 32-bit
//! record orders heap flags before the affinity mask, the 64-bit record the
//! other way around. Fields are read through the control-flow-guard block
//! and the code-integrity record; the whole fixed-size record must fit
//! inside the image.

use serde::{Deserialize, Serialize};

use crate::directories::directory_entry;
use crate::sections::SectionTable;
use crate::types::{DataDirectory, DIRECTORY_ENTRY_LOAD_CONFIG};
use crate::utils::ReadExt;

/// `IMAGE_LOAD_CONFIG_CODE_INTEGRITY` (12 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeIntegrity {
    pub flags: u16,
    pub catalog: u16,
    pub catalog_offset: u32,
    pub reserved: u32,
}

/// Raw `IMAGE_LOAD_CONFIG_DIRECTORY32` through the code-integrity record
/// (104 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadConfigDirectory32 {
    pub size: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub global_flags_clear: u32,
    pub global_flags_set: u32,
    pub critical_section_default_timeout: u32,
    pub de_commit_free_block_threshold: u32,
    pub de_commit_total_free_threshold: u32,
    pub lock_prefix_table: u32,
    pub maximum_allocation_size: u32,
    pub virtual_memory_threshold: u32,
    pub process_heap_flags: u32,
    pub process_affinity_mask: u32,
    pub csd_version: u16,
    pub dependent_load_flags: u16,
    pub edit_list: u32,
    pub security_cookie: u32,
    pub se_handler_table: u32,
    pub se_handler_count: u32,
    pub guard_cf_check_function_pointer: u32,
    pub guard_cf_dispatch_function_pointer: u32,
    pub guard_cf_function_table: u32,
    pub guard_cf_function_count: u32,
    pub guard_flags: u32,
    pub code_integrity: CodeIntegrity,
}

/// Raw `IMAGE_LOAD_CONFIG_DIRECTORY64` through the code-integrity record
/// (160 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadConfigDirectory64 {
    pub size: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub global_flags_clear: u32,
    pub global_flags_set: u32,
    pub critical_section_default_timeout: u32,
    pub de_commit_free_block_threshold: u64,
    pub de_commit_total_free_threshold: u64,
    pub lock_prefix_table: u64,
    pub maximum_allocation_size: u64,
    pub virtual_memory_threshold: u64,
    pub process_affinity_mask: u64,
    pub process_heap_flags: u32,
    pub csd_version: u16,
    pub dependent_load_flags: u16,
    pub edit_list: u64,
    pub security_cookie: u64,
    pub se_handler_table: u64,
    pub se_handler_count: u64,
    pub guard_cf_check_function_pointer: u64,
    pub guard_cf_dispatch_function_pointer: u64,
    pub guard_cf_function_table: u64,
    pub guard_cf_function_count: u64,
    pub guard_flags: u32,
    pub code_integrity: CodeIntegrity,
}

/// The PE32/PE32+ load-config union.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadConfigDirectory {
    LoadConfig32(LoadConfigDirectory32),
    LoadConfig64(LoadConfigDirectory64),
}

impl LoadConfigDirectory {
    pub fn security_cookie(&self) -> u64 {
        match self {
            Self::LoadConfig32(d) => d.security_cookie as u64,
            Self::LoadConfig64(d) => d.security_cookie,
        }
    }

    pub fn guard_flags(&self) -> u32 {
        match self {
            Self::LoadConfig32(d) => d.guard_flags,
            Self::LoadConfig64(d) => d.guard_flags,
        }
    }
}

/// The parsed load-config directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadConfigInfo {
    /// File offset of the load-config directory.
    pub offset: u32,
    pub directory: LoadConfigDirectory,
}

fn read_code_integrity(data: &[u8], offset: usize) -> Option<CodeIntegrity> {
    Some(CodeIntegrity {
        flags: data.read_u16_le_at(offset)?,
        catalog: data.read_u16_le_at(offset + 2)?,
        catalog_offset: data.read_u32_le_at(offset + 4)?,
        reserved: data.read_u32_le_at(offset + 8)?,
    })
}

fn read_load_config32(data: &[u8], offset: usize) -> Option<LoadConfigDirectory32> {
    Some(LoadConfigDirectory32 {
        size: data.read_u32_le_at(offset)?,
        time_date_stamp: data.read_u32_le_at(offset + 4)?,
        major_version: data.read_u16_le_at(offset + 8)?,
        minor_version: data.read_u16_le_at(offset + 10)?,
        global_flags_clear: data.read_u32_le_at(offset + 12)?,
        global_flags_set: data.read_u32_le_at(offset + 16)?,
        critical_section_default_timeout: data.read_u32_le_at(offset + 20)?,
        de_commit_free_block_threshold: data.read_u32_le_at(offset + 24)?,
        de_commit_total_free_threshold: data.read_u32_le_at(offset + 28)?,
        lock_prefix_table: data.read_u32_le_at(offset + 32)?,
        maximum_allocation_size: data.read_u32_le_at(offset + 36)?,
        virtual_memory_threshold: data.read_u32_le_at(offset + 40)?,
        process_heap_flags: data.read_u32_le_at(offset + 44)?,
        process_affinity_mask: data.read_u32_le_at(offset + 48)?,
        csd_version: data.read_u16_le_at(offset + 52)?,
        dependent_load_flags: data.read_u16_le_at(offset + 54)?,
        edit_list: data.read_u32_le_at(offset + 56)?,
        security_cookie: data.read_u32_le_at(offset + 60)?,
        se_handler_table: data.read_u32_le_at(offset + 64)?,
        se_handler_count: data.read_u32_le_at(offset + 68)?,
        guard_cf_check_function_pointer: data.read_u32_le_at(offset + 72)?,
        guard_cf_dispatch_function_pointer: data.read_u32_le_at(offset + 76)?,
        guard_cf_function_table: data.read_u32_le_at(offset + 80)?,
        guard_cf_function_count: data.read_u32_le_at(offset + 84)?,
        guard_flags: data.read_u32_le_at(offset + 88)?,
        code_integrity: read_code_integrity(data, offset + 92)?,
    })
}

fn read_load_config64(data: &[u8], offset: usize) -> Option<LoadConfigDirectory64> {
    Some(LoadConfigDirectory64 {
        size: data.read_u32_le_at(offset)?,
        time_date_stamp: data.read_u32_le_at(offset + 4)?,
        major_version: data.read_u16_le_at(offset + 8)?,
        minor_version: data.read_u16_le_at(offset + 10)?,
        global_flags_clear: data.read_u32_le_at(offset + 12)?,
        global_flags_set: data.read_u32_le_at(offset + 16)?,
        critical_section_default_timeout: data.read_u32_le_at(offset + 20)?,
        de_commit_free_block_threshold: data.read_u64_le_at(offset + 24)?,
        de_commit_total_free_threshold: data.read_u64_le_at(offset + 32)?,
        lock_prefix_table: data.read_u64_le_at(offset + 40)?,
        maximum_allocation_size: data.read_u64_le_at(offset + 48)?,
        virtual_memory_threshold: data.read_u64_le_at(offset + 56)?,
        process_affinity_mask: data.read_u64_le_at(offset + 64)?,
        process_heap_flags: data.read_u32_le_at(offset + 72)?,
        csd_version: data.read_u16_le_at(offset + 76)?,
        dependent_load_flags: data.read_u16_le_at(offset + 78)?,
        edit_list: data.read_u64_le_at(offset + 80)?,
        security_cookie: data.read_u64_le_at(offset + 88)?,
        se_handler_table: data.read_u64_le_at(offset + 96)?,
        se_handler_count: data.read_u64_le_at(offset + 104)?,
        guard_cf_check_function_pointer: data.read_u64_le_at(offset + 112)?,
        guard_cf_dispatch_function_pointer: data.read_u64_le_at(offset + 120)?,
        guard_cf_function_table: data.read_u64_le_at(offset + 128)?,
        guard_cf_function_count: data.read_u64_le_at(offset + 136)?,
        guard_flags: data.read_u32_le_at(offset + 144)?,
        code_integrity: read_code_integrity(data, offset + 148)?,
    })
}

/// Parse the load-config directory for the image's variant.
pub fn parse_load_config(
    data: &[u8],
    sections: &SectionTable,
    dirs: &[DataDirectory],
    is_64: bool,
) -> Option<LoadConfigInfo> {
    let dir = directory_entry(dirs, DIRECTORY_ENTRY_LOAD_CONFIG)?;
    let offset = sections.rva_to_offset(dir.virtual_address as u64)?;

    let directory = if is_64 {
        LoadConfigDirectory::LoadConfig64(read_load_config64(data, offset)?)
    } else {
        LoadConfigDirectory::LoadConfig32(read_load_config32(data, offset)?)
    };

    Some(LoadConfigInfo {
        offset: offset as u32,
        directory,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Section, SectionHeader};

    fn flat_section_table(data_len: usize) -> SectionTable {
        SectionTable::new(
            vec![Section {
                offset: 0,
                header: SectionHeader {
                    name: *b".rdata\0\0",
                    virtual_size: 0x1000,
                    virtual_address: 0x1000,
                    size_of_raw_data: 0x1000,
                    pointer_to_raw_data: 0x200,
                    pointer_to_relocations: 0,
                    pointer_to_line_numbers: 0,
                    number_of_relocations: 0,
                    number_of_line_numbers: 0,
                    characteristics: 0,
                },
                real_name: ".rdata".into(),
            }],
            data_len,
        )
    }

    fn put_u32(data: &mut [u8], offset: usize, value: u32) {
        data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn lcd_dirs() -> Vec<DataDirectory> {
        let mut dirs = vec![DataDirectory::default(); 16];
        dirs[DIRECTORY_ENTRY_LOAD_CONFIG] = DataDirectory {
            virtual_address: 0x1000,
            size: 0xA0,
        };
        dirs
    }

    #[test]
    fn test_parse_load_config32() {
        let mut data = vec![0u8; 0x1000];
        put_u32(&mut data, 0x200, 104); // Size
        put_u32(&mut data, 0x23C, 0x40_5000); // SecurityCookie
        put_u32(&mut data, 0x258, 0x100); // GuardFlags

        let sections = flat_section_table(data.len());
        let info = parse_load_config(&data, &sections, &lcd_dirs(), false).unwrap();

        assert_eq!(info.offset, 0x200);
        assert_eq!(info.directory.security_cookie(), 0x40_5000);
        assert_eq!(info.directory.guard_flags(), 0x100);
        match info.directory {
            LoadConfigDirectory::LoadConfig32(d) => assert_eq!(d.size, 104),
            LoadConfigDirectory::LoadConfig64(_) => panic!("expected 32-bit load config"),
        }
    }

    #[test]
    fn test_parse_load_config64() {
        let mut data = vec![0u8; 0x1000];
        data[0x258..0x260].copy_from_slice(&0x1_4000_5000u64.to_le_bytes()); // SecurityCookie

        let sections = flat_section_table(data.len());
        let info = parse_load_config(&data, &sections, &lcd_dirs(), true).unwrap();
        assert_eq!(info.directory.security_cookie(), 0x1_4000_5000);
    }

    #[test]
    fn test_truncated_load_config_absent() {
        // Directory points so close to the end of the image that the fixed
        // record cannot fit.
        let mut data = vec![0u8; 0x240];
        put_u32(&mut data, 0x200, 104);

        let sections = flat_section_table(data.len());
        assert!(parse_load_config(&data, &sections, &lcd_dirs(), false).is_none());
    }
}
