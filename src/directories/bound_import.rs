//! Bound import directory parsing.
//!
//! An array of `IMAGE_BOUND_IMPORT_DESCRIPTOR` records, each followed inline
//! by its module-forwarder refs; the next descriptor starts right after the
//! last forwarder. Module-name offsets are relative to the start of the
//! bound-import table, not to the descriptor carrying them.

use serde::{Deserialize, Serialize};

use crate::directories::directory_entry;
use crate::sections::SectionTable;
use crate::types::{DataDirectory, DIRECTORY_ENTRY_BOUND_IMPORT, MAX_NAME_LEN};
use crate::utils::ReadExt;

const BOUND_RECORD_SIZE: usize = 8;

/// Raw `IMAGE_BOUND_IMPORT_DESCRIPTOR` (8 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundImportDescriptor {
    pub time_date_stamp: u32,
    pub offset_module_name: u16,
    pub number_of_module_forwarder_refs: u16,
}

/// Raw `IMAGE_BOUND_FORWARDER_REF` (8 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundForwarder {
    pub time_date_stamp: u32,
    pub offset_module_name: u16,
    pub reserved: u16,
}

/// A forwarder ref plus its resolved module name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundForwarderRef {
    /// File offset of this forwarder record.
    pub offset: u32,
    pub forwarder: BoundForwarder,
    pub name: String,
}

/// One bound module with its inline forwarder refs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundImportModule {
    /// File offset of this bound import descriptor.
    pub offset: u32,
    pub descriptor: BoundImportDescriptor,
    pub name: String,
    pub forwarders: Vec<BoundForwarderRef>,
}

fn read_descriptor(data: &[u8], offset: usize) -> Option<BoundImportDescriptor> {
    Some(BoundImportDescriptor {
        time_date_stamp: data.read_u32_le_at(offset)?,
        offset_module_name: data.read_u16_le_at(offset + 4)?,
        number_of_module_forwarder_refs: data.read_u16_le_at(offset + 6)?,
    })
}

fn read_forwarder(data: &[u8], offset: usize) -> Option<BoundForwarder> {
    Some(BoundForwarder {
        time_date_stamp: data.read_u32_le_at(offset)?,
        offset_module_name: data.read_u16_le_at(offset + 4)?,
        reserved: data.read_u16_le_at(offset + 6)?,
    })
}

fn name_at(data: &[u8], table_offset: usize, name_offset: u16) -> String {
    table_offset
        .checked_add(name_offset as usize)
        .and_then(|o| data.read_cstring_at(o, MAX_NAME_LEN))
        .map(str::to_string)
        .unwrap_or_default()
}

/// Walk the bound import table. A descriptor with a zero timestamp ends it.
pub fn parse_bound_imports(
    data: &[u8],
    sections: &SectionTable,
    dirs: &[DataDirectory],
) -> Option<Vec<BoundImportModule>> {
    let dir = directory_entry(dirs, DIRECTORY_ENTRY_BOUND_IMPORT)?;
    let table_offset = sections.rva_to_offset(dir.virtual_address as u64)?;

    let mut modules = Vec::new();
    let mut cursor = table_offset;

    loop {
        let descriptor = match read_descriptor(data, cursor) {
            Some(d) => d,
            None => break,
        };
        if descriptor.time_date_stamp == 0 {
            break;
        }

        let mut forwarders = Vec::new();
        for i in 0..descriptor.number_of_module_forwarder_refs as usize {
            let fwd_offset = cursor + BOUND_RECORD_SIZE + i * BOUND_RECORD_SIZE;
            let forwarder = match read_forwarder(data, fwd_offset) {
                Some(f) => f,
                None => break,
            };
            let name = name_at(data, table_offset, forwarder.offset_module_name);
            forwarders.push(BoundForwarderRef {
                offset: fwd_offset as u32,
                forwarder,
                name,
            });
        }

        let name = name_at(data, table_offset, descriptor.offset_module_name);
        let stride = BOUND_RECORD_SIZE
            + descriptor.number_of_module_forwarder_refs as usize * BOUND_RECORD_SIZE;
        modules.push(BoundImportModule {
            offset: cursor as u32,
            descriptor,
            name,
            forwarders,
        });

        cursor = match cursor.checked_add(stride) {
            Some(next) => next,
            None => break,
        };
    }

    Some(modules)
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
                    name: *b".bind\0\0\0",
                    virtual_size: 0x800,
                    virtual_address: 0x1000,
                    size_of_raw_data: 0x800,
                    pointer_to_raw_data: 0x200,
                    pointer_to_relocations: 0,
                    pointer_to_line_numbers: 0,
                    number_of_relocations: 0,
                    number_of_line_numbers: 0,
                    characteristics: 0,
                },
                real_name: ".bind".into(),
            }],
            data_len,
        )
    }

    fn put_u32(data: &mut [u8], offset: usize, value: u32) {
        data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u16(data: &mut [u8], offset: usize, value: u16) {
        data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    #[test]
    fn test_parse_bound_imports_with_forwarders() {
        let mut data = vec![0u8; 0x1000];
        let table = 0x200; // RVA 0x1000

        // Descriptor 0: one forwarder, name at table+0x40
        put_u32(&mut data, table, 0x5F00_0000);
        put_u16(&mut data, table + 4, 0x40);
        put_u16(&mut data, table + 6, 1);
        // Inline forwarder, name at table+0x50
        put_u32(&mut data, table + 8, 0x5F00_0001);
        put_u16(&mut data, table + 12, 0x50);
        // Descriptor 1: no forwarders, name at table+0x60
        put_u32(&mut data, table + 16, 0x5F00_0002);
        put_u16(&mut data, table + 20, 0x60);
        // Zero-timestamp terminator already in place at table+24.

        data[table + 0x40..table + 0x4A].copy_from_slice(b"ntdll.dll\0");
        data[table + 0x50..table + 0x5A].copy_from_slice(b"winmm.dll\0");
        data[table + 0x60..table + 0x6A].copy_from_slice(b"userl.dll\0");

        let mut dirs = vec![DataDirectory::default(); 16];
        dirs[DIRECTORY_ENTRY_BOUND_IMPORT] = DataDirectory {
            virtual_address: 0x1000,
            size: 0x80,
        };

        let sections = flat_section_table(data.len());
        let modules = parse_bound_imports(&data, &sections, &dirs).unwrap();

        assert_eq!(modules.len(), 2);
        assert_eq!(modules[0].name, "ntdll.dll");
        assert_eq!(modules[0].forwarders.len(), 1);
        assert_eq!(modules[0].forwarders[0].name, "winmm.dll");
        // The second descriptor starts right after the first's forwarder
        assert_eq!(modules[1].offset as usize, table + 16);
        assert_eq!(modules[1].name, "userl.dll");
        assert!(modules[1].forwarders.is_empty());
    }

    #[test]
    fn test_bound_imports_absent() {
        let data = vec![0u8; 0x1000];
        let sections = flat_section_table(data.len());
        let dirs = vec![DataDirectory::default(); 16];
        assert!(parse_bound_imports(&data, &sections, &dirs).is_none());
    }
}
