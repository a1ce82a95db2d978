//! COM (CLR) descriptor parsing.
//!
//! The 72-byte `IMAGE_COR20_HEADER` is copied verbatim; decoding the CLR
//! metadata it points at is out of scope.

use serde::{Deserialize, Serialize};

use crate::directories::directory_entry;
use crate::sections::SectionTable;
use crate::types::{DataDirectory, DIRECTORY_ENTRY_COM_DESCRIPTOR};
use crate::utils::ReadExt;

pub const COMIMAGE_FLAGS_ILONLY: u32 = 0x0000_0001;
pub const COMIMAGE_FLAGS_32BITREQUIRED: u32 = 0x0000_0002;
pub const COMIMAGE_FLAGS_STRONGNAMESIGNED: u32 = 0x0000_0008;
pub const COMIMAGE_FLAGS_NATIVE_ENTRYPOINT: u32 = 0x0000_0010;

/// Raw `IMAGE_COR20_HEADER` (72 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cor20Header {
    pub cb: u32,
    pub major_runtime_version: u16,
    pub minor_runtime_version: u16,
    pub meta_data: DataDirectory,
    pub flags: u32,
    /// Entry point token, or RVA when `COMIMAGE_FLAGS_NATIVE_ENTRYPOINT`.
    pub entry_point_token: u32,
    pub resources: DataDirectory,
    pub strong_name_signature: DataDirectory,
    pub code_manager_table: DataDirectory,
    pub vtable_fixups: DataDirectory,
    pub export_address_table_jumps: DataDirectory,
    pub managed_native_header: DataDirectory,
}

/// The parsed COM descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComDescriptor {
    /// File offset of the COR20 header.
    pub offset: u32,
    pub header: Cor20Header,
}

fn read_pair(data: &[u8], offset: usize) -> Option<DataDirectory> {
    Some(DataDirectory {
        virtual_address: data.read_u32_le_at(offset)?,
        size: data.read_u32_le_at(offset + 4)?,
    })
}

/// Parse the COM descriptor directory.
pub fn parse_com_descriptor(
    data: &[u8],
    sections: &SectionTable,
    dirs: &[DataDirectory],
) -> Option<ComDescriptor> {
    let dir = directory_entry(dirs, DIRECTORY_ENTRY_COM_DESCRIPTOR)?;
    let offset = sections.rva_to_offset(dir.virtual_address as u64)?;

    let header = Cor20Header {
        cb: data.read_u32_le_at(offset)?,
        major_runtime_version: data.read_u16_le_at(offset + 4)?,
        minor_runtime_version: data.read_u16_le_at(offset + 6)?,
        meta_data: read_pair(data, offset + 8)?,
        flags: data.read_u32_le_at(offset + 16)?,
        entry_point_token: data.read_u32_le_at(offset + 20)?,
        resources: read_pair(data, offset + 24)?,
        strong_name_signature: read_pair(data, offset + 32)?,
        code_manager_table: read_pair(data, offset + 40)?,
        vtable_fixups: read_pair(data, offset + 48)?,
        export_address_table_jumps: read_pair(data, offset + 56)?,
        managed_native_header: read_pair(data, offset + 64)?,
    };

    Some(ComDescriptor {
        offset: offset as u32,
        header,
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
                    name: *b".text\0\0\0",
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
                real_name: ".text".into(),
            }],
            data_len,
        )
    }

    fn put_u32(data: &mut [u8], offset: usize, value: u32) {
        data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    #[test]
    fn test_parse_com_descriptor() {
        let mut data = vec![0u8; 0x1000];
        put_u32(&mut data, 0x200, 72); // cb
        data[0x204] = 2; // major runtime version
        data[0x206] = 5; // minor runtime version
        put_u32(&mut data, 0x208, 0x2008); // metadata RVA
        put_u32(&mut data, 0x20C, 0x1234); // metadata size
        put_u32(&mut data, 0x210, COMIMAGE_FLAGS_ILONLY);
        put_u32(&mut data, 0x214, 0x0600_0001); // entry point token

        let mut dirs = vec![DataDirectory::default(); 16];
        dirs[DIRECTORY_ENTRY_COM_DESCRIPTOR] = DataDirectory {
            virtual_address: 0x1000,
            size: 72,
        };

        let sections = flat_section_table(data.len());
        let com = parse_com_descriptor(&data, &sections, &dirs).unwrap();

        assert_eq!(com.offset, 0x200);
        assert_eq!(com.header.cb, 72);
        assert_eq!(com.header.major_runtime_version, 2);
        assert_eq!(com.header.meta_data.virtual_address, 0x2008);
        assert_eq!(com.header.meta_data.size, 0x1234);
        assert_eq!(com.header.flags & COMIMAGE_FLAGS_ILONLY, COMIMAGE_FLAGS_ILONLY);
        assert_eq!(com.header.entry_point_token, 0x0600_0001);
    }

    #[test]
    fn test_com_descriptor_absent() {
        let data = vec![0u8; 0x1000];
        let sections = flat_section_table(data.len());
        let dirs = vec![DataDirectory::default(); 16];
        assert!(parse_com_descriptor(&data, &sections, &dirs).is_none());
    }
}
