//! TLS directory parsing.
//!
//! The TLS directory comes in a 32-bit and a 64-bit layout; its
//! `AddressOfCallBacks` field is a *virtual* address, so it is rebased by the
//! image base before translation. The callback table holds pointer-width
//! slots and ends at a zero entry.

use serde::{Deserialize, Serialize};

use crate::directories::directory_entry;
use crate::sections::SectionTable;
use crate::types::{DataDirectory, DIRECTORY_ENTRY_TLS};
use crate::utils::ReadExt;

/// Raw `IMAGE_TLS_DIRECTORY32` (24 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsDirectory32 {
    pub start_address_of_raw_data: u32,
    pub end_address_of_raw_data: u32,
    pub address_of_index: u32,
    pub address_of_callbacks: u32,
    pub size_of_zero_fill: u32,
    pub characteristics: u32,
}

/// Raw `IMAGE_TLS_DIRECTORY64` (40 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsDirectory64 {
    pub start_address_of_raw_data: u64,
    pub end_address_of_raw_data: u64,
    pub address_of_index: u64,
    pub address_of_callbacks: u64,
    pub size_of_zero_fill: u32,
    pub characteristics: u32,
}

/// The PE32/PE32+ TLS directory union.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsDirectory {
    Tls32(TlsDirectory32),
    Tls64(TlsDirectory64),
}

impl TlsDirectory {
    pub fn address_of_callbacks(&self) -> u64 {
        match self {
            Self::Tls32(d) => d.address_of_callbacks as u64,
            Self::Tls64(d) => d.address_of_callbacks,
        }
    }
}

/// The parsed TLS directory plus its callback table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsInfo {
    /// File offset of the TLS directory.
    pub offset: u32,
    pub directory: TlsDirectory,
    /// Callback addresses (VAs), zero-terminated on disk.
    pub callbacks: Vec<u64>,
}

fn read_tls32(data: &[u8], offset: usize) -> Option<TlsDirectory32> {
    Some(TlsDirectory32 {
        start_address_of_raw_data: data.read_u32_le_at(offset)?,
        end_address_of_raw_data: data.read_u32_le_at(offset + 4)?,
        address_of_index: data.read_u32_le_at(offset + 8)?,
        address_of_callbacks: data.read_u32_le_at(offset + 12)?,
        size_of_zero_fill: data.read_u32_le_at(offset + 16)?,
        characteristics: data.read_u32_le_at(offset + 20)?,
    })
}

fn read_tls64(data: &[u8], offset: usize) -> Option<TlsDirectory64> {
    Some(TlsDirectory64 {
        start_address_of_raw_data: data.read_u64_le_at(offset)?,
        end_address_of_raw_data: data.read_u64_le_at(offset + 8)?,
        address_of_index: data.read_u64_le_at(offset + 16)?,
        address_of_callbacks: data.read_u64_le_at(offset + 24)?,
        size_of_zero_fill: data.read_u32_le_at(offset + 32)?,
        characteristics: data.read_u32_le_at(offset + 36)?,
    })
}

/// Parse the TLS directory and walk its callback table.
pub fn parse_tls(
    data: &[u8],
    sections: &SectionTable,
    dirs: &[DataDirectory],
    is_64: bool,
    image_base: u64,
) -> Option<TlsInfo> {
    let dir = directory_entry(dirs, DIRECTORY_ENTRY_TLS)?;
    let offset = sections.rva_to_offset(dir.virtual_address as u64)?;

    let directory = if is_64 {
        TlsDirectory::Tls64(read_tls64(data, offset)?)
    } else {
        TlsDirectory::Tls32(read_tls32(data, offset)?)
    };

    let callbacks = walk_callbacks(data, sections, directory.address_of_callbacks(), is_64, image_base);

    Some(TlsInfo {
        offset: offset as u32,
        directory,
        callbacks,
    })
}

fn walk_callbacks(
    data: &[u8],
    sections: &SectionTable,
    callbacks_va: u64,
    is_64: bool,
    image_base: u64,
) -> Vec<u64> {
    let width = if is_64 { 8usize } else { 4 };
    let mut callbacks = Vec::new();

    let rva = match callbacks_va.checked_sub(image_base) {
        Some(rva) => rva,
        None => return callbacks,
    };
    let mut offset = match sections.rva_to_offset(rva) {
        Some(o) => o,
        None => return callbacks,
    };

    loop {
        let slot = if is_64 {
            data.read_u64_le_at(offset)
        } else {
            data.read_u32_le_at(offset).map(u64::from)
        };
        match slot {
            Some(0) => break,
            Some(value) => callbacks.push(value),
            None => {
                // Table ran off the end of the image; report none at all.
                callbacks.clear();
                break;
            }
        }
        offset += width;
    }

    callbacks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Section, SectionHeader};

    const IMAGE_BASE: u64 = 0x40_0000;

    fn flat_section_table(data_len: usize) -> SectionTable {
        SectionTable::new(
            vec![Section {
                offset: 0,
                header: SectionHeader {
                    name: *b".tls\0\0\0\0",
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
                real_name: ".tls".into(),
            }],
            data_len,
        )
    }

    fn put_u32(data: &mut [u8], offset: usize, value: u32) {
        data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn tls_dirs() -> Vec<DataDirectory> {
        let mut dirs = vec![DataDirectory::default(); 16];
        dirs[DIRECTORY_ENTRY_TLS] = DataDirectory {
            virtual_address: 0x1000,
            size: 24,
        };
        dirs
    }

    #[test]
    fn test_parse_tls32_with_callbacks() {
        let mut data = vec![0u8; 0x1000];
        // TLS directory at offset 0x200; callbacks table at VA base+0x1100
        put_u32(&mut data, 0x20C, (IMAGE_BASE + 0x1100) as u32);
        // Callback table at offset 0x300: two entries, then terminator
        put_u32(&mut data, 0x300, 0x40_1000);
        put_u32(&mut data, 0x304, 0x40_2000);

        let sections = flat_section_table(data.len());
        let tls = parse_tls(&data, &sections, &tls_dirs(), false, IMAGE_BASE).unwrap();

        assert_eq!(tls.offset, 0x200);
        assert_eq!(tls.callbacks, vec![0x40_1000, 0x40_2000]);
        match tls.directory {
            TlsDirectory::Tls32(d) => {
                assert_eq!(d.address_of_callbacks as u64, IMAGE_BASE + 0x1100)
            }
            TlsDirectory::Tls64(_) => panic!("expected 32-bit TLS directory"),
        }
    }

    #[test]
    fn test_parse_tls64_callback_width() {
        let mut data = vec![0u8; 0x1000];
        // 64-bit directory: AddressOfCallBacks at offset +24
        data[0x218..0x220].copy_from_slice(&(IMAGE_BASE + 0x1100).to_le_bytes());
        // One 8-byte callback slot
        data[0x300..0x308].copy_from_slice(&0x1_4000_1000u64.to_le_bytes());

        let sections = flat_section_table(data.len());
        let tls = parse_tls(&data, &sections, &tls_dirs(), true, IMAGE_BASE).unwrap();
        assert_eq!(tls.callbacks, vec![0x1_4000_1000]);
    }

    #[test]
    fn test_tls_callbacks_cleared_when_table_runs_off_image() {
        let mut data = vec![0u8; 0x1000];
        // Callback table near the very end of the section data, no room for
        // a terminator.
        put_u32(&mut data, 0x20C, (IMAGE_BASE + 0x1000 + 0xDFC) as u32);
        let len = data.len();
        put_u32(&mut data, len - 4, 0x40_1000);

        let sections = flat_section_table(data.len());
        let tls = parse_tls(&data, &sections, &tls_dirs(), false, IMAGE_BASE).unwrap();
        assert!(tls.callbacks.is_empty());
    }

    #[test]
    fn test_tls_va_below_image_base() {
        let mut data = vec![0u8; 0x1000];
        put_u32(&mut data, 0x20C, 0x10); // "VA" far below the image base

        let sections = flat_section_table(data.len());
        let tls = parse_tls(&data, &sections, &tls_dirs(), false, IMAGE_BASE).unwrap();
        assert!(tls.callbacks.is_empty());
    }
}
