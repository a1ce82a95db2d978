//! Debug directory parsing.
//!
//! An array of `IMAGE_DEBUG_DIRECTORY` records. For CodeView records the
//! first dwords of the pointed-to raw data identify the PDB format: `RSDS`
//! (PDB 7.0, path at offset 24) or `NB10` (PDB 2.0, path at offset 16).

use serde::{Deserialize, Serialize};

use crate::directories::directory_entry;
use crate::sections::SectionTable;
use crate::types::{DataDirectory, DIRECTORY_ENTRY_DEBUG, MAX_NAME_LEN};
use crate::utils::ReadExt;

const DEBUG_DIRECTORY_SIZE: usize = 28;

pub const DEBUG_TYPE_COFF: u32 = 1;
pub const DEBUG_TYPE_CODEVIEW: u32 = 2;
pub const DEBUG_TYPE_FPO: u32 = 3;
pub const DEBUG_TYPE_MISC: u32 = 4;
pub const DEBUG_TYPE_POGO: u32 = 13;
pub const DEBUG_TYPE_REPRO: u32 = 16;

const CV_SIGNATURE_RSDS: u32 = 0x5344_5352; // "RSDS"
const CV_SIGNATURE_NB10: u32 = 0x3031_424E; // "NB10"

/// Raw `IMAGE_DEBUG_DIRECTORY` (28 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugDirectory {
    pub characteristics: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub debug_type: u32,
    pub size_of_data: u32,
    pub address_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
}

/// One debug record plus its decoded raw-data header.
///
/// `header` holds the first six dwords of the raw debug data; their meaning
/// depends on the signature in `header[0]`. For `RSDS`, dwords 1-4 are the
/// GUID and dword 5 the age; for `NB10`, dword 1 is an offset, dword 2 the
/// timestamp and dword 3 the age.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugEntry {
    /// File offset of this debug directory record.
    pub offset: u32,
    pub directory: DebugDirectory,
    pub header: [u32; 6],
    pub pdb_name: Option<String>,
}

fn read_debug_directory(data: &[u8], offset: usize) -> Option<DebugDirectory> {
    Some(DebugDirectory {
        characteristics: data.read_u32_le_at(offset)?,
        time_date_stamp: data.read_u32_le_at(offset + 4)?,
        major_version: data.read_u16_le_at(offset + 8)?,
        minor_version: data.read_u16_le_at(offset + 10)?,
        debug_type: data.read_u32_le_at(offset + 12)?,
        size_of_data: data.read_u32_le_at(offset + 16)?,
        address_of_raw_data: data.read_u32_le_at(offset + 20)?,
        pointer_to_raw_data: data.read_u32_le_at(offset + 24)?,
    })
}

/// Read the PDB path. Unlike other embedded strings this one tolerates a
/// missing terminator at the end of the image; the bytes up to the boundary
/// are kept.
fn read_pdb_path(data: &[u8], offset: usize) -> String {
    let mut bytes = Vec::new();
    for i in 0..MAX_NAME_LEN {
        let byte = data.read_u8_at(offset + i).unwrap_or(0);
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    String::from_utf8_lossy(&bytes).to_string()
}

/// Parse the debug directory array. Count is `directory size / 28`.
pub fn parse_debug(
    data: &[u8],
    sections: &SectionTable,
    dirs: &[DataDirectory],
) -> Option<Vec<DebugEntry>> {
    let dir = directory_entry(dirs, DIRECTORY_ENTRY_DEBUG)?;
    let offset = sections.rva_to_offset(dir.virtual_address as u64)?;

    let count = dir.size as usize / DEBUG_DIRECTORY_SIZE;
    if count == 0 {
        return None;
    }

    let mut entries = Vec::with_capacity(count.min(64));
    for i in 0..count {
        let entry_offset = offset + i * DEBUG_DIRECTORY_SIZE;
        let directory = match read_debug_directory(data, entry_offset) {
            Some(d) => d,
            None => break,
        };

        // The raw-data pointer is already a file offset.
        let raw = directory.pointer_to_raw_data as usize;
        let mut header = [0u32; 6];
        for (j, dword) in header.iter_mut().enumerate() {
            *dword = data.read_u32_le_at(raw + j * 4).unwrap_or(0);
        }

        let pdb_name = if directory.debug_type == DEBUG_TYPE_CODEVIEW {
            let name_offset = match header[0] {
                CV_SIGNATURE_RSDS => Some(24),
                CV_SIGNATURE_NB10 => Some(16),
                _ => None,
            };
            name_offset.map(|delta| read_pdb_path(data, raw + delta))
        } else {
            None
        };

        entries.push(DebugEntry {
            offset: entry_offset as u32,
            directory,
            header,
            pdb_name,
        });
    }

    if entries.is_empty() {
        return None;
    }
    Some(entries)
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

    fn debug_dirs(size: u32) -> Vec<DataDirectory> {
        let mut dirs = vec![DataDirectory::default(); 16];
        dirs[DIRECTORY_ENTRY_DEBUG] = DataDirectory {
            virtual_address: 0x1000,
            size,
        };
        dirs
    }

    #[test]
    fn test_parse_codeview_rsds() {
        let mut data = vec![0u8; 0x1000];
        // Debug directory record at RVA 0x1000 (offset 0x200)
        put_u32(&mut data, 0x20C, DEBUG_TYPE_CODEVIEW);
        put_u32(&mut data, 0x218, 0x600); // PointerToRawData (file offset)

        // CodeView RSDS record at 0x600
        put_u32(&mut data, 0x600, CV_SIGNATURE_RSDS);
        put_u32(&mut data, 0x614, 3); // age
        data[0x618..0x625].copy_from_slice(b"C:\\my\\ap.pdb\0");

        let sections = flat_section_table(data.len());
        let entries = parse_debug(&data, &sections, &debug_dirs(28)).unwrap();

        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.directory.debug_type, DEBUG_TYPE_CODEVIEW);
        assert_eq!(entry.header[0], CV_SIGNATURE_RSDS);
        assert_eq!(entry.header[5], 3);
        assert_eq!(entry.pdb_name.as_deref(), Some("C:\\my\\ap.pdb"));
    }

    #[test]
    fn test_parse_codeview_nb10() {
        let mut data = vec![0u8; 0x1000];
        put_u32(&mut data, 0x20C, DEBUG_TYPE_CODEVIEW);
        put_u32(&mut data, 0x218, 0x600);

        put_u32(&mut data, 0x600, CV_SIGNATURE_NB10);
        data[0x610..0x618].copy_from_slice(b"old.pdb\0");

        let sections = flat_section_table(data.len());
        let entries = parse_debug(&data, &sections, &debug_dirs(28)).unwrap();
        assert_eq!(entries[0].pdb_name.as_deref(), Some("old.pdb"));
    }

    #[test]
    fn test_non_codeview_has_no_pdb() {
        let mut data = vec![0u8; 0x1000];
        put_u32(&mut data, 0x20C, DEBUG_TYPE_POGO);
        put_u32(&mut data, 0x218, 0x600);

        let sections = flat_section_table(data.len());
        let entries = parse_debug(&data, &sections, &debug_dirs(28)).unwrap();
        assert!(entries[0].pdb_name.is_none());
    }

    #[test]
    fn test_zero_size_directory_absent() {
        let data = vec![0u8; 0x1000];
        let sections = flat_section_table(data.len());
        assert!(parse_debug(&data, &sections, &debug_dirs(0)).is_none());
    }
}
