//! Per-directory parsers.
//!
//! Each sub-parser is independent: it receives the raw image, the section
//! table and the data directory entries, and returns `None` (or an empty
//! collection) when its directory is absent or cannot be decoded. Failure
//! never propagates past the directory that failed.

pub mod bound_import;
pub mod com;
pub mod debug;
pub mod delay_import;
pub mod exception;
pub mod export;
pub mod import;
pub mod loadconfig;
pub mod reloc;
pub mod resource;
pub mod security;
pub mod tls;

use crate::sections::SectionTable;
use crate::types::{DataDirectory, MAX_NAME_LEN};
use crate::utils::ReadExt;

/// Data directory entry at `index`, if it carries a nonzero address.
pub(crate) fn directory_entry(dirs: &[DataDirectory], index: usize) -> Option<DataDirectory> {
    let dir = dirs.get(index).copied()?;
    (dir.virtual_address != 0).then_some(dir)
}

/// Read a bounded C string addressed by RVA. Unresolvable or unterminated
/// names come back empty; the caller's record is still emitted.
pub(crate) fn read_string_at_rva(data: &[u8], sections: &SectionTable, rva: u32) -> String {
    if rva == 0 {
        return String::new();
    }
    sections
        .rva_to_offset(rva as u64)
        .and_then(|offset| data.read_cstring_at(offset, MAX_NAME_LEN))
        .map(str::to_string)
        .unwrap_or_default()
}
