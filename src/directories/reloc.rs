//! Base relocation directory parsing.
//!
//! Relocations come in blocks: an `IMAGE_BASE_RELOCATION` header followed by
//! 16-bit entries, high 4 bits the type and low 12 bits the page offset. A
//! block with a zero size or page RVA terminates the walk. `HIGHADJ`
//! relocations occupy a second slot holding the low half of the adjusted
//! word.

use serde::{Deserialize, Serialize};

use crate::directories::directory_entry;
use crate::sections::SectionTable;
use crate::types::{DataDirectory, DIRECTORY_ENTRY_BASERELOC};
use crate::utils::ReadExt;

const BASE_RELOCATION_SIZE: usize = 8;

pub const RELOC_ABSOLUTE: u16 = 0;
pub const RELOC_HIGH: u16 = 1;
pub const RELOC_LOW: u16 = 2;
pub const RELOC_HIGHLOW: u16 = 3;
pub const RELOC_HIGHADJ: u16 = 4;
pub const RELOC_DIR64: u16 = 10;

/// Raw `IMAGE_BASE_RELOCATION` block header (8 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseRelocation {
    pub virtual_address: u32,
    pub size_of_block: u32,
}

/// One decoded relocation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelocationEntry {
    /// File offset of this 16-bit slot.
    pub offset: u32,
    /// High 4 bits of the slot.
    pub reloc_type: u16,
    /// Low 12 bits of the slot; for the extra `HIGHADJ` slot, the full word.
    pub reloc_offset: u16,
}

/// A relocation block with its decoded entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelocationBlock {
    /// File offset of the block header.
    pub offset: u32,
    pub base_relocation: BaseRelocation,
    pub entries: Vec<RelocationEntry>,
}

fn read_base_relocation(data: &[u8], offset: usize) -> Option<BaseRelocation> {
    Some(BaseRelocation {
        virtual_address: data.read_u32_le_at(offset)?,
        size_of_block: data.read_u32_le_at(offset + 4)?,
    })
}

/// Walk the relocation blocks. `None` when the directory address does not
/// resolve; a directory whose first block header is unreadable is present
/// but empty.
pub fn parse_relocations(
    data: &[u8],
    sections: &SectionTable,
    dirs: &[DataDirectory],
) -> Option<Vec<RelocationBlock>> {
    let dir = directory_entry(dirs, DIRECTORY_ENTRY_BASERELOC)?;
    let mut offset = sections.rva_to_offset(dir.virtual_address as u64)?;

    let mut blocks = Vec::new();

    let first = match read_base_relocation(data, offset) {
        Some(b) => b,
        None => return Some(blocks),
    };
    // A terminating header right at the start is still reported.
    if first.size_of_block == 0 || first.virtual_address == 0 {
        blocks.push(RelocationBlock {
            offset: offset as u32,
            base_relocation: first,
            entries: Vec::new(),
        });
        return Some(blocks);
    }

    loop {
        let base = match read_base_relocation(data, offset) {
            Some(b) => b,
            None => break,
        };
        if base.size_of_block == 0 || base.virtual_address == 0 {
            break;
        }
        if (base.size_of_block as usize) < BASE_RELOCATION_SIZE {
            blocks.push(RelocationBlock {
                offset: offset as u32,
                base_relocation: base,
                entries: Vec::new(),
            });
            break;
        }

        let count = (base.size_of_block as usize - BASE_RELOCATION_SIZE) / 2;
        let mut entries = Vec::new();
        let mut entry_offset = offset + BASE_RELOCATION_SIZE;
        let mut i = 0usize;
        while i < count {
            let word = match data.read_u16_le_at(entry_offset) {
                Some(w) => w,
                None => break,
            };
            let reloc_type = (word & 0xF000) >> 12;
            entries.push(RelocationEntry {
                offset: entry_offset as u32,
                reloc_type,
                reloc_offset: word & 0x0FFF,
            });

            if reloc_type == RELOC_HIGHADJ {
                // The low half of the 32-bit value sits in the next slot.
                entry_offset += 2;
                i += 1;
                let low = match data.read_u16_le_at(entry_offset) {
                    Some(w) => w,
                    None => {
                        entries.clear();
                        break;
                    }
                };
                entries.push(RelocationEntry {
                    offset: entry_offset as u32,
                    reloc_type,
                    reloc_offset: low,
                });
            }

            entry_offset += 2;
            i += 1;
        }

        blocks.push(RelocationBlock {
            offset: offset as u32,
            base_relocation: base,
            entries,
        });

        offset = match offset.checked_add(base.size_of_block as usize) {
            Some(next) if next < data.len() => next,
            _ => break,
        };
    }

    Some(blocks)
}
