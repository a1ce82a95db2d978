//! Resource directory parsing.
//!
//! Resources form a three-level tree: type, then name/id, then language.
//! Every offset inside an entry is relative to the root resource directory,
//! except a data entry's `offset_to_data`, which is a general RVA. Malformed
//! files can make a child directory point back at an ancestor; such entries
//! get an empty placeholder directory instead of being descended into.

use serde::{Deserialize, Serialize};

use crate::directories::directory_entry;
use crate::sections::SectionTable;
use crate::types::{DataDirectory, DIRECTORY_ENTRY_RESOURCE, MAX_NAME_LEN};
use crate::utils::{in_bounds, read_counted_utf16le_string, ReadExt};

const RESOURCE_DIRECTORY_SIZE: usize = 16;
const RESOURCE_ENTRY_SIZE: usize = 8;

const SUBDIR_FLAG: u32 = 0x8000_0000;
const NAME_STRING_FLAG: u32 = 0x8000_0000;

/// Raw `IMAGE_RESOURCE_DIRECTORY` (16 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDirectory {
    pub characteristics: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub number_of_named_entries: u16,
    pub number_of_id_entries: u16,
}

impl ResourceDirectory {
    pub fn entry_count(&self) -> usize {
        self.number_of_named_entries as usize + self.number_of_id_entries as usize
    }
}

/// Raw `IMAGE_RESOURCE_DIRECTORY_ENTRY` (8 bytes): two union dwords whose
/// high bits select string-vs-id and directory-vs-leaf.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDirectoryEntry {
    pub name: u32,
    pub offset_to_data: u32,
}

impl ResourceDirectoryEntry {
    pub fn name_is_string(&self) -> bool {
        self.name & NAME_STRING_FLAG != 0
    }

    /// Offset of the length-prefixed UTF-16 name, relative to the root.
    pub fn name_offset(&self) -> u32 {
        self.name & !NAME_STRING_FLAG
    }

    pub fn id(&self) -> u16 {
        (self.name & 0xFFFF) as u16
    }

    pub fn data_is_directory(&self) -> bool {
        self.offset_to_data & SUBDIR_FLAG != 0
    }

    /// Offset of the child directory or data entry, relative to the root.
    pub fn offset(&self) -> u32 {
        self.offset_to_data & !SUBDIR_FLAG
    }
}

/// Raw `IMAGE_RESOURCE_DATA_ENTRY` (16 bytes). `offset_to_data` is an RVA.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDataEntry {
    pub offset_to_data: u32,
    pub size: u32,
    pub code_page: u32,
    pub reserved: u32,
}

/// Level 3 (language) leaf entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLevel3Entry {
    pub entry: ResourceDirectoryEntry,
    pub name: String,
    pub data_entry: Option<ResourceDataEntry>,
    pub data: Vec<u8>,
}

/// Level 3 (language) directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLevel3 {
    pub offset: u32,
    pub directory: ResourceDirectory,
    pub entries: Vec<ResourceLevel3Entry>,
}

/// Level 2 (name/id) entry. A leaf carries a data entry; a directory entry
/// carries the level-3 subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLevel2Entry {
    pub entry: ResourceDirectoryEntry,
    pub name: String,
    pub data_entry: Option<ResourceDataEntry>,
    pub data: Vec<u8>,
    pub level3: Option<ResourceLevel3>,
}

/// Level 2 (name/id) directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLevel2 {
    pub offset: u32,
    pub directory: ResourceDirectory,
    pub entries: Vec<ResourceLevel2Entry>,
}

/// Root (type) entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRootEntry {
    pub entry: ResourceDirectoryEntry,
    pub name: String,
    pub data_entry: Option<ResourceDataEntry>,
    pub data: Vec<u8>,
    pub level2: Option<ResourceLevel2>,
}

/// The root (type) resource directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRoot {
    pub offset: u32,
    pub directory: ResourceDirectory,
    pub entries: Vec<ResourceRootEntry>,
}

/// One flattened resource: type/name/language triple plus its raw bytes,
/// borrowing from the tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlatResource<'a> {
    pub type_id: u16,
    pub type_str: Option<&'a str>,
    pub name_id: u16,
    pub name_str: Option<&'a str>,
    pub lang_id: u16,
    pub lang_str: Option<&'a str>,
    pub data: &'a [u8],
}

fn read_resource_directory(data: &[u8], offset: usize) -> Option<ResourceDirectory> {
    Some(ResourceDirectory {
        characteristics: data.read_u32_le_at(offset)?,
        time_date_stamp: data.read_u32_le_at(offset + 4)?,
        major_version: data.read_u16_le_at(offset + 8)?,
        minor_version: data.read_u16_le_at(offset + 10)?,
        number_of_named_entries: data.read_u16_le_at(offset + 12)?,
        number_of_id_entries: data.read_u16_le_at(offset + 14)?,
    })
}

fn read_directory_entry(data: &[u8], offset: usize) -> Option<ResourceDirectoryEntry> {
    Some(ResourceDirectoryEntry {
        name: data.read_u32_le_at(offset)?,
        offset_to_data: data.read_u32_le_at(offset + 4)?,
    })
}

fn read_data_entry(data: &[u8], offset: usize) -> Option<ResourceDataEntry> {
    Some(ResourceDataEntry {
        offset_to_data: data.read_u32_le_at(offset)?,
        size: data.read_u32_le_at(offset + 4)?,
        code_page: data.read_u32_le_at(offset + 8)?,
        reserved: data.read_u32_le_at(offset + 12)?,
    })
}

fn entries_fit(data_len: usize, dir_offset: usize, count: usize) -> bool {
    in_bounds(
        data_len,
        dir_offset + RESOURCE_DIRECTORY_SIZE,
        count * RESOURCE_ENTRY_SIZE,
        false,
    )
}

fn entry_name(data: &[u8], root_offset: usize, entry: &ResourceDirectoryEntry) -> String {
    if !entry.name_is_string() {
        return String::new();
    }
    root_offset
        .checked_add(entry.name_offset() as usize)
        .and_then(|o| read_counted_utf16le_string(data, o, MAX_NAME_LEN))
        .unwrap_or_default()
}

/// Read a leaf's data entry and its raw bytes. The bytes are copied only when
/// the whole range lies within the image (the end may touch the boundary).
fn leaf_data(
    data: &[u8],
    sections: &SectionTable,
    root_offset: usize,
    entry: &ResourceDirectoryEntry,
) -> (Option<ResourceDataEntry>, Vec<u8>) {
    let data_entry = root_offset
        .checked_add(entry.offset() as usize)
        .and_then(|o| read_data_entry(data, o));

    let raw = data_entry
        .and_then(|de| {
            let offset = sections.rva_to_offset(de.offset_to_data as u64)?;
            data.read_slice_at(offset, de.size as usize).map(<[u8]>::to_vec)
        })
        .unwrap_or_default();

    (data_entry, raw)
}

/// Parse the resource tree. `None` when the root directory does not resolve.
pub fn parse_resources(
    data: &[u8],
    sections: &SectionTable,
    dirs: &[DataDirectory],
) -> Option<ResourceRoot> {
    let dir = directory_entry(dirs, DIRECTORY_ENTRY_RESOURCE)?;
    let root_offset = sections.rva_to_offset(dir.virtual_address as u64)?;
    let directory = read_resource_directory(data, root_offset)?;

    let count = directory.entry_count();
    if !entries_fit(data.len(), root_offset, count) {
        return None;
    }

    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let entry_offset = root_offset + RESOURCE_DIRECTORY_SIZE + i * RESOURCE_ENTRY_SIZE;
        let entry = match read_directory_entry(data, entry_offset) {
            Some(e) => e,
            None => break,
        };
        let name = entry_name(data, root_offset, &entry);

        if entry.data_is_directory() {
            let child_offset = match root_offset.checked_add(entry.offset() as usize) {
                Some(o) => o,
                None => break,
            };
            let level2 = parse_level2(data, sections, root_offset, child_offset, &[root_offset]);
            entries.push(ResourceRootEntry {
                entry,
                name,
                data_entry: None,
                data: Vec::new(),
                level2: Some(level2),
            });
        } else {
            let (data_entry, raw) = leaf_data(data, sections, root_offset, &entry);
            entries.push(ResourceRootEntry {
                entry,
                name,
                data_entry,
                data: raw,
                level2: None,
            });
        }
    }

    Some(ResourceRoot {
        offset: root_offset as u32,
        directory,
        entries,
    })
}

/// Parse a level-2 directory. A directory already on the current path (a
/// cycle) or one whose entries cannot fit comes back as an empty placeholder.
fn parse_level2(
    data: &[u8],
    sections: &SectionTable,
    root_offset: usize,
    dir_offset: usize,
    path: &[usize],
) -> ResourceLevel2 {
    let directory = read_resource_directory(data, dir_offset).unwrap_or_default();
    let count = directory.entry_count();

    if path.contains(&dir_offset) || !entries_fit(data.len(), dir_offset, count) {
        return ResourceLevel2 {
            offset: dir_offset as u32,
            directory,
            entries: Vec::new(),
        };
    }

    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let entry_offset = dir_offset + RESOURCE_DIRECTORY_SIZE + i * RESOURCE_ENTRY_SIZE;
        let entry = match read_directory_entry(data, entry_offset) {
            Some(e) => e,
            None => break,
        };
        let name = entry_name(data, root_offset, &entry);

        if entry.data_is_directory() {
            let child_offset = match root_offset.checked_add(entry.offset() as usize) {
                Some(o) => o,
                None => break,
            };
            let level3 = parse_level3(
                data,
                sections,
                root_offset,
                child_offset,
                &[path[0], dir_offset],
            );
            entries.push(ResourceLevel2Entry {
                entry,
                name,
                data_entry: None,
                data: Vec::new(),
                level3: Some(level3),
            });
        } else {
            let (data_entry, raw) = leaf_data(data, sections, root_offset, &entry);
            entries.push(ResourceLevel2Entry {
                entry,
                name,
                data_entry,
                data: raw,
                level3: None,
            });
        }
    }

    ResourceLevel2 {
        offset: dir_offset as u32,
        directory,
        entries,
    }
}

/// Parse a level-3 (language) directory. Entries here are always leaves.
fn parse_level3(
    data: &[u8],
    sections: &SectionTable,
    root_offset: usize,
    dir_offset: usize,
    path: &[usize],
) -> ResourceLevel3 {
    let directory = read_resource_directory(data, dir_offset).unwrap_or_default();
    let count = directory.entry_count();

    if path.contains(&dir_offset) || !entries_fit(data.len(), dir_offset, count) {
        return ResourceLevel3 {
            offset: dir_offset as u32,
            directory,
            entries: Vec::new(),
        };
    }

    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let entry_offset = dir_offset + RESOURCE_DIRECTORY_SIZE + i * RESOURCE_ENTRY_SIZE;
        let entry = match read_directory_entry(data, entry_offset) {
            Some(e) => e,
            None => break,
        };
        let name = entry_name(data, root_offset, &entry);
        let (data_entry, raw) = leaf_data(data, sections, root_offset, &entry);
        entries.push(ResourceLevel3Entry {
            entry,
            name,
            data_entry,
            data: raw,
        });
    }

    ResourceLevel3 {
        offset: dir_offset as u32,
        directory,
        entries,
    }
}

/// Flatten the tree to `{type, name, language, data}` tuples by depth-first
/// walk.
pub fn flatten_resources(root: &ResourceRoot) -> Vec<FlatResource<'_>> {
    // Count first so the output allocates once.
    let mut total = 0usize;
    for root_entry in &root.entries {
        match &root_entry.level2 {
            Some(level2) => {
                for l2_entry in &level2.entries {
                    match &l2_entry.level3 {
                        Some(level3) => total += level3.entries.len(),
                        None => total += 1,
                    }
                }
            }
            None => total += 1,
        }
    }

    let mut flat = Vec::with_capacity(total);
    for root_entry in &root.entries {
        let mut res = FlatResource::default();
        if root_entry.entry.name_is_string() {
            res.type_str = Some(root_entry.name.as_str());
        } else {
            res.type_id = root_entry.entry.id();
        }

        match &root_entry.level2 {
            Some(level2) => {
                for l2_entry in &level2.entries {
                    if l2_entry.entry.name_is_string() {
                        res.name_str = Some(l2_entry.name.as_str());
                    } else {
                        res.name_id = l2_entry.entry.id();
                    }

                    match &l2_entry.level3 {
                        Some(level3) => {
                            for l3_entry in &level3.entries {
                                if l3_entry.entry.name_is_string() {
                                    res.lang_str = Some(l3_entry.name.as_str());
                                } else {
                                    res.lang_id = l3_entry.entry.id();
                                }
                                res.data = &l3_entry.data;
                                flat.push(res.clone());
                            }
                        }
                        None => {
                            res.data = &l2_entry.data;
                            flat.push(res.clone());
                        }
                    }
                }
            }
            None => {
                res.data = &root_entry.data;
                flat.push(res);
            }
        }
    }

    flat
}

/// Well-known resource type names (`RT_*`).
pub fn resource_type_name(id: u16) -> Option<&'static str> {
    Some(match id {
        1 => "RT_CURSOR",
        2 => "RT_BITMAP",
        3 => "RT_ICON",
        4 => "RT_MENU",
        5 => "RT_DIALOG",
        6 => "RT_STRING",
        7 => "RT_FONTDIR",
        8 => "RT_FONT",
        9 => "RT_ACCELERATOR",
        10 => "RT_RCDATA",
        11 => "RT_MESSAGETABLE",
        12 => "RT_GROUP_CURSOR",
        14 => "RT_GROUP_ICON",
        16 => "RT_VERSION",
        17 => "RT_DLGINCLUDE",
        19 => "RT_PLUGPLAY",
        20 => "RT_VXD",
        21 => "RT_ANICURSOR",
        22 => "RT_ANIICON",
        23 => "RT_HTML",
        24 => "RT_MANIFEST",
        28 => "RT_RIBBON_XML",
        240 => "RT_DLGINIT",
        241 => "RT_TOOLBAR",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Section, SectionHeader};

    const RSRC_RVA: u32 = 0x1000;
    const RSRC_RAW: usize = 0x200;

    fn flat_section_table(data_len: usize) -> SectionTable {
        SectionTable::new(
            vec![Section {
                offset: 0,
                header: SectionHeader {
                    name: *b".rsrc\0\0\0",
                    virtual_size: 0x1000,
                    virtual_address: RSRC_RVA,
                    size_of_raw_data: 0x1000,
                    pointer_to_raw_data: RSRC_RAW as u32,
                    pointer_to_relocations: 0,
                    pointer_to_line_numbers: 0,
                    number_of_relocations: 0,
                    number_of_line_numbers: 0,
                    characteristics: 0,
                },
                real_name: ".rsrc".into(),
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

    fn resource_dirs() -> Vec<DataDirectory> {
        let mut dirs = vec![DataDirectory::default(); 16];
        dirs[DIRECTORY_ENTRY_RESOURCE] = DataDirectory {
            virtual_address: RSRC_RVA,
            size: 0x400,
        };
        dirs
    }

    /// Root (1 id entry, type 10) -> level 2 (1 named entry "DATA") ->
    /// level 3 (1 id entry, lang 1033) -> "HELLO" at RVA 0x1300.
    fn build_resource_image() -> Vec<u8> {
        let mut data = vec![0u8; 0x800];
        let r = RSRC_RAW;

        // Root directory: one id entry
        put_u16(&mut data, r + 14, 1);
        put_u32(&mut data, r + 16, 10); // id = RT_RCDATA
        put_u32(&mut data, r + 20, SUBDIR_FLAG | 0x30); // -> level 2

        // Level 2 directory at root+0x30: one named entry
        put_u16(&mut data, r + 0x30 + 12, 1);
        put_u32(&mut data, r + 0x30 + 16, NAME_STRING_FLAG | 0x90); // name at root+0x90
        put_u32(&mut data, r + 0x30 + 20, SUBDIR_FLAG | 0x50); // -> level 3

        // Level 3 directory at root+0x50: one id entry (language 1033)
        put_u16(&mut data, r + 0x50 + 14, 1);
        put_u32(&mut data, r + 0x50 + 16, 1033);
        put_u32(&mut data, r + 0x50 + 20, 0x70); // -> data entry (leaf)

        // Data entry at root+0x70: RVA 0x1300, 5 bytes
        put_u32(&mut data, r + 0x70, 0x1300);
        put_u32(&mut data, r + 0x70 + 4, 5);

        // Name record at root+0x90: length 4, "DATA"
        put_u16(&mut data, r + 0x90, 4);
        for (i, ch) in "DATA".encode_utf16().enumerate() {
            put_u16(&mut data, r + 0x92 + i * 2, ch);
        }

        // Raw bytes at RVA 0x1300 (offset 0x500)
        data[0x500..0x505].copy_from_slice(b"HELLO");
        data
    }

    #[test]
    fn test_parse_resource_tree() {
        let data = build_resource_image();
        let sections = flat_section_table(data.len());
        let root = parse_resources(&data, &sections, &resource_dirs()).unwrap();

        assert_eq!(root.offset as usize, RSRC_RAW);
        assert_eq!(root.entries.len(), 1);

        let type_entry = &root.entries[0];
        assert_eq!(type_entry.entry.id(), 10);
        assert!(!type_entry.entry.name_is_string());

        let level2 = type_entry.level2.as_ref().unwrap();
        assert_eq!(level2.entries.len(), 1);
        let name_entry = &level2.entries[0];
        assert!(name_entry.entry.name_is_string());
        assert_eq!(name_entry.name, "DATA");

        let level3 = name_entry.level3.as_ref().unwrap();
        assert_eq!(level3.entries.len(), 1);
        let lang_entry = &level3.entries[0];
        assert_eq!(lang_entry.entry.id(), 1033);
        assert_eq!(lang_entry.data_entry.unwrap().size, 5);
        assert_eq!(lang_entry.data, b"HELLO");
    }

    #[test]
    fn test_self_referential_tree_terminates() {
        let mut data = build_resource_image();
        // Point the level-2 subtree entry back at the root directory
        put_u32(&mut data, RSRC_RAW + 20, SUBDIR_FLAG);

        let sections = flat_section_table(data.len());
        let root = parse_resources(&data, &sections, &resource_dirs()).unwrap();

        assert_eq!(root.entries.len(), 1);
        let placeholder = root.entries[0].level2.as_ref().unwrap();
        assert_eq!(placeholder.offset as usize, RSRC_RAW);
        assert!(placeholder.entries.is_empty());
    }

    #[test]
    fn test_level3_cycle_to_level2_terminates() {
        let mut data = build_resource_image();
        // Level-2 entry's subtree points back at level 2 itself
        put_u32(&mut data, RSRC_RAW + 0x30 + 20, SUBDIR_FLAG | 0x30);

        let sections = flat_section_table(data.len());
        let root = parse_resources(&data, &sections, &resource_dirs()).unwrap();
        let level2 = root.entries[0].level2.as_ref().unwrap();
        let level3 = level2.entries[0].level3.as_ref().unwrap();
        assert!(level3.entries.is_empty());
    }

    #[test]
    fn test_flatten_resources() {
        let data = build_resource_image();
        let sections = flat_section_table(data.len());
        let root = parse_resources(&data, &sections, &resource_dirs()).unwrap();

        let flat = flatten_resources(&root);
        assert_eq!(flat.len(), 1);
        assert_eq!(flat[0].type_id, 10);
        assert_eq!(flat[0].name_str, Some("DATA"));
        assert_eq!(flat[0].lang_id, 1033);
        assert_eq!(flat[0].data, b"HELLO");
        assert_eq!(resource_type_name(flat[0].type_id), Some("RT_RCDATA"));
    }

    #[test]
    fn test_truncated_resource_data_is_omitted() {
        let mut data = build_resource_image();
        // Claim far more data than the image holds
        put_u32(&mut data, RSRC_RAW + 0x70 + 4, 0x10_0000);

        let sections = flat_section_table(data.len());
        let root = parse_resources(&data, &sections, &resource_dirs()).unwrap();
        let level2 = root.entries[0].level2.as_ref().unwrap();
        let level3 = level2.entries[0].level3.as_ref().unwrap();
        // Data entry is present but the raw copy is refused
        assert!(level3.entries[0].data_entry.is_some());
        assert!(level3.entries[0].data.is_empty());
    }
}
