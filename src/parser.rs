//! The parse entry point and the `ParsedImage`/`PeParser` facade.
//!
//! `parse` is a pure transform from bytes to a fully-populated record tree;
//! directories are parsed in a fixed order, each sub-parser independent and
//! free to fail without aborting the others. `PeParser` wraps it with
//! lifecycle: file mapping, reparse (which resets the previous result) and
//! flag-gated accessors.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::directories::bound_import::{parse_bound_imports, BoundImportModule};
use crate::directories::com::{parse_com_descriptor, ComDescriptor};
use crate::directories::debug::{parse_debug, DebugEntry};
use crate::directories::delay_import::{parse_delay_imports, DelayImportModule};
use crate::directories::exception::{parse_exceptions, ExceptionEntry};
use crate::directories::export::{parse_export, Export};
use crate::directories::import::{parse_imports, ImportModule};
use crate::directories::loadconfig::{parse_load_config, LoadConfigInfo};
use crate::directories::reloc::{parse_relocations, RelocationBlock};
use crate::directories::resource::{parse_resources, ResourceRoot};
use crate::directories::security::{parse_security, SecurityEntry};
use crate::directories::tls::{parse_tls, TlsInfo};
use crate::directories::directory_entry;
use crate::error::{PeError, Result};
use crate::headers;
use crate::rich::{parse_rich_header, RichHeader};
use crate::sections::{parse_sections, SectionTable};
use crate::types::*;

/// Everything one parse discovered. All records are owned values; the source
/// bytes are only borrowed while `parse` runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedImage {
    data_len: usize,
    file_info: FileInfo,
    dos_header: Option<DosHeader>,
    rich_header: Option<RichHeader>,
    nt_header: Option<NtHeaderInfo>,
    data_directories: Vec<DataDirectoryInfo>,
    section_table: SectionTable,
    export: Option<Export>,
    imports: Vec<ImportModule>,
    resources: Option<ResourceRoot>,
    exceptions: Vec<ExceptionEntry>,
    security: Vec<SecurityEntry>,
    relocations: Vec<RelocationBlock>,
    debug: Vec<DebugEntry>,
    tls: Option<TlsInfo>,
    load_config: Option<LoadConfigInfo>,
    bound_imports: Vec<BoundImportModule>,
    delay_imports: Vec<DelayImportModule>,
    com_descriptor: Option<ComDescriptor>,
}

/// True when the directory at `index` addresses something inside a section.
fn presence_only(sections: &SectionTable, dirs: &[DataDirectory], index: usize) -> bool {
    directory_entry(dirs, index)
        .and_then(|d| sections.rva_to_offset(d.virtual_address as u64))
        .is_some()
}

/// Parse a PE image from a byte buffer.
///
/// Fails only when the buffer is smaller than a DOS header or the `MZ`
/// signature is missing; everything else is reported through the presence
/// flags of the returned [`ParsedImage`].
pub fn parse(data: &[u8]) -> Result<ParsedImage> {
    let dos_header = headers::parse_dos_header(data)?;

    let mut image = ParsedImage {
        data_len: data.len(),
        ..Default::default()
    };
    image.file_info.has_dos_hdr = true;
    let e_lfanew = dos_header.e_lfanew;
    image.dos_header = Some(dos_header);

    if let Some(rich) = parse_rich_header(data, e_lfanew) {
        image.file_info.has_rich_hdr = true;
        image.rich_header = Some(rich);
    }

    // Without NT headers there is nothing further to locate.
    let (nt, raw_dirs) = match headers::parse_nt_headers(data, e_lfanew as usize) {
        Some(parsed) => parsed,
        None => {
            debug!("no NT headers, DOS-only image");
            return Ok(image);
        }
    };

    image.file_info.has_nt_hdr = true;
    let is_64 = nt.headers.optional_header.is_64bit();
    image.file_info.is_pe32 = !is_64;
    image.file_info.is_pe64 = is_64;
    let image_base = nt.headers.optional_header.image_base();

    let table = SectionTable::new(parse_sections(data, &nt), data.len());
    image.file_info.has_sections = !table.is_empty();

    image.data_directories = raw_dirs
        .iter()
        .enumerate()
        .map(|(i, d)| DataDirectoryInfo {
            directory: *d,
            section: if i == DIRECTORY_ENTRY_SECURITY {
                None
            } else {
                table
                    .section_containing_rva(d.virtual_address as u64)
                    .map(|s| s.header.name())
            },
        })
        .collect();
    image.file_info.has_data_dirs = !image.data_directories.is_empty();

    if let Some(export) = parse_export(data, &table, &raw_dirs) {
        image.file_info.has_export = true;
        image.export = Some(export);
    }
    if let Some(imports) = parse_imports(data, &table, &raw_dirs, is_64) {
        image.file_info.has_import = true;
        image.imports = imports;
    }
    if let Some(resources) = parse_resources(data, &table, &raw_dirs) {
        image.file_info.has_resource = true;
        image.resources = Some(resources);
    }
    if let Some(exceptions) = parse_exceptions(data, &table, &raw_dirs) {
        image.file_info.has_exception = true;
        image.exceptions = exceptions;
    }
    if let Some(security) = parse_security(data, &raw_dirs) {
        image.file_info.has_security = true;
        image.security = security;
    }
    if let Some(relocations) = parse_relocations(data, &table, &raw_dirs) {
        image.file_info.has_reloc = true;
        image.relocations = relocations;
    }
    if let Some(debug_entries) = parse_debug(data, &table, &raw_dirs) {
        image.file_info.has_debug = true;
        image.debug = debug_entries;
    }

    image.file_info.has_architect = presence_only(&table, &raw_dirs, DIRECTORY_ENTRY_ARCHITECTURE);
    image.file_info.has_global_ptr = presence_only(&table, &raw_dirs, DIRECTORY_ENTRY_GLOBALPTR);

    if let Some(tls) = parse_tls(data, &table, &raw_dirs, is_64, image_base) {
        image.file_info.has_tls = true;
        image.tls = Some(tls);
    }
    if let Some(load_config) = parse_load_config(data, &table, &raw_dirs, is_64) {
        image.file_info.has_load_cfg = true;
        image.load_config = Some(load_config);
    }
    if let Some(bound_imports) = parse_bound_imports(data, &table, &raw_dirs) {
        image.file_info.has_bound_imp = true;
        image.bound_imports = bound_imports;
    }

    image.file_info.has_iat = presence_only(&table, &raw_dirs, DIRECTORY_ENTRY_IAT);

    if let Some(delay_imports) = parse_delay_imports(data, &table, &raw_dirs, is_64) {
        image.file_info.has_delay_imp = true;
        image.delay_imports = delay_imports;
    }
    if let Some(com_descriptor) = parse_com_descriptor(data, &table, &raw_dirs) {
        image.file_info.has_com_descr = true;
        image.com_descriptor = Some(com_descriptor);
    }

    image.nt_header = Some(nt);
    image.section_table = table;

    Ok(image)
}

impl ParsedImage {
    pub fn file_info(&self) -> &FileInfo {
        &self.file_info
    }

    /// Length of the source buffer this image was parsed from.
    pub fn data_size(&self) -> usize {
        self.data_len
    }

    pub fn dos_header(&self) -> Option<&DosHeader> {
        self.file_info.has_dos_hdr.then_some(self.dos_header.as_ref())?
    }

    pub fn rich_header(&self) -> Option<&RichHeader> {
        self.file_info.has_rich_hdr.then_some(self.rich_header.as_ref())?
    }

    pub fn nt_header(&self) -> Option<&NtHeaderInfo> {
        self.file_info.has_nt_hdr.then_some(self.nt_header.as_ref())?
    }

    pub fn data_directories(&self) -> Option<&[DataDirectoryInfo]> {
        self.file_info
            .has_data_dirs
            .then_some(self.data_directories.as_slice())
    }

    pub fn sections(&self) -> Option<&[Section]> {
        self.file_info
            .has_sections
            .then_some(self.section_table.sections())
    }

    pub fn export(&self) -> Option<&Export> {
        self.file_info.has_export.then_some(self.export.as_ref())?
    }

    pub fn imports(&self) -> Option<&[ImportModule]> {
        self.file_info.has_import.then_some(self.imports.as_slice())
    }

    pub fn resources(&self) -> Option<&ResourceRoot> {
        self.file_info.has_resource.then_some(self.resources.as_ref())?
    }

    pub fn exceptions(&self) -> Option<&[ExceptionEntry]> {
        self.file_info
            .has_exception
            .then_some(self.exceptions.as_slice())
    }

    pub fn security(&self) -> Option<&[SecurityEntry]> {
        self.file_info.has_security.then_some(self.security.as_slice())
    }

    pub fn relocations(&self) -> Option<&[RelocationBlock]> {
        self.file_info.has_reloc.then_some(self.relocations.as_slice())
    }

    pub fn debug(&self) -> Option<&[DebugEntry]> {
        self.file_info.has_debug.then_some(self.debug.as_slice())
    }

    pub fn tls(&self) -> Option<&TlsInfo> {
        self.file_info.has_tls.then_some(self.tls.as_ref())?
    }

    pub fn load_config(&self) -> Option<&LoadConfigInfo> {
        self.file_info.has_load_cfg.then_some(self.load_config.as_ref())?
    }

    pub fn bound_imports(&self) -> Option<&[BoundImportModule]> {
        self.file_info
            .has_bound_imp
            .then_some(self.bound_imports.as_slice())
    }

    pub fn delay_imports(&self) -> Option<&[DelayImportModule]> {
        self.file_info
            .has_delay_imp
            .then_some(self.delay_imports.as_slice())
    }

    pub fn com_descriptor(&self) -> Option<&ComDescriptor> {
        self.file_info
            .has_com_descr
            .then_some(self.com_descriptor.as_ref())?
    }

    /// Image base from the optional header; zero without NT headers.
    pub fn image_base(&self) -> u64 {
        self.nt_header
            .as_ref()
            .map(|nt| nt.headers.optional_header.image_base())
            .unwrap_or(0)
    }

    /// Translate an RVA through the parsed section table.
    pub fn rva_to_offset(&self, rva: u64) -> Option<usize> {
        self.section_table.rva_to_offset(rva)
    }

    /// Translate a virtual address (`RVA + ImageBase`).
    pub fn va_to_offset(&self, va: u64) -> Option<usize> {
        self.rva_to_offset(va.checked_sub(self.image_base())?)
    }
}

/// Stateful wrapper owning the result of the latest parse.
///
/// A reparse resets the previous result before touching the new input; a
/// caller sees either the previous parse, an empty parser, or the completed
/// new parse, never something in between.
#[derive(Debug, Default)]
pub struct PeParser {
    image: Option<ParsedImage>,
}

impl PeParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a byte buffer.
    pub fn parse(&mut self, data: &[u8]) -> Result<&ParsedImage> {
        self.image = None;
        let image = parse(data)?;
        Ok(self.image.insert(image))
    }

    /// Open `path` read-only, memory-map it and parse the mapping.
    ///
    /// The mapping only lives for the duration of the parse; every record in
    /// the result owns its bytes.
    pub fn parse_file<P: AsRef<Path>>(&mut self, path: P) -> Result<&ParsedImage> {
        let file = File::open(path.as_ref()).map_err(PeError::FileOpen)?;
        let size = file.metadata().map_err(PeError::FileOpen)?.len();
        if size < DOS_HEADER_SIZE as u64 {
            // Also covers empty files, which cannot be mapped at all.
            return Err(PeError::FileSizeTooSmall { size });
        }

        // Safety: the file is opened read-only and the mapping is dropped at
        // the end of this call.
        let mmap = unsafe { Mmap::map(&file) }.map_err(PeError::FileMapping)?;
        self.parse(&mmap)
    }

    pub fn is_loaded(&self) -> bool {
        self.image.is_some()
    }

    /// Drop the current parse result.
    pub fn clear(&mut self) {
        self.image = None;
    }

    pub fn image(&self) -> Option<&ParsedImage> {
        self.image.as_ref()
    }

    pub fn file_info(&self) -> Option<&FileInfo> {
        self.image.as_ref().map(ParsedImage::file_info)
    }

    pub fn dos_header(&self) -> Option<&DosHeader> {
        self.image.as_ref()?.dos_header()
    }

    pub fn rich_header(&self) -> Option<&RichHeader> {
        self.image.as_ref()?.rich_header()
    }

    pub fn nt_header(&self) -> Option<&NtHeaderInfo> {
        self.image.as_ref()?.nt_header()
    }

    pub fn data_directories(&self) -> Option<&[DataDirectoryInfo]> {
        self.image.as_ref()?.data_directories()
    }

    pub fn sections(&self) -> Option<&[Section]> {
        self.image.as_ref()?.sections()
    }

    pub fn export(&self) -> Option<&Export> {
        self.image.as_ref()?.export()
    }

    pub fn imports(&self) -> Option<&[ImportModule]> {
        self.image.as_ref()?.imports()
    }

    pub fn resources(&self) -> Option<&ResourceRoot> {
        self.image.as_ref()?.resources()
    }

    pub fn exceptions(&self) -> Option<&[ExceptionEntry]> {
        self.image.as_ref()?.exceptions()
    }

    pub fn security(&self) -> Option<&[SecurityEntry]> {
        self.image.as_ref()?.security()
    }

    pub fn relocations(&self) -> Option<&[RelocationBlock]> {
        self.image.as_ref()?.relocations()
    }

    pub fn debug(&self) -> Option<&[DebugEntry]> {
        self.image.as_ref()?.debug()
    }

    pub fn tls(&self) -> Option<&TlsInfo> {
        self.image.as_ref()?.tls()
    }

    pub fn load_config(&self) -> Option<&LoadConfigInfo> {
        self.image.as_ref()?.load_config()
    }

    pub fn bound_imports(&self) -> Option<&[BoundImportModule]> {
        self.image.as_ref()?.bound_imports()
    }

    pub fn delay_imports(&self) -> Option<&[DelayImportModule]> {
        self.image.as_ref()?.delay_imports()
    }

    pub fn com_descriptor(&self) -> Option<&ComDescriptor> {
        self.image.as_ref()?.com_descriptor()
    }

    pub fn image_base(&self) -> u64 {
        self.image.as_ref().map(ParsedImage::image_base).unwrap_or(0)
    }

    pub fn rva_to_offset(&self, rva: u64) -> Option<usize> {
        self.image.as_ref()?.rva_to_offset(rva)
    }

    pub fn va_to_offset(&self, va: u64) -> Option<usize> {
        self.image.as_ref()?.va_to_offset(va)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal PE32 with one `.text` section.
    fn create_minimal_pe() -> Vec<u8> {
        let mut data = vec![0u8; 1024];

        data[0] = 0x4D; // MZ
        data[1] = 0x5A;
        data[60] = 0x80; // e_lfanew

        data[0x80..0x84].copy_from_slice(b"PE\0\0");
        data[0x84] = 0x4C; // Machine: x86
        data[0x85] = 0x01;
        data[0x86] = 0x01; // NumberOfSections: 1
        data[0x94] = 0x60; // SizeOfOptionalHeader: 0x60
        data[0x98] = 0x0B; // Magic: PE32
        data[0x99] = 0x01;
        data[0xA8] = 0x00; // entry point 0x1000
        data[0xA9] = 0x10;
        data[0xB4] = 0x00; // image base 0x400000
        data[0xB6] = 0x40;
        data[0xF4] = 0x00; // NumberOfRvaAndSizes: 0

        // Section header at 0x80 + 24 + 0x60 = 0xF8
        let s = 0xF8;
        data[s..s + 5].copy_from_slice(b".text");
        data[s + 9] = 0x10; // VirtualSize 0x1000
        data[s + 13] = 0x10; // VirtualAddress 0x1000
        data[s + 17] = 0x02; // SizeOfRawData 0x200
        data[s + 21] = 0x02; // PointerToRawData 0x200

        data
    }

    #[test]
    fn test_parse_minimal_pe() {
        let data = create_minimal_pe();
        let image = parse(&data).unwrap();

        let info = image.file_info();
        assert!(info.has_dos_hdr);
        assert!(info.has_nt_hdr);
        assert!(info.is_pe32 && !info.is_pe64);
        assert!(info.has_sections);
        assert!(!info.has_rich_hdr);
        assert!(!info.has_export && !info.has_import);

        let sections = image.sections().unwrap();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].header.name(), ".text");
        assert_eq!(sections[0].real_name, ".text");
        assert_eq!(sections[0].offset, 0xF8);

        assert_eq!(image.image_base(), 0x40_0000);
        assert_eq!(image.rva_to_offset(0x1000), Some(0x200));
        assert_eq!(image.va_to_offset(0x40_1000), Some(0x200));
        assert_eq!(image.rva_to_offset(0x5000), None);
    }

    #[test]
    fn test_parse_too_small() {
        assert!(matches!(
            parse(&[]),
            Err(PeError::FileSizeTooSmall { size: 0 })
        ));
        assert!(matches!(
            parse(&[0u8; 63]),
            Err(PeError::FileSizeTooSmall { size: 63 })
        ));
    }

    #[test]
    fn test_parse_dos_only() {
        // Valid DOS header whose e_lfanew points past the end of the file.
        let mut data = vec![0u8; 64];
        data[0] = 0x4D;
        data[1] = 0x5A;
        data[60] = 0x00;
        data[61] = 0x02; // e_lfanew = 0x200

        let image = parse(&data).unwrap();
        let info = image.file_info();
        assert!(info.has_dos_hdr);
        assert!(!info.has_nt_hdr);
        assert!(!info.is_pe32 && !info.is_pe64);
        assert!(image.nt_header().is_none());
        assert!(image.sections().is_none());
        assert_eq!(image.image_base(), 0);
    }

    #[test]
    fn test_parser_lifecycle() {
        let data = create_minimal_pe();
        let mut pe = PeParser::new();
        assert!(!pe.is_loaded());
        assert!(pe.file_info().is_none());

        pe.parse(&data).unwrap();
        assert!(pe.is_loaded());
        assert!(pe.sections().is_some());
        assert_eq!(pe.image_base(), 0x40_0000);

        // A failing reparse leaves the parser empty, not stale.
        assert!(pe.parse(&[0u8; 10]).is_err());
        assert!(!pe.is_loaded());

        pe.parse(&data).unwrap();
        pe.clear();
        assert!(!pe.is_loaded());
        assert!(pe.sections().is_none());
    }

    #[test]
    fn test_reparse_is_idempotent() {
        let data = create_minimal_pe();
        let first = parse(&data).unwrap();
        let second = parse(&data).unwrap();
        assert_eq!(first, second);

        let mut pe = PeParser::new();
        pe.parse(&data).unwrap();
        pe.parse(&data).unwrap();
        assert_eq!(pe.image(), Some(&first));
    }
}
