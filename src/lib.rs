//! Read-only structural parsing of PE32 and PE32+ images.
//!
//! `peparse` takes an arbitrary byte buffer (typically a memory-mapped file)
//! and extracts the MS-DOS header, the undocumented Rich header, the NT
//! headers, the data directories, the section table, and every standard
//! directory: exports, imports, resources, exceptions, certificates,
//! relocations, debug records, TLS, load configuration, bound and delay
//! imports, and the COM (CLR) descriptor.
//!
//! The input is untrusted: every size field and every offset may be bogus or
//! adversarial. All reads go through bounds-checked primitives, every walk is
//! bounded, and a sub-structure that cannot be decoded is simply reported as
//! absent instead of failing the whole parse.
//!
//! ```no_run
//! let mut pe = peparse::PeParser::new();
//! pe.parse_file("C:/Windows/System32/kernel32.dll")?;
//! for module in pe.imports().unwrap_or_default() {
//!     println!("{} ({} functions)", module.dll_name, module.functions.len());
//! }
//! # Ok::<(), peparse::PeError>(())
//! ```

pub mod directories;
pub mod error;
pub mod headers;
pub mod logging;
pub mod parser;
pub mod rich;
pub mod sections;
pub mod types;
pub mod utils;

pub use directories::bound_import::{
    BoundForwarder, BoundForwarderRef, BoundImportDescriptor, BoundImportModule,
};
pub use directories::com::{ComDescriptor, Cor20Header};
pub use directories::debug::{DebugDirectory, DebugEntry};
pub use directories::delay_import::{DelayImportFunction, DelayImportModule, DelayLoadDescriptor};
pub use directories::exception::{ExceptionEntry, RuntimeFunction};
pub use directories::export::{Export, ExportDirectory, ExportFunction, MAX_EXPORT_FUNCTIONS};
pub use directories::import::{
    ImportDescriptor, ImportFunction, ImportModule, MAX_IMPORT_FUNCTIONS, MAX_IMPORT_MODULES,
};
pub use directories::loadconfig::{
    CodeIntegrity, LoadConfigDirectory, LoadConfigDirectory32, LoadConfigDirectory64,
    LoadConfigInfo,
};
pub use directories::reloc::{BaseRelocation, RelocationBlock, RelocationEntry};
pub use directories::resource::{
    flatten_resources, resource_type_name, FlatResource, ResourceDataEntry, ResourceDirectory,
    ResourceDirectoryEntry, ResourceLevel2, ResourceLevel2Entry, ResourceLevel3,
    ResourceLevel3Entry, ResourceRoot, ResourceRootEntry,
};
pub use directories::security::{SecurityEntry, WinCertificate};
pub use directories::tls::{TlsDirectory, TlsDirectory32, TlsDirectory64, TlsInfo};
pub use error::{PeError, Result};
pub use parser::{parse, ParsedImage, PeParser};
pub use rich::{RichEntry, RichHeader};
pub use sections::SectionTable;
pub use types::*;

/// Service information about the library itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LibInfo {
    /// Version as a display string, e.g. `"1.2.0"`.
    pub version: &'static str,
    /// Version packed as `major << 48 | minor << 32 | patch << 16`.
    pub packed: u64,
}

/// Returns the library name/version info. Pure constant function.
pub fn lib_info() -> LibInfo {
    let major: u64 = env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0);
    let minor: u64 = env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0);
    let patch: u64 = env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0);
    LibInfo {
        version: env!("CARGO_PKG_VERSION"),
        packed: (major << 48) | (minor << 32) | (patch << 16),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lib_info() {
        let info = lib_info();
        assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(info.packed >> 48, 1);
        assert_eq!((info.packed >> 32) & 0xFFFF, 2);
    }
}
