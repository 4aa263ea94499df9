//! ELF image loading.
//!
//! Pulls the `.debug_*` sections and the read-only program image out of an
//! ELF file. Compressed debug sections are inflated on load.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use emdbg_core::DebugSections;
use object::{Object, ObjectSection, SectionKind};
use tracing::{debug, warn};

/// Errors loading an ELF image
#[derive(Debug, thiserror::Error)]
pub enum ImageError
{
    #[error("Failed to read {}: {source}", path.display())]
    Io
    {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {source}", path.display())]
    Parse
    {
        path: PathBuf,
        source: object::Error,
    },

    #[error("Failed to read section {name}: {source}")]
    Section
    {
        name: String,
        source: object::Error,
    },

    #[error("{} is a 64-bit image, only 32-bit targets are supported", .0.display())]
    Not32Bit(PathBuf),
}

/// A loaded section of the program image
#[derive(Debug, Clone)]
pub struct RomSegment
{
    pub address: u32,
    pub data: Vec<u8>,
}

/// Debug information and program image of one ELF file
#[derive(Debug)]
pub struct ElfImage
{
    path: PathBuf,
    debug_sections: HashMap<&'static str, Vec<u8>>,
    rom: Vec<RomSegment>,
}

impl ElfImage
{
    /// Read and parse the ELF file at `path`
    ///
    /// ## Errors
    ///
    /// I/O and parse errors, and 64-bit images.
    pub fn load(path: &Path) -> Result<Self, ImageError>
    {
        let bytes = fs::read(path).map_err(|source| ImageError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file = object::File::parse(bytes.as_slice()).map_err(|source| ImageError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if file.is_64() {
            return Err(ImageError::Not32Bit(path.to_path_buf()));
        }
        if file.architecture() != object::Architecture::Arm {
            warn!(architecture = ?file.architecture(), "Image is not an ARM image");
        }

        let mut debug_sections = HashMap::new();
        for name in DebugSections::NAMES {
            let Some(section) = file.section_by_name(name) else {
                continue;
            };
            let data = section.uncompressed_data().map_err(|source| ImageError::Section {
                name: name.to_string(),
                source,
            })?;
            debug!(section = name, size = data.len(), "Loaded debug section");
            debug_sections.insert(name, data.into_owned());
        }

        let mut rom = Vec::new();
        for section in file.sections() {
            if !matches!(
                section.kind(),
                SectionKind::Text | SectionKind::ReadOnlyData | SectionKind::ReadOnlyString
            ) {
                continue;
            }
            let Ok(address) = u32::try_from(section.address()) else {
                continue;
            };
            let name = section.name().unwrap_or("<unnamed>");
            let data = section
                .uncompressed_data()
                .map_err(|source| ImageError::Section {
                    name: name.to_string(),
                    source,
                })?
                .into_owned();
            if data.is_empty() {
                continue;
            }
            debug!(section = %name, address = format_args!("0x{address:08x}"), size = data.len(), "Loaded program section");
            rom.push(RomSegment { address, data });
        }

        Ok(Self {
            path: path.to_path_buf(),
            debug_sections,
            rom,
        })
    }

    pub fn path(&self) -> &Path
    {
        &self.path
    }

    /// Borrowed view of the debug sections; absent sections are empty
    pub fn debug_sections(&self) -> DebugSections<'_>
    {
        DebugSections::from_lookup(|name| self.debug_sections.get(name).map(Vec::as_slice))
    }

    /// Allocated, initialized read-only sections
    pub fn rom_segments(&self) -> &[RomSegment]
    {
        &self.rom
    }
}
