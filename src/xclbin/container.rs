//! Signed binary container (xclbin) section locator.
//!
//! The container starts with an 8-byte ASCII magic identifying the
//! format generation, followed by signature material, a fixed-offset
//! header and a table of section headers. Sections are located by a
//! linear scan of that table; an absent section is an empty result, not
//! an error, since different images carry different optional sections.
//!
//! Every section's byte range is validated against the blob length at
//! parse time, so downstream consumers can index section data without
//! re-checking container bounds.

use thiserror::Error;
use zerocopy::{FromBytes, Immutable, KnownLayout};

/// Magic bytes of the supported container generation: `xclbin2\0`.
pub const CONTAINER_MAGIC: [u8; 8] = *b"xclbin2\0";

/// Byte offset of the container header within the blob.
const HEADER_OFFSET: usize = 0x130;

/// Byte offset of the first section header within the blob.
const SECTIONS_OFFSET: usize = 0x1C8;

/// Size of one section-table entry.
const SECTION_HEADER_SIZE: usize = 40;

/// Sanity cap on the section count of a well-formed container.
const MAX_SECTIONS: usize = 0x10000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContainerError {
    /// `xclbin0` / `xclbin1` images are not parsed at all.
    #[error("legacy container generation is not supported")]
    LegacyFormat,
    #[error("unrecognized container magic {0:02x?}")]
    InvalidMagic([u8; 8]),
    #[error("container truncated: {got} bytes, need at least {need}")]
    Truncated { got: usize, need: usize },
    #[error("implausible section count {0}")]
    BadSectionCount(u32),
    #[error("section {index} range {offset:#x}+{size:#x} exceeds container length {len:#x}")]
    SectionOutOfBounds {
        index: usize,
        offset: u64,
        size: u64,
        len: usize,
    },
}

/// Section type tags consumed by this shim.
///
/// The on-disk tag space is larger; anything this shim does not touch
/// decodes as [`SectionKind::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    /// Bitstream payload (the simulator's loadable image).
    Bitstream,
    /// XML platform descriptor.
    EmbeddedMetadata,
    /// Presence marks the image as debuggable.
    DebugData,
    /// Memory-topology table.
    MemTopology,
    /// Connectivity table (argument to memory-row links).
    Connectivity,
    IpLayout,
    /// Compressed emulation auxiliary archive.
    EmulationData,
    /// Feature-detection marker selecting the alternate load path.
    AieMetadata,
    /// Grouped memory-topology table, preferred over [`SectionKind::MemTopology`].
    AskGroupTopology,
    Unknown(u32),
}

impl From<u32> for SectionKind {
    fn from(value: u32) -> Self {
        match value {
            0 => Self::Bitstream,
            2 => Self::EmbeddedMetadata,
            4 => Self::DebugData,
            6 => Self::MemTopology,
            7 => Self::Connectivity,
            8 => Self::IpLayout,
            21 => Self::EmulationData,
            25 => Self::AieMetadata,
            26 => Self::AskGroupTopology,
            other => Self::Unknown(other),
        }
    }
}

impl SectionKind {
    pub fn tag(self) -> u32 {
        match self {
            Self::Bitstream => 0,
            Self::EmbeddedMetadata => 2,
            Self::DebugData => 4,
            Self::MemTopology => 6,
            Self::Connectivity => 7,
            Self::IpLayout => 8,
            Self::EmulationData => 21,
            Self::AieMetadata => 25,
            Self::AskGroupTopology => 26,
            Self::Unknown(tag) => tag,
        }
    }
}

/// Container header (152 bytes at [`HEADER_OFFSET`]).
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RawHeader {
    pub length: u64,
    pub time_stamp: u64,
    pub feature_rom_time_stamp: u64,
    pub version_patch: u16,
    pub version_major: u8,
    pub version_minor: u8,
    pub mode: u16,
    pub action_mask: u16,
    pub interface_uuid: [u8; 16],
    pub platform_vbnv: [u8; 64],
    pub image_uuid: [u8; 16],
    pub debug_bin: [u8; 16],
    pub num_sections: u32,
    // Trailing pad keeps the following section headers 8-byte aligned.
    _padding: u32,
}

/// One section-table entry (40 bytes).
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RawSectionHeader {
    pub section_kind: u32,
    pub section_name: [u8; 16],
    // 4 bytes of implicit padding precede the u64 fields.
    pub section_offset: u64,
    pub section_size: u64,
}

/// A located section: a validated byte range of the container.
#[derive(Debug)]
pub struct Section<'a> {
    pub kind: SectionKind,
    pub name: String,
    pub offset: u64,
    pub data: &'a [u8],
}

impl Section<'_> {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Parsed container over a caller-owned byte blob.
pub struct Xclbin<'a> {
    data: &'a [u8],
    pub header: RawHeader,
    section_headers: Vec<RawSectionHeader>,
}

impl<'a> Xclbin<'a> {
    /// Parse a container blob.
    ///
    /// Legacy generations (`xclbin0`, `xclbin1`) and unknown magics are
    /// rejected without any further parsing.
    pub fn parse(data: &'a [u8]) -> Result<Self, ContainerError> {
        if data.len() < 8 {
            return Err(ContainerError::Truncated { got: data.len(), need: 8 });
        }
        if data.starts_with(b"xclbin0") || data.starts_with(b"xclbin1") {
            return Err(ContainerError::LegacyFormat);
        }
        if !data.starts_with(b"xclbin2") {
            let mut magic = [0u8; 8];
            magic.copy_from_slice(&data[..8]);
            return Err(ContainerError::InvalidMagic(magic));
        }

        if data.len() < SECTIONS_OFFSET {
            return Err(ContainerError::Truncated { got: data.len(), need: SECTIONS_OFFSET });
        }
        let (header, _) = RawHeader::read_from_prefix(&data[HEADER_OFFSET..])
            .map_err(|_| ContainerError::Truncated { got: data.len(), need: SECTIONS_OFFSET })?;

        let num_sections = header.num_sections as usize;
        if num_sections > MAX_SECTIONS {
            return Err(ContainerError::BadSectionCount(header.num_sections));
        }

        let mut section_headers = Vec::with_capacity(num_sections);
        for index in 0..num_sections {
            let entry_offset = SECTIONS_OFFSET + index * SECTION_HEADER_SIZE;
            let need = entry_offset + SECTION_HEADER_SIZE;
            if need > data.len() {
                return Err(ContainerError::Truncated { got: data.len(), need });
            }
            let (entry, _) = RawSectionHeader::read_from_prefix(&data[entry_offset..])
                .map_err(|_| ContainerError::Truncated { got: data.len(), need })?;

            let end = entry.section_offset.checked_add(entry.section_size);
            let in_bounds = end.is_some_and(|end| end <= data.len() as u64);
            if !in_bounds {
                return Err(ContainerError::SectionOutOfBounds {
                    index,
                    offset: entry.section_offset,
                    size: entry.section_size,
                    len: data.len(),
                });
            }
            section_headers.push(entry);
        }

        Ok(Self { data, header, section_headers })
    }

    /// Container UUID.
    pub fn uuid(&self) -> uuid::Uuid {
        uuid::Uuid::from_bytes(self.header.image_uuid)
    }

    /// Platform identification string.
    pub fn platform(&self) -> String {
        let bytes = &self.header.platform_vbnv;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[..end]).into_owned()
    }

    pub fn num_sections(&self) -> usize {
        self.section_headers.len()
    }

    /// Iterate over all sections. Ranges were validated at parse time.
    pub fn sections(&self) -> impl Iterator<Item = Section<'a>> + '_ {
        let data = self.data;
        self.section_headers.iter().map(move |hdr| {
            let offset = hdr.section_offset as usize;
            let size = hdr.section_size as usize;
            let name_end = hdr.section_name.iter().position(|&b| b == 0).unwrap_or(16);
            Section {
                kind: SectionKind::from(hdr.section_kind),
                name: String::from_utf8_lossy(&hdr.section_name[..name_end]).into_owned(),
                offset: hdr.section_offset,
                data: &data[offset..offset + size],
            }
        })
    }

    /// Locate a section by kind via linear scan of the section table.
    pub fn find_section(&self, kind: SectionKind) -> Option<Section<'a>> {
        self.sections().find(|s| s.kind == kind)
    }

    /// Grouped topology when present, plain topology otherwise.
    pub fn memory_topology_section(&self) -> Option<Section<'a>> {
        self.find_section(SectionKind::AskGroupTopology)
            .or_else(|| self.find_section(SectionKind::MemTopology))
    }
}
