//! Memory-topology and connectivity tables.
//!
//! Both sections are `i32` element counts followed by fixed-size rows.
//! A connectivity row refers into the memory topology by index; that
//! index is bounds-checked against the topology's element count before
//! use, and an out-of-range reference is a hard failure of the image
//! load.

use thiserror::Error;
use zerocopy::{FromBytes, Immutable, KnownLayout};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("section truncated: {got} bytes, need {need}")]
    Truncated { got: usize, need: usize },
    #[error("implausible element count {0}")]
    BadCount(i32),
    #[error("memory-topology index {index} out of range (count {count})")]
    IndexOutOfRange { index: i32, count: usize },
}

/// Memory row classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemType {
    Ddr3,
    Ddr4,
    Dram,
    /// Streaming rows carry a flow identifier instead of a base address.
    Streaming,
    PreallocatedGlob,
    Are,
    Hbm,
    Bram,
    Uram,
    StreamingConnection,
    Unknown(u8),
}

impl From<u8> for MemType {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Ddr3,
            1 => Self::Ddr4,
            2 => Self::Dram,
            3 => Self::Streaming,
            4 => Self::PreallocatedGlob,
            5 => Self::Are,
            6 => Self::Hbm,
            7 => Self::Bram,
            8 => Self::Uram,
            9 => Self::StreamingConnection,
            other => Self::Unknown(other),
        }
    }
}

/// One memory-topology row (40 bytes).
///
/// The two 64-bit fields are unions on disk: size/route-id and
/// base-address/flow-id, disambiguated by the row type.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RawMemData {
    pub mem_type: u8,
    pub used: u8,
    _pad: [u8; 6],
    pub size_or_route: u64,
    pub base_or_flow: u64,
    pub tag: [u8; 16],
}

impl RawMemData {
    pub fn kind(&self) -> MemType {
        MemType::from(self.mem_type)
    }

    /// Flow identifier of a streaming row.
    pub fn flow_id(&self) -> u64 {
        self.base_or_flow
    }

    /// Route identifier of a streaming row.
    pub fn route_id(&self) -> u64 {
        self.size_or_route
    }

    /// The row's tag string, e.g. a bank or stream name.
    pub fn tag(&self) -> String {
        let end = self.tag.iter().position(|&b| b == 0).unwrap_or(self.tag.len());
        String::from_utf8_lossy(&self.tag[..end]).into_owned()
    }
}

/// One connectivity row (12 bytes): which argument of which instance is
/// wired to which memory row.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RawConnection {
    pub arg_index: i32,
    pub ip_layout_index: i32,
    pub mem_data_index: i32,
}

/// A compute-unit instance is addressed by the upper half of its flow
/// identifier.
pub fn instance_base(flow_id: u64) -> u64 {
    flow_id & 0xFFFF_0000
}

fn parse_rows<T: FromBytes + KnownLayout + Immutable + Copy>(
    data: &[u8],
    rows_offset: usize,
) -> Result<Vec<T>, TopologyError> {
    if data.len() < 4 {
        return Err(TopologyError::Truncated { got: data.len(), need: 4 });
    }
    let count = i32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if count < 0 {
        return Err(TopologyError::BadCount(count));
    }
    let count = count as usize;
    let row_size = std::mem::size_of::<T>();
    let need = rows_offset + count * row_size;
    if data.len() < need {
        return Err(TopologyError::Truncated { got: data.len(), need });
    }

    let mut rows = Vec::with_capacity(count);
    for i in 0..count {
        let at = rows_offset + i * row_size;
        let (row, _) = T::read_from_prefix(&data[at..])
            .map_err(|_| TopologyError::Truncated { got: data.len(), need })?;
        rows.push(row);
    }
    Ok(rows)
}

/// Parsed memory-topology section.
#[derive(Debug)]
pub struct MemTopology {
    rows: Vec<RawMemData>,
}

impl MemTopology {
    /// Rows start at offset 8: the count plus alignment padding for the
    /// 64-bit row fields.
    pub fn parse(data: &[u8]) -> Result<Self, TopologyError> {
        Ok(Self { rows: parse_rows(data, 8)? })
    }

    pub fn count(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[RawMemData] {
        &self.rows
    }

    /// Bounds-checked row access for indices taken from other sections.
    pub fn row(&self, index: i32) -> Result<&RawMemData, TopologyError> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.rows.get(i))
            .ok_or(TopologyError::IndexOutOfRange { index, count: self.rows.len() })
    }
}

/// Parsed connectivity section.
#[derive(Debug)]
pub struct Connectivity {
    rows: Vec<RawConnection>,
}

impl Connectivity {
    /// Rows start directly after the 4-byte count.
    pub fn parse(data: &[u8]) -> Result<Self, TopologyError> {
        Ok(Self { rows: parse_rows(data, 4)? })
    }

    pub fn count(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[RawConnection] {
        &self.rows
    }
}
