//! Binary image container handling.
//!
//! An image ("container") bundles the simulator-loadable bitstream with
//! optional metadata sections. This module locates sections by tag,
//! validates the embedded platform descriptor and decodes the memory
//! topology and connectivity tables the load pipeline joins together.
//!
//! Section content beyond those tables is treated as opaque bytes; the
//! shim only carves byte ranges and hands them on.

pub mod container;
pub mod metadata;
pub mod topology;

pub use container::{ContainerError, Section, SectionKind, Xclbin, CONTAINER_MAGIC};
pub use metadata::{MetadataError, PlatformMetadata};
pub use topology::{
    instance_base, Connectivity, MemTopology, MemType, RawConnection, RawMemData, TopologyError,
};
