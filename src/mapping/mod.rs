//! External address mappings.
//!
//! - [`record`] - Mapping records, requests and the instance directory seam
//! - [`table`] - The mapping table and its reservation protocol
//!
//! A mapping's external address is unique across the whole system; the
//! store keys mapping records by it.

pub mod record;
pub mod table;

pub use record::{InstanceDirectory, Link, LinkScope, MapRequest, MappedIp, MappingKey, NoInstances};
pub use table::MappingTable;
