//! Address spaces.
//!
//! - [`space`] - CIDR decomposition into individually allocatable addresses

pub mod space;

pub use space::{parse_address, AddressIter, AddressSpace, ReservationPolicy};
