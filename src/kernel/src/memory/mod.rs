//! User memory.
//!
//! - `frame`: the reference-counted physical frame pool
//! - `address_space`: per-environment page tables over that pool

pub mod address_space;
pub mod frame;

pub use address_space::AddressSpace;
pub use frame::{Page, PhysMemory};
