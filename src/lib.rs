//! SDN Bootstrap Library
//!
//! Builds an emulated OpenFlow network on a single Linux host: hosts in
//! network namespaces, Open vSwitch bridges for switches, veth pairs for
//! links. Physical interfaces can be wired into switches, and the whole
//! subnet can reach the internet through a NAT gateway in the root
//! namespace.

// Use mimalloc as the global allocator for tests (non-Windows only)
#[cfg(not(windows))]
#[cfg(test)]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod attach;
pub mod bootstrap;
pub mod config;
pub mod gateway;
pub mod network;
pub mod session;
pub mod topology;

#[cfg(test)]
pub mod tests;

// Re-export commonly used items
pub use attach::{AttachError, attach_interface, check_interface};
pub use bootstrap::{Emulation, bootstrap};
pub use config::{BootstrapConfig, Cli};
pub use gateway::{Gateway, GatewayConfig, GatewayState, Step};
pub use network::Network;
pub use topology::{Controller, Ipv4Cidr, Topology, TopologyError};
