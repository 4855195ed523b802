//! OS-level primitives for emulated networks.
//!
//! Uses Linux network namespaces, veth pairs and Open vSwitch bridges to
//! build switched networks on a single host. Every primitive is an RAII
//! handle that removes what it created when dropped.
//!
//! # Modules
//!
//! - [`command`]: The [`Runner`] seam through which every external program runs
//! - [`topology`]: Namespace and veth pair management
//! - [`switch`]: Open vSwitch bridges and controller registration
//! - [`test_util`]: Privilege checks, unique names and a recording runner

pub mod command;
pub mod switch;
pub mod test_util;
pub mod topology;

pub use command::{
    ChildTracker, Runner, SharedRunner, SystemRunner, Tracking, run, run_checked, stdout_of,
};
pub use switch::{Bridge, dpid_from_name};
pub use test_util::{RecordingRunner, check_ovs, check_privileges, unique_ns_name};
pub use topology::{IFNAME_MAX, Namespace, VethPair, configure_root_iface};
