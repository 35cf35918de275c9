//! Container networking: host bridge with NAT, per-container veth wiring.

mod firewall;
mod manager;
mod netns;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use firewall::*;
pub use manager::*;
pub use netns::*;
