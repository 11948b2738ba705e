// Portable core of the node firmware. Hardware backends live in `esp` and
// only build for the device; `sim` stands in for them on the host.

pub mod config;
pub mod coordinator;
pub mod display;
pub mod error;
pub mod logging;
pub mod mqtt;
pub mod network;
pub mod ota;
pub mod scheduler;
pub mod sensors;
pub mod state;
pub mod system;
pub mod version;

#[cfg(not(target_os = "espidf"))]
pub mod sim;

#[cfg(target_os = "espidf")]
pub mod esp;
