// Numan Thabit 2025
// io/mod.rs - socket, staging, and capability layers
pub mod caps;

#[cfg(target_os = "linux")]
pub mod packets;

#[cfg(target_os = "linux")]
pub mod sock;
