//! Host-side hardening for spawned hypervisor processes.

pub mod seccomp;

pub use seccomp::HypervisorSeccomp;
