// Kernel-facing backends

pub mod attach;
pub mod conntrack;
pub mod offload;
