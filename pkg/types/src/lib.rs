pub mod config;
pub mod job;
pub mod status;
pub mod validate;
pub mod vm_id;

pub use vm_id::VmId;
