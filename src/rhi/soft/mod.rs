pub mod device;
pub mod memory;
pub mod sync;

pub use device::{SoftDevice, SoftDeviceDesc};
pub use memory::SoftMemory;
pub use sync::SoftFence;
