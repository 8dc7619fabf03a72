use thiserror::Error;

use crate::rhi::resources::MemoryLocation;

/// Failures reported by the native graphics API.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RhiError {
    #[error("out of device memory")]
    OutOfDeviceMemory,
    #[error("out of host memory")]
    OutOfHostMemory,
    #[error("failed to map device memory")]
    MemoryMapFailed,
    #[error("device lost")]
    DeviceLost,
    #[error("memory type {0} does not exist")]
    InvalidMemoryType(u32),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LifetimeError {
    #[error("reference count was already zero, the resource has been destroyed")]
    AlreadyDestroyed,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AllocationError {
    #[error("alignment {0} must be positive and fit in a signed pointer-sized integer")]
    InvalidAlignment(u64),
    #[error("zero-sized allocation")]
    ZeroSize,
    #[error("no memory type in mask {type_bits:#x} is usable for {location:?}")]
    NoCompatibleMemoryType {
        type_bits: u32,
        location: MemoryLocation,
    },
    #[error(transparent)]
    Device(#[from] RhiError),
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid settings: {0}")]
    Invalid(&'static str),
}
