pub mod collections;
pub mod error;
pub mod ra;
pub mod rhi;
pub mod settings;
