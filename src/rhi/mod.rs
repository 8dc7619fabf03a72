pub mod device;
pub mod resources;

pub mod soft;
