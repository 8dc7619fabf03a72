pub mod fence;
pub mod memory;
pub mod multi_fence;
pub mod slots;
pub mod tracked;
