pub mod bit_vector;
pub mod usage_bitmap;
