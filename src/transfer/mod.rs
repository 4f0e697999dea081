pub mod chunk;
pub mod extent;
pub mod part_size;
pub mod pool;
pub mod stats;
