//! helpers shared by the filesystem components
pub mod digest;
pub mod fs_size_calculator;
pub mod time_util;
pub mod traits;
