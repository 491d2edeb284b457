pub mod fs_atomic;
pub mod paths;
pub mod target_filter;
pub mod text;
