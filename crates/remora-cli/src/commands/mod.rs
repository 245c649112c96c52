pub mod files;
pub mod hierarchy;
pub mod remap;
