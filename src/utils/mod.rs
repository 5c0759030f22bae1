pub mod error;
pub mod file;
