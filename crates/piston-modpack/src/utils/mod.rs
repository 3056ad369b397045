pub mod hash;
pub mod maven;
pub mod process;
