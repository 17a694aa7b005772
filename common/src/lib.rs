pub mod access;
pub mod constants;
