pub mod bench;
pub mod config;
pub mod error;
pub mod exec;
pub mod plot;
pub mod result;
pub mod util;
