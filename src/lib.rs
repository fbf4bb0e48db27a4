pub mod archive;
pub mod config;
pub mod console;
pub mod ipc;
pub mod status;
pub mod supervisor;
pub mod utils;
