pub mod archive;
pub mod compress;
pub mod config;
pub mod file_ext;
pub mod finish;
pub mod oplog;
pub mod orchestrator;
pub mod registry;
pub mod result_error;
pub mod validate;
pub mod volume;
