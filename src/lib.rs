//! Surveys the global population of Valve A2S game servers: walks the
//! master-server directory, then queries each discovered server for its
//! identity (A2S_INFO) and configuration variables (A2S_RULES).
pub mod batch;
pub mod codec;
pub mod error;
pub mod master;
pub mod query;
pub mod transport;
pub mod types;
