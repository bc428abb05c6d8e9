pub mod awake;
pub mod backend;
pub mod concat;
pub mod config;
pub mod domain;
pub mod error;
pub mod grouper;
pub mod inspector;
pub mod manager;
pub mod output;
pub mod progress;
pub mod s3;
pub mod sample;
pub mod session;
pub mod source;
pub mod store;
pub mod validator;
