pub mod cache;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod error;
pub mod linkage;
pub mod multihash;
pub mod output;
pub mod probe;
pub mod producer;
pub mod sync;
pub mod upload;
pub mod verify;
