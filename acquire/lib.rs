#![deny(unused_variables)]
#![deny(dead_code)]

pub mod config;
pub mod data;
pub mod diagnostics;
pub mod iterate;
pub mod kmeans;
pub mod partition;
pub mod pool;
pub mod regressor;
pub mod scoring;
pub mod select;
pub mod types;
