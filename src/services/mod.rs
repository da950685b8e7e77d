// src/services/mod.rs

pub mod accumulator;
pub mod approval;
pub mod archiver;
pub mod audit;
pub mod classifier;
pub mod completion;
pub mod erp;
pub mod ingest;
pub mod notify;
pub mod permission;
pub mod report_store;
pub mod settings;
