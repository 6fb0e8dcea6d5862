pub mod catalog;
pub mod compare;
pub mod config;
pub mod dataset;
pub mod engine;
pub mod errors;
pub mod fingerprint;
pub mod grading;
pub mod model;
pub mod redaction;
pub mod sandbox;
pub mod storage;
pub mod validate;

pub use grading::Grader;
