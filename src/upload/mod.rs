//! Background upload pipeline

pub mod record;
pub mod service;

pub use record::UploadRecord;
pub use service::{StagingFile, UploadEvent, UploadService};
