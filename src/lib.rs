pub mod classifier;
pub mod config;
pub mod content;
pub mod cover;
pub mod database;
pub mod errors;
pub mod session;
pub mod single_instance;
pub mod uploader;

pub use classifier::{classify, ErrorCategory, RawSignal};
pub use errors::{AppError, AppResult};
pub use uploader::{PublishOutcome, UploadOrchestrator};
