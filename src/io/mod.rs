pub mod crypto;
pub mod downloader;
pub mod net;
pub mod progress;
