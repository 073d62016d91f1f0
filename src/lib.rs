// FTP File-System Abstraction Layer - Library
//
// This library provides the virtual file system an FTP server runs its
// sessions against, over a direct-path store and a provider tree store

pub mod config;
pub mod console;
pub mod fsal;

// Re-export commonly used types
pub use fsal::{BackendConfig, FileId, FileSystemView, FtpFile, PooledView, User, ViewFactory};
