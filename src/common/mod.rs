// Common module - shared configuration across session and sync

pub mod config;

pub use config::RemoteConfig;
