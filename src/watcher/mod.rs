pub mod app;
pub mod service;

pub use app::{AppWatcher, AppWatcherHandle};
pub use service::{ServiceWatcher, ServiceWatcherHandle};
