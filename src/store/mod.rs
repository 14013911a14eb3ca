//! Notification persistence backends.

pub mod memory;
pub mod rest;

pub use memory::MemoryNotificationStore;
pub use rest::RestNotificationRecorder;
