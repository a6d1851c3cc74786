pub mod channel_watcher;
pub mod debounce;
pub mod group_watcher;
pub mod models;
pub mod playback;
pub mod reconciler;
pub mod service;
pub mod session;
pub mod snapshot;
pub mod sounds;
