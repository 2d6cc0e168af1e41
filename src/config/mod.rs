mod settings;

pub use settings::{IsolationConfig, LifecycleConfig, LogConfig, ServerConfig, Settings};
