mod core;

pub use crate::core::{cmd, config, container, error, execute, network};

// Re-export commonly used types for integration tests
pub use crate::core::{Commands, NetCreateArgs, NetRemoveArgs, NetworkCommands, RunArgs, CLI};
