mod info;
mod init;
mod run;

pub use info::{current_time, random_id, ContainerInfo, ContainerStatus};
pub use init::{init, launch, ContainerProcess, INIT_COMMAND};
pub use run::{run_container, RunOptions};
