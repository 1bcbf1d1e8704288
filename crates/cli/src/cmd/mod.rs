mod build;
mod plan;
mod request;
mod status;

pub use build::{BuildArgs, cmd_build};
pub use plan::cmd_plan;
pub use request::RequestArgs;
pub use status::cmd_status;
