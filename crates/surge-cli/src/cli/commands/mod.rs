mod get;
mod pause;
mod remove;
mod resume;
mod status;

pub use get::run_get;
pub use pause::run_pause;
pub use remove::run_remove;
pub use resume::run_resume;
pub use status::run_status;
