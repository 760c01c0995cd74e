pub mod coordinator;
pub mod jobs;

pub use coordinator::*;
pub use jobs::*;
