pub mod endpoint;
pub mod prediction;

pub use endpoint::*;
pub use prediction::*;
