pub mod jobs;
pub mod live;

pub use jobs::*;
pub use live::*;
