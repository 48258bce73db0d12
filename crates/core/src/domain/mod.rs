pub mod directory;
pub mod invocation;
pub mod reaction;
