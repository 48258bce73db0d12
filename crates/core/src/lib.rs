pub mod config;
pub mod domain;

pub use domain::directory::{DirectoryUser, UserId};
pub use domain::invocation::ShortcutInvocation;
pub use domain::reaction::{Reaction, ReactionTally};
