//! Slack integration for tally.
//!
//! - **Signing** (`signature`) - `v0` request signature verification
//! - **Events** (`events`) - interaction payload parsing and shortcut dispatch
//! - **Receiver** (`receiver`) - verify, acknowledge, then dispatch in the background
//! - **Shortcut** (`shortcut`) - the `count` reaction report
//! - **Web API** (`api`) - typed client for the handful of Slack methods used
//! - **Block Kit** (`blocks`) - reply message builders
//!
//! # Architecture
//!
//! ```text
//! HTTP POST -> InteractionReceiver -> EventDispatcher -> ReactionCountHandler
//!                                                             |
//!                                          DM replies <- SlackWebApi
//! ```

pub mod api;
pub mod blocks;
pub mod events;
pub mod receiver;
pub mod shortcut;
pub mod signature;
