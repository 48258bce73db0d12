use serde::{Deserialize, Serialize};

use crate::domain::directory::UserId;

/// Number of leading characters of a Slack timestamp that make up whole seconds.
const EPOCH_SECONDS_WIDTH: usize = 10;

/// A message shortcut invocation, scoped to a single webhook call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortcutInvocation {
    pub callback_id: String,
    pub user_id: UserId,
    pub channel_id: String,
    pub message_ts: String,
    pub action_ts: String,
    pub trigger_id: Option<String>,
    pub team_id: Option<String>,
}

impl ShortcutInvocation {
    /// Replies for a shortcut go to the invoking user's DM, never to the origin channel.
    pub fn reply_channel(&self) -> &str {
        self.user_id.as_str()
    }

    /// The action timestamp truncated to whole seconds.
    pub fn counted_at(&self) -> &str {
        truncate_to_seconds(&self.action_ts)
    }
}

pub fn truncate_to_seconds(ts: &str) -> &str {
    match ts.char_indices().nth(EPOCH_SECONDS_WIDTH) {
        Some((index, _)) => &ts[..index],
        None => ts,
    }
}
