//! The `count` message shortcut.
//!
//! Reports, per emoji reaction on the target message, the emails of the
//! users who added it. Every reply goes to the invoking user's DM, never to
//! the channel the shortcut was triggered from.

use std::sync::Arc;

use async_trait::async_trait;
use tally_core::{ReactionTally, ShortcutInvocation};
use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::api::{OutgoingMessage, SlackApiError, SlackWebApi, SnippetUpload};
use crate::blocks::{
    lookup_error_message, no_reactions_message, permalink_message, reaction_caption,
};
use crate::events::{EventContext, EventHandlerError, HandlerResult, ShortcutHandler};

pub const DEFAULT_CALLBACK_ID: &str = "count";

#[derive(Debug, Error)]
pub enum ShortcutError {
    #[error("failed to resolve message permalink: {0}")]
    Permalink(#[source] SlackApiError),
    #[error("failed to list message reactions: {0}")]
    ReactionLookup(#[source] SlackApiError),
    #[error("failed to list workspace members: {0}")]
    Directory(#[source] SlackApiError),
    #[error("failed to post reply: {0}")]
    Reply(#[source] SlackApiError),
    #[error("{failed} of {total} reaction uploads failed; first failure on `{reaction}`: {source}")]
    Uploads {
        failed: usize,
        total: usize,
        reaction: String,
        #[source]
        source: UploadFailure,
    },
}

#[derive(Debug, Error)]
pub enum UploadFailure {
    #[error(transparent)]
    Api(#[from] SlackApiError),
    #[error("upload task did not complete: {0}")]
    Task(#[from] JoinError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShortcutOutcome {
    NoReactions,
    Reported { reactions: usize },
}

pub struct ReactionCountHandler {
    api: Arc<dyn SlackWebApi>,
    callback_id: String,
}

impl ReactionCountHandler {
    pub fn new(api: Arc<dyn SlackWebApi>, callback_id: impl Into<String>) -> Self {
        Self { api, callback_id: callback_id.into() }
    }

    pub async fn run(
        &self,
        invocation: &ShortcutInvocation,
        ctx: &EventContext,
    ) -> Result<ShortcutOutcome, ShortcutError> {
        let permalink = self
            .api
            .resolve_permalink(&invocation.channel_id, &invocation.message_ts)
            .await
            .map_err(ShortcutError::Permalink)?;

        let reactions = match self
            .api
            .list_reactions(&invocation.channel_id, &invocation.message_ts)
            .await
        {
            Ok(reactions) => reactions,
            Err(lookup_error) => {
                error!(
                    event_name = "shortcut.reactions.lookup_failed",
                    correlation_id = %ctx.correlation_id,
                    channel_id = %invocation.channel_id,
                    message_ts = %invocation.message_ts,
                    method = lookup_error.method(),
                    error_code = lookup_error.code(),
                    error = %lookup_error,
                    "reaction lookup failed"
                );
                self.report_lookup_error(invocation, ctx, lookup_error.code()).await;
                return Err(ShortcutError::ReactionLookup(lookup_error));
            }
        };

        if reactions.is_empty() {
            let message = OutgoingMessage::new(
                invocation.reply_channel(),
                no_reactions_message(invocation.counted_at(), &permalink),
            )
            .parse_full();
            self.api.post_message(&message).await.map_err(ShortcutError::Reply)?;

            info!(
                event_name = "shortcut.reply.no_reactions",
                correlation_id = %ctx.correlation_id,
                user_id = %invocation.user_id,
                "reported message without reactions"
            );
            return Ok(ShortcutOutcome::NoReactions);
        }

        let directory = self.api.list_users().await.map_err(ShortcutError::Directory)?;
        let parent = self
            .api
            .post_message(&OutgoingMessage::new(
                invocation.reply_channel(),
                permalink_message(&permalink),
            ))
            .await
            .map_err(ShortcutError::Reply)?;

        let total = reactions.len();
        let mut uploads = JoinSet::new();
        for (index, reaction) in reactions.iter().enumerate() {
            let tally = ReactionTally::from_directory(reaction, &directory);
            let upload = SnippetUpload {
                channel: parent.channel.clone(),
                thread_ts: parent.ts.clone(),
                filename: format!("{}.txt", tally.name),
                content: tally.content(),
                initial_comment: reaction_caption(&tally.name, tally.count),
            };
            let api = Arc::clone(&self.api);
            uploads.spawn(async move {
                let result = api.upload_snippet(&upload).await;
                (index, tally.name, result)
            });
        }

        // Keyed by reaction order so the reported failure does not depend on completion order.
        let mut failures: Vec<(usize, String, UploadFailure)> = Vec::new();
        while let Some(joined) = uploads.join_next().await {
            let (index, reaction, failure) = match joined {
                Ok((_, reaction, Ok(()))) => {
                    debug!(
                        event_name = "shortcut.upload.completed",
                        correlation_id = %ctx.correlation_id,
                        reaction = %reaction,
                        "reaction snippet uploaded"
                    );
                    continue;
                }
                Ok((index, reaction, Err(api_error))) => {
                    (index, reaction, UploadFailure::from(api_error))
                }
                Err(join_error) => {
                    (usize::MAX, "unknown".to_owned(), UploadFailure::from(join_error))
                }
            };

            warn!(
                event_name = "shortcut.upload.failed",
                correlation_id = %ctx.correlation_id,
                reaction = %reaction,
                error = %failure,
                "reaction snippet upload failed"
            );
            failures.push((index, reaction, failure));
        }

        let failed = failures.len();
        failures.sort_by_key(|(index, _, _)| *index);
        if let Some((_, reaction, source)) = failures.into_iter().next() {
            return Err(ShortcutError::Uploads { failed, total, reaction, source });
        }

        info!(
            event_name = "shortcut.reply.reported",
            correlation_id = %ctx.correlation_id,
            user_id = %invocation.user_id,
            reactions = total,
            "reported reactions"
        );
        Ok(ShortcutOutcome::Reported { reactions: total })
    }

    async fn report_lookup_error(
        &self,
        invocation: &ShortcutInvocation,
        ctx: &EventContext,
        code: &str,
    ) {
        let message = OutgoingMessage::new(invocation.reply_channel(), lookup_error_message(code));
        if let Err(post_error) = self.api.post_message(&message).await {
            warn!(
                event_name = "shortcut.reply.error_post_failed",
                correlation_id = %ctx.correlation_id,
                user_id = %invocation.user_id,
                error = %post_error,
                "failed to tell user about reaction lookup failure"
            );
        }
    }
}

#[async_trait]
impl ShortcutHandler for ReactionCountHandler {
    fn callback_id(&self) -> &str {
        &self.callback_id
    }

    async fn handle(
        &self,
        invocation: &ShortcutInvocation,
        ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError> {
        self.run(invocation, ctx).await?;
        Ok(HandlerResult::Processed)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Arc;

    use async_trait::async_trait;
    use tally_core::{DirectoryUser, Reaction, ShortcutInvocation, UserId};
    use tokio::sync::Mutex;

    use super::{ReactionCountHandler, ShortcutError, ShortcutOutcome, UploadFailure};
    use crate::api::{OutgoingMessage, PostedMessage, SlackApiError, SlackWebApi, SnippetUpload};
    use crate::events::EventContext;

    const PERMALINK: &str = "https://example.slack.com/archives/C200/p1730000000000100";

    #[derive(Default)]
    struct ScriptedSlackApi {
        state: Mutex<ScriptedState>,
    }

    #[derive(Default)]
    struct ScriptedState {
        reactions: Option<Result<Vec<Reaction>, String>>,
        users: Vec<DirectoryUser>,
        failing_uploads: HashMap<String, String>,
        post_results: VecDeque<Result<(), String>>,
        posted: Vec<OutgoingMessage>,
        uploads: Vec<SnippetUpload>,
        users_calls: usize,
    }

    impl ScriptedSlackApi {
        fn with_reactions(reactions: Vec<Reaction>, users: Vec<DirectoryUser>) -> Self {
            Self {
                state: Mutex::new(ScriptedState {
                    reactions: Some(Ok(reactions)),
                    users,
                    ..ScriptedState::default()
                }),
            }
        }

        fn with_lookup_error(code: &str) -> Self {
            Self {
                state: Mutex::new(ScriptedState {
                    reactions: Some(Err(code.to_owned())),
                    ..ScriptedState::default()
                }),
            }
        }

        async fn fail_upload(&self, filename: &str, code: &str) {
            self.state.lock().await.failing_uploads.insert(filename.to_owned(), code.to_owned());
        }

        async fn fail_next_post(&self, code: &str) {
            self.state.lock().await.post_results.push_back(Err(code.to_owned()));
        }

        async fn posted(&self) -> Vec<OutgoingMessage> {
            self.state.lock().await.posted.clone()
        }

        async fn uploads(&self) -> Vec<SnippetUpload> {
            let mut uploads = self.state.lock().await.uploads.clone();
            uploads.sort_by(|left, right| left.filename.cmp(&right.filename));
            uploads
        }
    }

    fn api_error(method: &'static str, code: &str) -> SlackApiError {
        SlackApiError::Api { method, code: code.to_owned() }
    }

    #[async_trait]
    impl SlackWebApi for ScriptedSlackApi {
        async fn resolve_permalink(
            &self,
            _channel_id: &str,
            _message_ts: &str,
        ) -> Result<String, SlackApiError> {
            Ok(PERMALINK.to_owned())
        }

        async fn list_reactions(
            &self,
            _channel_id: &str,
            _message_ts: &str,
        ) -> Result<Vec<Reaction>, SlackApiError> {
            match self.state.lock().await.reactions.clone().unwrap_or(Ok(Vec::new())) {
                Ok(reactions) => Ok(reactions),
                Err(code) => Err(api_error("reactions.get", &code)),
            }
        }

        async fn list_users(&self) -> Result<Vec<DirectoryUser>, SlackApiError> {
            let mut state = self.state.lock().await;
            state.users_calls += 1;
            Ok(state.users.clone())
        }

        async fn post_message(
            &self,
            message: &OutgoingMessage,
        ) -> Result<PostedMessage, SlackApiError> {
            let mut state = self.state.lock().await;
            if let Some(Err(code)) = state.post_results.pop_front() {
                return Err(api_error("chat.postMessage", &code));
            }
            state.posted.push(message.clone());
            // Posting to a user id lands in that user's DM conversation.
            let channel = match message.channel.strip_prefix('U') {
                Some(user) => format!("D{user}"),
                None => message.channel.clone(),
            };
            Ok(PostedMessage {
                channel,
                ts: format!("1730000200.00000{}", state.posted.len()),
            })
        }

        async fn upload_snippet(&self, upload: &SnippetUpload) -> Result<(), SlackApiError> {
            let mut state = self.state.lock().await;
            if let Some(code) = state.failing_uploads.get(&upload.filename) {
                return Err(api_error("files.completeUploadExternal", code));
            }
            state.uploads.push(upload.clone());
            Ok(())
        }
    }

    fn invocation() -> ShortcutInvocation {
        ShortcutInvocation {
            callback_id: "count".to_owned(),
            user_id: UserId("U100".to_owned()),
            channel_id: "C200".to_owned(),
            message_ts: "1730000000.000100".to_owned(),
            action_ts: "1730000123.456789".to_owned(),
            trigger_id: None,
            team_id: None,
        }
    }

    fn reaction(name: &str, users: &[&str]) -> Reaction {
        Reaction {
            name: name.to_owned(),
            count: users.len() as u32,
            users: users.iter().map(|id| UserId((*id).to_owned())).collect(),
        }
    }

    fn directory() -> Vec<DirectoryUser> {
        vec![
            DirectoryUser::new("U1", Some("ada@example.com")),
            DirectoryUser::new("U2", None),
            DirectoryUser::new("U3", Some("grace@example.com")),
            DirectoryUser::new("U4", Some("")),
        ]
    }

    fn handler(api: &Arc<ScriptedSlackApi>) -> ReactionCountHandler {
        ReactionCountHandler::new(api.clone(), "count")
    }

    #[tokio::test]
    async fn zero_reactions_posts_single_dated_reply_to_invoker() {
        let api = Arc::new(ScriptedSlackApi::with_reactions(Vec::new(), directory()));

        let outcome =
            handler(&api).run(&invocation(), &EventContext::default()).await.expect("run");

        assert_eq!(outcome, ShortcutOutcome::NoReactions);
        let posted = api.posted().await;
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].channel, "U100");
        assert!(posted[0].parse_full);
        let texts: Vec<&str> = posted[0].template.texts().collect();
        assert!(texts.contains(&"No one has added reaction."));
        assert!(texts.iter().any(|text| text.starts_with("<!date^1730000123^")
            && text.ends_with(&format!("<{PERMALINK}|View message>"))));
        assert!(api.uploads().await.is_empty());
        assert_eq!(api.state.lock().await.users_calls, 0);
    }

    #[tokio::test]
    async fn reactions_produce_one_parent_and_one_threaded_upload_each() {
        let api = Arc::new(ScriptedSlackApi::with_reactions(
            vec![reaction("thumbsup", &["U1", "U2", "U3"]), reaction("eyes", &["U3"])],
            directory(),
        ));

        let outcome =
            handler(&api).run(&invocation(), &EventContext::default()).await.expect("run");

        assert_eq!(outcome, ShortcutOutcome::Reported { reactions: 2 });
        let posted = api.posted().await;
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].channel, "U100");
        assert!(!posted[0].parse_full);
        assert!(posted[0].template.texts().any(|text| text == PERMALINK));

        let uploads = api.uploads().await;
        assert_eq!(uploads.len(), 2);
        assert_eq!(uploads[0].filename, "eyes.txt");
        assert_eq!(uploads[0].content, "grace@example.com");
        assert_eq!(uploads[0].initial_comment, "*Reaction:* :eyes:\n*Count:* 1");
        assert_eq!(uploads[1].filename, "thumbsup.txt");
        assert_eq!(uploads[1].content, "ada@example.com\ngrace@example.com");
        assert_eq!(uploads[1].initial_comment, "*Reaction:* :thumbsup:\n*Count:* 3");
        assert!(uploads
            .iter()
            .all(|upload| upload.channel == "D100" && upload.thread_ts == "1730000200.000001"));
    }

    #[tokio::test]
    async fn reaction_by_users_without_email_uploads_empty_snippet() {
        let api = Arc::new(ScriptedSlackApi::with_reactions(
            vec![reaction("robot_face", &["U2", "U4", "U999"])],
            directory(),
        ));

        handler(&api).run(&invocation(), &EventContext::default()).await.expect("run");

        let uploads = api.uploads().await;
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].content, "");
    }

    #[tokio::test]
    async fn lookup_failure_posts_error_code_and_propagates() {
        let api = Arc::new(ScriptedSlackApi::with_lookup_error("message_not_found"));

        let error = handler(&api)
            .run(&invocation(), &EventContext::default())
            .await
            .expect_err("lookup should fail");

        assert!(matches!(
            &error,
            ShortcutError::ReactionLookup(SlackApiError::Api { code, .. })
                if code == "message_not_found"
        ));
        let posted = api.posted().await;
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].channel, "U100");
        assert_eq!(posted[0].template.fallback_text, "message_not_found");
        assert!(posted[0].template.texts().any(|text| text == "*Error*: `message_not_found`"));
    }

    #[tokio::test]
    async fn lookup_failure_is_still_returned_when_error_reply_fails() {
        let api = Arc::new(ScriptedSlackApi::with_lookup_error("channel_not_found"));
        api.fail_next_post("ratelimited").await;

        let error = handler(&api)
            .run(&invocation(), &EventContext::default())
            .await
            .expect_err("lookup should fail");

        assert!(matches!(error, ShortcutError::ReactionLookup(_)));
        assert!(api.posted().await.is_empty());
    }

    #[tokio::test]
    async fn upload_failures_are_aggregated_after_every_task_finishes() {
        let api = Arc::new(ScriptedSlackApi::with_reactions(
            vec![
                reaction("thumbsup", &["U1"]),
                reaction("eyes", &["U3"]),
                reaction("tada", &["U1", "U3"]),
            ],
            directory(),
        ));
        api.fail_upload("eyes.txt", "not_in_channel").await;

        let error = handler(&api)
            .run(&invocation(), &EventContext::default())
            .await
            .expect_err("one upload should fail");

        match error {
            ShortcutError::Uploads { failed, total, reaction, source } => {
                assert_eq!((failed, total), (1, 3));
                assert_eq!(reaction, "eyes");
                assert!(matches!(source, UploadFailure::Api(SlackApiError::Api { .. })));
            }
            other => panic!("expected aggregate upload error, got {other:?}"),
        }
        let uploaded: Vec<String> =
            api.uploads().await.into_iter().map(|upload| upload.filename).collect();
        assert_eq!(uploaded, vec!["tada.txt".to_owned(), "thumbsup.txt".to_owned()]);
    }

    #[tokio::test]
    async fn uploads_are_shared_into_the_dm_the_parent_landed_in() {
        let api = Arc::new(ScriptedSlackApi::with_reactions(
            vec![reaction("thumbsup", &["U1"]), reaction("eyes", &["U3"])],
            directory(),
        ));

        handler(&api).run(&invocation(), &EventContext::default()).await.expect("run");

        let posted = api.posted().await;
        assert_eq!(posted[0].channel, "U100");
        let uploads = api.uploads().await;
        assert_eq!(uploads.len(), 2);
        for upload in &uploads {
            assert_eq!(upload.channel, "D100");
            assert_ne!(upload.channel, invocation().channel_id);
        }
    }

    #[tokio::test]
    async fn several_upload_failures_report_the_earliest_reaction() {
        let reactions = vec![
            reaction("thumbsup", &["U1"]),
            reaction("eyes", &["U3"]),
            reaction("tada", &["U1", "U3"]),
            reaction("rocket", &["U3"]),
        ];

        for _ in 0..8 {
            let api =
                Arc::new(ScriptedSlackApi::with_reactions(reactions.clone(), directory()));
            api.fail_upload("rocket.txt", "file_too_large").await;
            api.fail_upload("eyes.txt", "not_in_channel").await;

            let error = handler(&api)
                .run(&invocation(), &EventContext::default())
                .await
                .expect_err("two uploads should fail");

            match error {
                ShortcutError::Uploads { failed, total, reaction, source } => {
                    assert_eq!((failed, total), (2, 4));
                    assert_eq!(reaction, "eyes");
                    assert!(matches!(
                        source,
                        UploadFailure::Api(SlackApiError::Api { ref code, .. })
                            if code == "not_in_channel"
                    ));
                }
                other => panic!("expected aggregate upload error, got {other:?}"),
            }
            assert_eq!(api.uploads().await.len(), 2);
        }
    }
}
