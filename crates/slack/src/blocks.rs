use serde::Serialize;

pub const NO_REACTIONS_TEXT: &str = "No one has added reaction.";
pub const REACTIONS_FALLBACK_TEXT: &str = "reactions";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TextObject {
    PlainText { text: String },
    Mrkdwn { text: String },
}

impl TextObject {
    pub fn plain(text: impl Into<String>) -> Self {
        Self::PlainText { text: text.into() }
    }

    pub fn mrkdwn(text: impl Into<String>) -> Self {
        Self::Mrkdwn { text: text.into() }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::PlainText { text } | Self::Mrkdwn { text } => text,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Section { block_id: String, text: TextObject },
    Context { block_id: String, elements: Vec<TextObject> },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MessageTemplate {
    pub fallback_text: String,
    pub blocks: Vec<Block>,
}

impl MessageTemplate {
    /// Every text fragment in the message, fallback first.
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.fallback_text.as_str()).chain(self.blocks.iter().flat_map(|block| {
            let texts: Vec<&str> = match block {
                Block::Section { text, .. } => vec![text.text()],
                Block::Context { elements, .. } => elements.iter().map(TextObject::text).collect(),
            };
            texts
        }))
    }
}

pub struct MessageBuilder {
    fallback_text: String,
    blocks: Vec<Block>,
}

impl MessageBuilder {
    pub fn new(fallback_text: impl Into<String>) -> Self {
        Self { fallback_text: fallback_text.into(), blocks: Vec::new() }
    }

    pub fn section<F>(mut self, block_id: impl Into<String>, build: F) -> Self
    where
        F: FnOnce(&mut SectionBuilder),
    {
        let mut builder = SectionBuilder::default();
        build(&mut builder);
        self.blocks.push(Block::Section { block_id: block_id.into(), text: builder.build() });
        self
    }

    pub fn context<F>(mut self, block_id: impl Into<String>, build: F) -> Self
    where
        F: FnOnce(&mut ContextBuilder),
    {
        let mut builder = ContextBuilder::default();
        build(&mut builder);
        self.blocks.push(Block::Context { block_id: block_id.into(), elements: builder.build() });
        self
    }

    pub fn build(self) -> MessageTemplate {
        MessageTemplate { fallback_text: self.fallback_text, blocks: self.blocks }
    }
}

#[derive(Default)]
pub struct SectionBuilder {
    text: Option<TextObject>,
}

impl SectionBuilder {
    pub fn plain(&mut self, text: impl Into<String>) -> &mut Self {
        self.text = Some(TextObject::plain(text));
        self
    }

    pub fn mrkdwn(&mut self, text: impl Into<String>) -> &mut Self {
        self.text = Some(TextObject::mrkdwn(text));
        self
    }

    fn build(self) -> TextObject {
        self.text.unwrap_or_else(|| TextObject::plain(""))
    }
}

#[derive(Default)]
pub struct ContextBuilder {
    elements: Vec<TextObject>,
}

impl ContextBuilder {
    pub fn plain(&mut self, text: impl Into<String>) -> &mut Self {
        self.elements.push(TextObject::plain(text));
        self
    }

    pub fn mrkdwn(&mut self, text: impl Into<String>) -> &mut Self {
        self.elements.push(TextObject::mrkdwn(text));
        self
    }

    fn build(self) -> Vec<TextObject> {
        self.elements
    }
}

/// Reply for a message nobody has reacted to.
///
/// `counted_at` is a unix timestamp in whole seconds; Slack renders the
/// `<!date^...>` token in the reader's own timezone.
pub fn no_reactions_message(counted_at: &str, permalink: &str) -> MessageTemplate {
    MessageBuilder::new(NO_REACTIONS_TEXT)
        .section("tally.empty.summary.v1", |section| {
            section.mrkdwn(NO_REACTIONS_TEXT);
        })
        .context("tally.empty.context.v1", |context| {
            context.mrkdwn(format!(
                "<!date^{counted_at}^Counted at {{date_short_pretty}} {{time}}|Counted at ...> | <{permalink}|View message>"
            ));
        })
        .build()
}

/// Parent message the per-reaction snippets are threaded under.
pub fn permalink_message(permalink: &str) -> MessageTemplate {
    MessageBuilder::new(REACTIONS_FALLBACK_TEXT)
        .section("tally.report.permalink.v1", |section| {
            section.mrkdwn(permalink);
        })
        .build()
}

pub fn lookup_error_message(error_code: &str) -> MessageTemplate {
    MessageBuilder::new(error_code)
        .section("tally.error.summary.v1", |section| {
            section.mrkdwn(format!("*Error*: `{error_code}`"));
        })
        .build()
}

pub fn reaction_caption(name: &str, count: u32) -> String {
    format!("*Reaction:* :{name}:\n*Count:* {count}")
}
