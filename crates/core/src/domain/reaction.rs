use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::domain::directory::{DirectoryUser, UserId};

/// An emoji reaction on a message and the users who applied it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub name: String,
    pub count: u32,
    #[serde(default)]
    pub users: Vec<UserId>,
}

/// The directory emails behind one reaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReactionTally {
    pub name: String,
    pub count: u32,
    pub emails: Vec<String>,
}

impl ReactionTally {
    /// Matches the reaction's users against the directory.
    ///
    /// Emails come out in directory order. Users without an email, and
    /// reactors missing from the directory, are skipped.
    pub fn from_directory(reaction: &Reaction, directory: &[DirectoryUser]) -> Self {
        let reactors: HashSet<&str> = reaction.users.iter().map(UserId::as_str).collect();
        let emails = directory
            .iter()
            .filter(|user| reactors.contains(user.id.as_str()))
            .filter_map(DirectoryUser::usable_email)
            .map(str::to_owned)
            .collect();

        Self { name: reaction.name.clone(), count: reaction.count, emails }
    }

    pub fn content(&self) -> String {
        self.emails.join("\n")
    }
}
