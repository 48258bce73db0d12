use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A workspace member as returned by the directory listing.
///
/// `email` is absent for bots, guests without a profile email, and apps that
/// lack the `users:read.email` scope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryUser {
    pub id: UserId,
    pub email: Option<String>,
}

impl DirectoryUser {
    pub fn new(id: impl Into<String>, email: Option<&str>) -> Self {
        Self { id: UserId(id.into()), email: email.map(str::to_owned) }
    }

    /// The profile email as stored, unless it is missing or blank.
    pub fn usable_email(&self) -> Option<&str> {
        self.email.as_deref().filter(|email| !email.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::DirectoryUser;

    #[test]
    fn blank_email_is_not_usable() {
        assert_eq!(DirectoryUser::new("U1", Some("  ")).usable_email(), None);
        assert_eq!(DirectoryUser::new("U2", None).usable_email(), None);
        assert_eq!(
            DirectoryUser::new("U3", Some("ada@example.com")).usable_email(),
            Some("ada@example.com")
        );
    }

    #[test]
    fn usable_email_is_returned_as_stored() {
        let user = DirectoryUser::new("U4", Some(" linus@example.com"));

        assert_eq!(user.usable_email(), Some(" linus@example.com"));
    }
}
