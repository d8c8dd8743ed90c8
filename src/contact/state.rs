use std::fmt;

/// One direction of a presence subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Subscription {
    #[default]
    No,
    /// Requested but not yet confirmed.
    Pending,
    Yes,
}

impl Subscription {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::No => "no",
            Self::Pending => "pending",
            Self::Yes => "yes",
        }
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the gateway knows about one phone address as seen by one user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Contact {
    /// Display name shown in vCards, typically from the user's address book.
    pub local_name: Option<String>,
    /// Whether we (the phone address) are subscribed to the user.
    pub sub_to: Subscription,
    /// Whether the user is subscribed to us.
    pub sub_from: Subscription,
    /// A message has already been exchanged in either direction.
    pub introduced: bool,
}

impl Contact {
    /// No subscription in either direction and no message history.
    pub fn is_stranger(&self) -> bool {
        self.sub_from == Subscription::No && !self.introduced
    }
}
