use std::fmt;

/// Keys of derived query results that dependent views read from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum QueryKey {
    SessionDetail(String),
    SessionList,
    UnreadCount,
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryKey::SessionDetail(chat_id) => return write!(f, "ai-session:{chat_id}"),
            QueryKey::SessionList => return write!(f, "ai-sessions"),
            QueryKey::UnreadCount => return write!(f, "ai-sessions:unread-count"),
        }
    }
}

pub trait QueryCache {
    /// Drops the cached value for `key` so the next read refetches.
    fn invalidate(&self, key: &QueryKey);
}
