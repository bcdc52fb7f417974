use sha2::{Digest, Sha224, Sha256};

use crate::context::WindowContext;

pub const BROADCAST_TOPIC: &str = "-broadcast";

/// Logical target of a signal. `Server` and `Sync` are routing flags rather
/// than topics and never resolve to a subscription key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Server,
    /// Like `Server`, but the handlers run in-process before `trigger`
    /// returns instead of going through the worker backend.
    Sync,
    Window,
    User,
    Broadcast,
    Session(String),
    /// A typed application entity with a stable identity.
    Entity { kind: String, id: String },
    /// Ad hoc string label. Hashed, so not meaningful across processes that
    /// do not share the exact label; best effort by design.
    Label(String),
}

impl Destination {
    pub fn entity(kind: &str, id: &str) -> Self {
        Self::Entity {
            kind: kind.to_owned(),
            id: id.to_owned(),
        }
    }

    pub fn is_server_side(&self) -> bool {
        matches!(self, Self::Server | Self::Sync)
    }
}

/// Map a destination plus a context to a stable topic string, or `None` when
/// the destination cannot be resolved (no window key, unauthenticated user).
/// An unresolved destination is silently dropped by the dispatch engine.
pub fn resolve(ctx: Option<&WindowContext>, dest: &Destination) -> Option<String> {
    match dest {
        Destination::Server | Destination::Sync => None,
        Destination::Broadcast => Some(BROADCAST_TOPIC.to_owned()),
        Destination::Window => {
            let key = ctx?.window_key.as_deref()?;
            Some(format!("-window.{key}"))
        }
        Destination::User => {
            let user_id = ctx?.user_id.as_deref()?;
            Some(format!("-user.{user_id}"))
        }
        Destination::Session(key) => Some(format!("-session.{key}")),
        Destination::Entity { kind, id } => Some(format!("-{kind}.{id}")),
        Destination::Label(label) => {
            let digest = Sha224::digest(label.as_bytes());
            Some(format!("-str.{digest:x}"))
        }
    }
}

/// Content-addressed form of a topic string, used as the actual subscription
/// and publish key so topic structure never reaches the transport layer.
pub fn topic_key(topic: &str) -> String {
    let digest = Sha256::digest(topic.as_bytes());
    format!("{digest:x}")
}

/// Resolve and hash in one step.
pub fn resolve_key(ctx: Option<&WindowContext>, dest: &Destination) -> Option<String> {
    resolve(ctx, dest).map(|topic| topic_key(&topic))
}
