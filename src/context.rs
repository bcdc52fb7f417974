use std::collections::BTreeSet;
use std::collections::HashMap;

use serde_json::{json, Value};

pub type ContextMap = serde_json::Map<String, Value>;

/// Identity and per-connection state threaded through every handler call.
///
/// A context is built once per connection or per job, either from a live
/// websocket connection or by deserializing the mapping carried inside a
/// background job. It must never be mutated after it has been handed to a
/// dispatch call: the same instance may back several signals from one
/// connection, and cached fields (the permission set in particular) must not
/// leak between unrelated requests. Build a fresh one instead.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowContext {
    pub window_key: Option<String>,
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub is_superuser: bool,
    pub is_staff: bool,
    pub is_active: bool,
    pub perms: Option<BTreeSet<String>>,
    pub user_agent: String,
    pub language_code: Option<String>,
}

impl WindowContext {
    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }

    pub fn is_anonymous(&self) -> bool {
        self.user_id.is_none()
    }

    pub fn has_perm(&self, perm: &str) -> bool {
        if self.is_superuser {
            return true;
        }
        self.perms
            .as_ref()
            .is_some_and(|perms| perms.contains(perm))
    }
}

/// Identity attached to a live connection by whatever authenticated it.
/// Authentication itself lives outside this crate.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
    pub is_superuser: bool,
    pub is_staff: bool,
    pub is_active: bool,
    pub perms: BTreeSet<String>,
}

/// What the gateway knows about a freshly accepted connection.
#[derive(Debug, Clone, Default)]
pub struct LiveConnection {
    pub window_key: String,
    /// Header names lowercased.
    pub headers: HashMap<String, String>,
    pub identity: Option<Identity>,
    pub language_code: Option<String>,
}

/// One facet of the context: how to populate it from a live connection, from
/// a serialized mapping, and back. Facets run in pipeline order; each owns a
/// disjoint set of `WindowContext` fields.
pub trait ContextFacet: Send + Sync {
    fn from_live(&self, live: &LiveConnection, ctx: &mut WindowContext);
    fn to_map(&self, ctx: &WindowContext, out: &mut ContextMap);
    fn from_map(&self, values: &ContextMap, ctx: &mut WindowContext);
    /// Runs once before a background job dispatches its handlers.
    fn before_process(&self, _ctx: &mut WindowContext) {}
}

pub struct ContextPipeline {
    facets: Vec<Box<dyn ContextFacet>>,
}

impl Default for ContextPipeline {
    fn default() -> Self {
        Self {
            facets: vec![
                Box::new(WindowKeyFacet),
                Box::new(AuthFacet),
                Box::new(LocaleFacet),
            ],
        }
    }
}

impl ContextPipeline {
    pub fn with_facets(facets: Vec<Box<dyn ContextFacet>>) -> Self {
        Self { facets }
    }

    pub fn blank(&self) -> WindowContext {
        WindowContext::default()
    }

    pub fn from_live(&self, live: &LiveConnection) -> WindowContext {
        let mut ctx = WindowContext::default();
        for facet in &self.facets {
            facet.from_live(live, &mut ctx);
        }
        ctx
    }

    pub fn to_map(&self, ctx: &WindowContext) -> ContextMap {
        let mut out = ContextMap::new();
        for facet in &self.facets {
            facet.to_map(ctx, &mut out);
        }
        out
    }

    pub fn from_map(&self, values: &ContextMap) -> WindowContext {
        let mut ctx = WindowContext::default();
        for facet in &self.facets {
            facet.from_map(values, &mut ctx);
        }
        ctx
    }

    pub fn before_process(&self, ctx: &mut WindowContext) {
        for facet in &self.facets {
            facet.before_process(ctx);
        }
    }
}

struct WindowKeyFacet;

impl ContextFacet for WindowKeyFacet {
    fn from_live(&self, live: &LiveConnection, ctx: &mut WindowContext) {
        if !live.window_key.is_empty() {
            ctx.window_key = Some(live.window_key.clone());
        }
    }

    fn to_map(&self, ctx: &WindowContext, out: &mut ContextMap) {
        out.insert("window_key".to_owned(), json!(ctx.window_key));
    }

    fn from_map(&self, values: &ContextMap, ctx: &mut WindowContext) {
        ctx.window_key = read_string(values, "window_key");
    }
}

struct AuthFacet;

impl ContextFacet for AuthFacet {
    fn from_live(&self, live: &LiveConnection, ctx: &mut WindowContext) {
        ctx.user_agent = live
            .headers
            .get("user-agent")
            .cloned()
            .unwrap_or_default();
        if let Some(identity) = &live.identity {
            ctx.user_id = Some(identity.user_id.clone());
            ctx.username = Some(identity.username.clone());
            ctx.is_superuser = identity.is_superuser;
            ctx.is_staff = identity.is_staff;
            ctx.is_active = identity.is_active;
            ctx.perms = Some(identity.perms.clone());
        }
    }

    fn to_map(&self, ctx: &WindowContext, out: &mut ContextMap) {
        out.insert("user_id".to_owned(), json!(ctx.user_id));
        out.insert("username".to_owned(), json!(ctx.username));
        out.insert("is_superuser".to_owned(), json!(ctx.is_superuser));
        out.insert("is_staff".to_owned(), json!(ctx.is_staff));
        out.insert("is_active".to_owned(), json!(ctx.is_active));
        out.insert(
            "perms".to_owned(),
            match &ctx.perms {
                Some(perms) => json!(perms.iter().collect::<Vec<_>>()),
                None => Value::Null,
            },
        );
        out.insert("user_agent".to_owned(), json!(ctx.user_agent));
    }

    fn from_map(&self, values: &ContextMap, ctx: &mut WindowContext) {
        ctx.user_id = read_string(values, "user_id");
        ctx.username = read_string(values, "username");
        ctx.is_superuser = read_bool(values, "is_superuser");
        ctx.is_staff = read_bool(values, "is_staff");
        ctx.is_active = read_bool(values, "is_active");
        ctx.perms = values.get("perms").and_then(Value::as_array).map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        });
        ctx.user_agent = read_string(values, "user_agent").unwrap_or_default();
    }
}

struct LocaleFacet;

impl ContextFacet for LocaleFacet {
    fn from_live(&self, live: &LiveConnection, ctx: &mut WindowContext) {
        ctx.language_code = live.language_code.clone().or_else(|| {
            live.headers
                .get("accept-language")
                .and_then(|value| value.split(&[',', ';'][..]).next())
                .map(|tag| tag.trim().to_owned())
                .filter(|tag| !tag.is_empty())
        });
    }

    fn to_map(&self, ctx: &WindowContext, out: &mut ContextMap) {
        out.insert("language_code".to_owned(), json!(ctx.language_code));
    }

    fn from_map(&self, values: &ContextMap, ctx: &mut WindowContext) {
        ctx.language_code = read_string(values, "language_code");
    }
}

fn read_string(values: &ContextMap, key: &str) -> Option<String> {
    values.get(key).and_then(Value::as_str).map(str::to_owned)
}

fn read_bool(values: &ContextMap, key: &str) -> bool {
    values.get(key).and_then(Value::as_bool).unwrap_or(false)
}
