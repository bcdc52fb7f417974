use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, LazyLock, RwLock};

use rand::Rng;
use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::context::WindowContext;
use crate::error::{SignalError, SignalResult};

pub type JsonMap = serde_json::Map<String, Value>;

static PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_]\w*(\.[A-Za-z_]\w*)*$").expect("path regex"));

/// Server-side code attached to a signal path. Handlers are synchronous:
/// blocking work belongs on a worker queue, not inside the dispatch loop.
pub trait SignalHandler: Send + Sync {
    fn call(&self, ctx: &WindowContext, kwargs: &JsonMap) -> anyhow::Result<()>;
}

impl<F> SignalHandler for F
where
    F: Fn(&WindowContext, &JsonMap) -> anyhow::Result<()> + Send + Sync,
{
    fn call(&self, ctx: &WindowContext, kwargs: &JsonMap) -> anyhow::Result<()> {
        self(ctx, kwargs)
    }
}

/// Declared parameter of a handler, in declaration order. The first parameter
/// must be `Param::Context`; this mirrors the reserved first-argument
/// convention of the signal calling contract.
#[derive(Clone)]
pub enum Param {
    Context,
    Required {
        name: String,
        coercer: Option<Coercer>,
    },
    Optional {
        name: String,
        coercer: Option<Coercer>,
    },
    /// Accept and pass through any extra keyword arguments.
    ExtraKwargs,
    /// A variadic positional parameter. Always rejected at registration.
    VarArgs(String),
}

impl Param {
    pub fn required(name: &str) -> Self {
        Self::Required {
            name: name.to_owned(),
            coercer: None,
        }
    }

    pub fn required_as(name: &str, coercer: Coercer) -> Self {
        Self::Required {
            name: name.to_owned(),
            coercer: Some(coercer),
        }
    }

    pub fn optional(name: &str) -> Self {
        Self::Optional {
            name: name.to_owned(),
            coercer: None,
        }
    }

    pub fn optional_as(name: &str, coercer: Coercer) -> Self {
        Self::Optional {
            name: name.to_owned(),
            coercer: Some(coercer),
        }
    }
}

/// Validation and coercion contract derived from a handler's parameter list.
#[derive(Clone, Debug, Default)]
pub struct ArgumentContract {
    required: BTreeSet<String>,
    optional: BTreeSet<String>,
    coercers: HashMap<String, Coercer>,
    accepts_extra: bool,
}

impl ArgumentContract {
    /// Classify every declared parameter as required, optional or
    /// extra-kwargs. Declaration order does not matter beyond the leading
    /// `context` parameter.
    pub fn resolve_signature(path: &str, params: &[Param]) -> SignalResult<Self> {
        if !matches!(params.first(), Some(Param::Context)) {
            return Err(SignalError::MissingContextParameter(path.to_owned()));
        }
        let mut contract = Self::default();
        for param in &params[1..] {
            match param {
                Param::Context => {
                    // a second context parameter is just a regular name clash
                    return Err(SignalError::MissingContextParameter(path.to_owned()));
                }
                Param::VarArgs(name) => {
                    return Err(SignalError::VariadicParameter {
                        path: path.to_owned(),
                        name: name.clone(),
                    });
                }
                Param::ExtraKwargs => contract.accepts_extra = true,
                Param::Required { name, coercer } => {
                    contract.required.insert(name.clone());
                    if let Some(coercer) = coercer {
                        contract.coercers.insert(name.clone(), coercer.clone());
                    }
                }
                Param::Optional { name, coercer } => {
                    contract.optional.insert(name.clone());
                    if let Some(coercer) = coercer {
                        contract.coercers.insert(name.clone(), coercer.clone());
                    }
                }
            }
        }
        Ok(contract)
    }

    pub fn accepts_extra(&self) -> bool {
        self.accepts_extra
    }

    pub fn required_names(&self) -> &BTreeSet<String> {
        &self.required
    }

    pub fn optional_names(&self) -> &BTreeSet<String> {
        &self.optional
    }

    /// Check the provided kwargs against the contract and apply coercers.
    /// Returns `None` when anything is invalid; the rejection is logged, not
    /// raised, so one bad invocation cannot take down sibling handlers.
    pub fn validate(&self, path: &str, kwargs: &JsonMap) -> Option<JsonMap> {
        let mut out = kwargs.clone();
        for (name, coercer) in &self.coercers {
            let Some(value) = out.get(name).cloned() else {
                continue;
            };
            match coercer.apply(&value) {
                Ok(coerced) => {
                    out.insert(name.clone(), coerced);
                }
                Err(()) => {
                    warn!("signal {path:?}: invalid value {value} for argument {name:?}");
                    return None;
                }
            }
        }
        for name in &self.required {
            if !out.contains_key(name) {
                warn!("signal {path:?}: missing required argument {name:?}");
                return None;
            }
        }
        if !self.accepts_extra {
            for name in out.keys() {
                if !self.required.contains(name) && !self.optional.contains(name) {
                    warn!("signal {path:?}: unexpected argument {name:?}");
                    return None;
                }
            }
        }
        Some(out)
    }
}

/// Coercion applied to one argument before the handler runs. A failed
/// coercion rejects the invocation instead of crashing it.
#[derive(Clone)]
pub enum Coercer {
    Int,
    Float,
    Bool,
    Str,
    /// Match the stringified value against a pattern; the first capture group
    /// (when present) replaces the value, then the chained coercer applies.
    Pattern {
        regex: Arc<Regex>,
        then: Option<Box<Coercer>>,
    },
    /// Accept only values from a fixed set, after the chained coercer.
    Choice {
        values: Vec<Value>,
        then: Option<Box<Coercer>>,
    },
    Custom(Arc<dyn Fn(&Value) -> Result<Value, ()> + Send + Sync>),
}

impl fmt::Debug for Coercer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int => write!(f, "Int"),
            Self::Float => write!(f, "Float"),
            Self::Bool => write!(f, "Bool"),
            Self::Str => write!(f, "Str"),
            Self::Pattern { regex, .. } => write!(f, "Pattern({})", regex.as_str()),
            Self::Choice { values, .. } => write!(f, "Choice({} values)", values.len()),
            Self::Custom(_) => write!(f, "Custom"),
        }
    }
}

impl Coercer {
    pub fn pattern(pattern: &str) -> SignalResult<Self> {
        Self::pattern_as(pattern, None)
    }

    pub fn pattern_as(pattern: &str, then: Option<Coercer>) -> SignalResult<Self> {
        let regex =
            Regex::new(pattern).map_err(|_| SignalError::InvalidPath(pattern.to_owned()))?;
        Ok(Self::Pattern {
            regex: Arc::new(regex),
            then: then.map(Box::new),
        })
    }

    pub fn choice(values: Vec<Value>) -> Self {
        Self::Choice { values, then: None }
    }

    pub fn choice_as(values: Vec<Value>, then: Coercer) -> Self {
        Self::Choice {
            values,
            then: Some(Box::new(then)),
        }
    }

    pub fn apply(&self, value: &Value) -> Result<Value, ()> {
        match self {
            Self::Int => match value {
                Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
                Value::String(s) => s.trim().parse::<i64>().map(Value::from).map_err(|_| ()),
                Value::Bool(b) => Ok(Value::from(*b as i64)),
                _ => Err(()),
            },
            Self::Float => match value {
                Value::Number(_) => Ok(value.clone()),
                Value::String(s) => s.trim().parse::<f64>().map_err(|_| ()).and_then(|f| {
                    serde_json::Number::from_f64(f).map(Value::Number).ok_or(())
                }),
                _ => Err(()),
            },
            Self::Bool => match value {
                Value::Bool(_) => Ok(value.clone()),
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" => Ok(Value::Bool(true)),
                    "false" | "0" => Ok(Value::Bool(false)),
                    _ => Err(()),
                },
                Value::Number(n) => Ok(Value::Bool(n.as_i64() != Some(0))),
                _ => Err(()),
            },
            Self::Str => match value {
                Value::String(_) => Ok(value.clone()),
                Value::Number(n) => Ok(Value::String(n.to_string())),
                Value::Bool(b) => Ok(Value::String(b.to_string())),
                _ => Err(()),
            },
            Self::Pattern { regex, then } => {
                let text = match value {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    _ => return Err(()),
                };
                let captures = regex.captures(&text).ok_or(())?;
                let matched = captures
                    .get(1)
                    .map(|group| group.as_str())
                    .unwrap_or(&text)
                    .to_owned();
                let matched = Value::String(matched);
                match then {
                    Some(then) => then.apply(&matched),
                    None => Ok(matched),
                }
            }
            Self::Choice { values, then } => {
                let candidate = match then {
                    Some(then) => then.apply(value)?,
                    None => value.clone(),
                };
                if values.contains(&candidate) {
                    Ok(candidate)
                } else {
                    Err(())
                }
            }
            Self::Custom(f) => f(value),
        }
    }
}

type AccessPredicate =
    Arc<dyn Fn(&SignalConnection, &WindowContext, &JsonMap) -> bool + Send + Sync>;

/// Whether an untrusted connection may invoke a handler. The predicate only
/// gates `from_client` dispatches; server-side code may always trigger its
/// own signals.
#[derive(Clone, Default)]
pub enum AccessPolicy {
    /// Only callable from server-side code. The default.
    #[default]
    ServerOnly,
    Everyone,
    Authenticated,
    Anonymous,
    Staff,
    Superuser,
    HasPerm(String),
    Custom(AccessPredicate),
}

impl AccessPolicy {
    pub fn allows(&self, conn: &SignalConnection, ctx: &WindowContext, kwargs: &JsonMap) -> bool {
        match self {
            Self::ServerOnly => false,
            Self::Everyone => true,
            Self::Authenticated => ctx.is_authenticated(),
            Self::Anonymous => ctx.is_anonymous(),
            Self::Staff => ctx.is_staff,
            Self::Superuser => ctx.is_superuser,
            Self::HasPerm(perm) => ctx.has_perm(perm),
            Self::Custom(predicate) => predicate(conn, ctx, kwargs),
        }
    }
}

/// Custom queue-affinity strategy, re-evaluated on every call.
pub trait QueueStrategy: Send + Sync {
    fn resolve(&self, conn: &SignalConnection, ctx: &WindowContext, kwargs: &JsonMap) -> String;

    /// All queues the strategy might ever return. The default only advertises
    /// the configured default queue; a strategy that does not override this
    /// partially hides its range from operational tooling, which is a known
    /// limitation rather than an error.
    fn available_queues(&self, default_queue: &str) -> BTreeSet<String> {
        BTreeSet::from([default_queue.to_owned()])
    }
}

#[derive(Clone, Default)]
pub enum QueueSelector {
    /// The configured default queue.
    #[default]
    Default,
    Static(String),
    /// Uniform pick among `size` queues named `prefix0..prefix{size-1}`.
    RandomDynamic {
        prefix: String,
        size: u32,
    },
    Custom(Arc<dyn QueueStrategy>),
}

impl QueueSelector {
    pub fn resolve(
        &self,
        conn: &SignalConnection,
        ctx: &WindowContext,
        kwargs: &JsonMap,
        default_queue: &str,
    ) -> String {
        match self {
            Self::Default => default_queue.to_owned(),
            Self::Static(name) => name.clone(),
            Self::RandomDynamic { prefix, size } => {
                let slot = rand::thread_rng().gen_range(0..(*size).max(1));
                format!("{prefix}{slot}")
            }
            Self::Custom(strategy) => strategy.resolve(conn, ctx, kwargs),
        }
    }

    pub fn available_queues(&self, default_queue: &str) -> BTreeSet<String> {
        match self {
            Self::Default => BTreeSet::from([default_queue.to_owned()]),
            Self::Static(name) => BTreeSet::from([name.clone()]),
            Self::RandomDynamic { prefix, size } => (0..(*size).max(1))
                .map(|slot| format!("{prefix}{slot}"))
                .collect(),
            Self::Custom(strategy) => strategy.available_queues(default_queue),
        }
    }
}

/// A registered signal or remote function: handler plus its access policy,
/// queue affinity and argument contract. Immutable once registered.
pub struct SignalConnection {
    path: String,
    handler: Arc<dyn SignalHandler>,
    policy: AccessPolicy,
    queue: QueueSelector,
    contract: ArgumentContract,
}

impl SignalConnection {
    pub fn new(
        path: &str,
        params: &[Param],
        handler: impl SignalHandler + 'static,
    ) -> SignalResult<Self> {
        if !PATH_RE.is_match(path) {
            return Err(SignalError::InvalidPath(path.to_owned()));
        }
        let contract = ArgumentContract::resolve_signature(path, params)?;
        Ok(Self {
            path: path.to_owned(),
            handler: Arc::new(handler),
            policy: AccessPolicy::default(),
            queue: QueueSelector::default(),
            contract,
        })
    }

    pub fn with_policy(mut self, policy: AccessPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_queue(mut self, queue: QueueSelector) -> Self {
        self.queue = queue;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn contract(&self) -> &ArgumentContract {
        &self.contract
    }

    pub fn queue_selector(&self) -> &QueueSelector {
        &self.queue
    }

    pub fn get_queue(&self, ctx: &WindowContext, kwargs: &JsonMap, default_queue: &str) -> String {
        self.queue.resolve(self, ctx, kwargs, default_queue)
    }

    pub fn allowed(&self, ctx: &WindowContext, kwargs: &JsonMap) -> bool {
        self.policy.allows(self, ctx, kwargs)
    }

    pub fn validate(&self, kwargs: &JsonMap) -> Option<JsonMap> {
        self.contract.validate(&self.path, kwargs)
    }

    pub fn invoke(&self, ctx: &WindowContext, kwargs: &JsonMap) -> anyhow::Result<()> {
        self.handler.call(ctx, kwargs)
    }
}

impl fmt::Debug for SignalConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalConnection")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Process-wide handler maps: signals fan out to every connection registered
/// under a path, remote functions are one-to-one. Populated once at startup
/// and read-only afterwards on the hot path.
#[derive(Default)]
pub struct SignalRegistry {
    signals: RwLock<HashMap<String, Vec<Arc<SignalConnection>>>>,
    functions: RwLock<HashMap<String, Arc<SignalConnection>>>,
    populated: tokio::sync::OnceCell<()>,
}

impl SignalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_signal(&self, conn: SignalConnection) -> SignalResult<()> {
        let mut signals = self.signals.write().expect("signal registry poisoned");
        signals
            .entry(conn.path.clone())
            .or_default()
            .push(Arc::new(conn));
        Ok(())
    }

    pub fn register_function(&self, conn: SignalConnection) -> SignalResult<()> {
        let mut functions = self.functions.write().expect("function registry poisoned");
        if functions.contains_key(&conn.path) {
            return Err(SignalError::DuplicatePath(conn.path.clone()));
        }
        functions.insert(conn.path.clone(), Arc::new(conn));
        Ok(())
    }

    pub fn has_signal(&self, path: &str) -> bool {
        self.signals
            .read()
            .expect("signal registry poisoned")
            .contains_key(path)
    }

    pub fn connections_for(&self, path: &str) -> Vec<Arc<SignalConnection>> {
        self.signals
            .read()
            .expect("signal registry poisoned")
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    pub fn function(&self, path: &str) -> Option<Arc<SignalConnection>> {
        self.functions
            .read()
            .expect("function registry poisoned")
            .get(path)
            .cloned()
    }

    pub fn signal_count(&self) -> usize {
        self.signals
            .read()
            .expect("signal registry poisoned")
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Union of every queue a registered connection might address. Feeds the
    /// `queues` operational surface so deployments know which workers to run.
    pub fn expected_queues(&self, default_queue: &str) -> BTreeSet<String> {
        let signals = self.signals.read().expect("signal registry poisoned");
        signals
            .values()
            .flatten()
            .flat_map(|conn| conn.queue.available_queues(default_queue))
            .collect()
    }

    /// Run the application's registration pass exactly once, even under
    /// concurrent dispatch. Registration failures abort startup.
    pub async fn ensure_populated<F>(&self, load: F) -> SignalResult<()>
    where
        F: FnOnce(&Self) -> SignalResult<()>,
    {
        self.populated
            .get_or_try_init(|| async { load(self) })
            .await?;
        Ok(())
    }
}
