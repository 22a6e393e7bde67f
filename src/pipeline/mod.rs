//! Application pipeline — ordered middleware stages composed around a base
//! handler.
//!
//! An [`App`] holds a base handler, a stage list, and the route/mount/CORS/
//! accept state the built-in stages read. Dispatching folds the stages
//! right-to-left around the base handler — the first-configured stage becomes
//! the outermost wrapper, so `configure(A)` then `configure(B)` yields
//! `A(B(base))` — and memoizes the result: the first dispatch freezes the
//! stage list, and any later [`App::configure`] fails fast with
//! [`ConfigError::Frozen`].
//!
//! [`App::env`] derives named overlay pipelines ("development",
//! "production") that share the parent's tables and policies and wrap their
//! own extra stages around the parent's composed chain; invoking the parent
//! never runs an overlay's stages.
//!
//! ## Core types
//!
//! - [`Handler`] — type-erased, cheaply-cloneable request handler.
//! - [`Stage`] — the single-method middleware capability: `wrap(next) → handler`.
//! - [`StageRegistry`] — name → stage table behind [`App::configure_named`].
//! - [`DispatchError`] — the caller-visible "unhandled request" condition.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::accept::{AcceptPolicy, AcceptStage, InvalidMediaRange};
use crate::cors::{CorsConfig, CorsStage};
use crate::http::{Method, Request, Response};
use crate::mount::{IntoMountTarget, MountMatcher, MountStage, MountTable, MountTarget};
use crate::route::{Bindings, RouteStage, RouteTable};

/// Type-erased, reference-counted request handler.
///
/// Handlers are stored behind `Arc<dyn Fn(…)>` so stages can clone and wrap
/// them without copying the underlying closure.
pub type Handler =
    Arc<dyn Fn(&mut Request) -> Result<Response, DispatchError> + Send + Sync + 'static>;

/// Conversion trait for handler functions, so registration methods accept
/// plain closures.
pub trait IntoHandler: Send + Sync + 'static {
    /// Invokes the handler.
    fn call(&self, req: &mut Request) -> Result<Response, DispatchError>;
}

impl<F> IntoHandler for F
where
    F: Fn(&mut Request) -> Result<Response, DispatchError> + Send + Sync + 'static,
{
    fn call(&self, req: &mut Request) -> Result<Response, DispatchError> {
        (self)(req)
    }
}

fn into_handler(handler: impl IntoHandler) -> Handler {
    Arc::new(move |req| handler.call(req))
}

/// A request the pipeline could not dispatch.
///
/// Deliberately not a response: the embedding transport decides whether an
/// unhandled request becomes a 404, a different status, or a crash report.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unhandled request: {method} {path}")]
    Unhandled { method: String, path: String },
}

impl DispatchError {
    /// The unhandled-request condition for `req`, naming the full original
    /// path (consumed mount prefix included).
    pub fn unhandled(req: &Request) -> Self {
        DispatchError::Unhandled {
            method: req.method().to_string(),
            path: format!("{}{}", req.script_prefix(), req.path()),
        }
    }
}

/// Configuration misuse. Surfaced at configuration time, never at request
/// time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown middleware stage {0:?}")]
    UnknownStage(String),

    #[error("application already dispatched; stage list is frozen")]
    Frozen,

    #[error(transparent)]
    InvalidMediaRange(#[from] InvalidMediaRange),
}

/// The middleware capability: turn the next handler into a new handler.
///
/// Stages are registered once at configuration time and never mutated after
/// the pipeline composes. `wrap` receives the owning [`App`] so built-in
/// stages can pick up the tables and policies they operate on.
pub trait Stage: Send + Sync {
    /// Wraps `next`, returning the handler that will stand in its place.
    fn wrap(&self, next: Handler, app: &App) -> Handler;
}

/// Adapts a closure `Fn(next, app) -> handler` into a [`Stage`].
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use twig::http::Response;
/// use twig::pipeline::{from_fn, Handler};
///
/// let exclaim = from_fn(|next: Handler, _app| -> Handler {
///     Arc::new(move |req| {
///         let resp = next(req)?;
///         Ok(Response::text(format!("{}!", resp.body_text())))
///     })
/// });
/// # let _ = exclaim;
/// ```
pub fn from_fn<F>(f: F) -> FnStage<F>
where
    F: Fn(Handler, &App) -> Handler + Send + Sync + 'static,
{
    FnStage(f)
}

/// A [`Stage`] built from a closure. See [`from_fn`].
pub struct FnStage<F>(F);

impl<F> Stage for FnStage<F>
where
    F: Fn(Handler, &App) -> Handler + Send + Sync + 'static,
{
    fn wrap(&self, next: Handler, app: &App) -> Handler {
        (self.0)(next, app)
    }
}

// Built-in stage that records method, path, status and elapsed time per
// request, after the downstream chain completes.
struct LogStage;

impl Stage for LogStage {
    fn wrap(&self, next: Handler, _app: &App) -> Handler {
        Arc::new(move |req| {
            let start = Instant::now();
            let method = req.method().to_string();
            let path = format!("{}{}", req.script_prefix(), req.path());

            let result = next(req);

            match &result {
                Ok(response) => info!(
                    "{} {} - {} ({:?})",
                    method,
                    path,
                    response.status().as_u16(),
                    start.elapsed()
                ),
                Err(err) => warn!("{} {} - {} ({:?})", method, path, err, start.elapsed()),
            }
            result
        })
    }
}

/// Name → stage lookup used by [`App::configure_named`].
///
/// Seeded with the built-ins (`"route"`, `"mount"`, `"cors"`, `"accept"`,
/// `"log"`); embedders may register their own stages under new names.
pub struct StageRegistry {
    stages: RwLock<HashMap<String, Arc<dyn Stage>>>,
}

impl StageRegistry {
    fn with_builtins() -> Self {
        let mut stages: HashMap<String, Arc<dyn Stage>> = HashMap::new();
        stages.insert("route".to_owned(), Arc::new(RouteStage));
        stages.insert("mount".to_owned(), Arc::new(MountStage));
        stages.insert("cors".to_owned(), Arc::new(CorsStage));
        stages.insert("accept".to_owned(), Arc::new(AcceptStage));
        stages.insert("log".to_owned(), Arc::new(LogStage));
        Self {
            stages: RwLock::new(stages),
        }
    }

    fn register(&self, name: impl Into<String>, stage: Arc<dyn Stage>) {
        self.stages
            .write()
            .expect("stage registry lock poisoned")
            .insert(name.into(), stage);
    }

    fn resolve(&self, name: &str) -> Result<Arc<dyn Stage>, ConfigError> {
        self.stages
            .read()
            .expect("stage registry lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownStage(name.to_owned()))
    }
}

struct AppInner {
    base: Handler,
    stages: RwLock<Vec<Arc<dyn Stage>>>,
    // Composed handler; initialization freezes the stage list.
    composed: OnceLock<Handler>,
    // Set on overlays: composition wraps the parent's composed chain.
    parent: Option<Arc<AppInner>>,
    overlays: RwLock<HashMap<String, App>>,
    registry: Arc<StageRegistry>,
    routes: Arc<RwLock<RouteTable>>,
    mounts: Arc<RwLock<MountTable>>,
    cors: Arc<RwLock<CorsConfig>>,
    accept: Arc<RwLock<Option<AcceptPolicy>>>,
    // Prefix recorded when this app is mounted into an outer one; read by url_for.
    mount_prefix: Arc<RwLock<Option<String>>>,
}

/// An application pipeline: the composition root.
///
/// `App` is a cheap cloneable handle; clones share all state. Typical setup
/// configures stages and registers routes/mounts/policies, then dispatches:
///
/// ```
/// use twig::{App, Response};
/// use twig::http::{Method, Request};
///
/// let app = App::new();
/// app.configure_named(&["route"]).unwrap();
/// app.get("/hello/:name", |req: &mut Request| {
///     Ok(Response::text(format!("hi {}", req.param("name").unwrap_or(""))))
/// });
///
/// let mut req = Request::new(Method::Get, "/hello/world");
/// let response = app.handle(&mut req).unwrap();
/// assert_eq!(response.body_text(), "hi world");
/// ```
#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    /// Creates an application whose base handler fails every request with
    /// [`DispatchError::Unhandled`]; stages are expected to dispatch before
    /// the base is reached.
    pub fn new() -> Self {
        fn unhandled(req: &mut Request) -> Result<Response, DispatchError> {
            Err(DispatchError::unhandled(req))
        }
        Self::with_base(unhandled)
    }

    /// Creates an application around an explicit base handler.
    pub fn with_base(base: impl IntoHandler) -> Self {
        Self {
            inner: Arc::new(AppInner {
                base: into_handler(base),
                stages: RwLock::new(Vec::new()),
                composed: OnceLock::new(),
                parent: None,
                overlays: RwLock::new(HashMap::new()),
                registry: Arc::new(StageRegistry::with_builtins()),
                routes: Arc::new(RwLock::new(RouteTable::new())),
                mounts: Arc::new(RwLock::new(MountTable::new())),
                cors: Arc::new(RwLock::new(CorsConfig::default())),
                accept: Arc::new(RwLock::new(None)),
                mount_prefix: Arc::new(RwLock::new(None)),
            }),
        }
    }

    /// Appends a middleware stage.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Frozen`] once the application (or an overlay derived
    /// from it) has dispatched a request.
    pub fn configure(&self, stage: impl Stage + 'static) -> Result<(), ConfigError> {
        self.configure_stage(Arc::new(stage))
    }

    /// Appends stages resolved by name from the [`StageRegistry`].
    ///
    /// All names are validated before any stage is appended.
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnknownStage`] for an unregistered name,
    /// [`ConfigError::Frozen`] after the first dispatch.
    pub fn configure_named(&self, names: &[&str]) -> Result<(), ConfigError> {
        let resolved = names
            .iter()
            .map(|name| self.inner.registry.resolve(name))
            .collect::<Result<Vec<_>, _>>()?;
        for stage in resolved {
            self.configure_stage(stage)?;
        }
        Ok(())
    }

    fn configure_stage(&self, stage: Arc<dyn Stage>) -> Result<(), ConfigError> {
        if self.inner.composed.get().is_some() {
            return Err(ConfigError::Frozen);
        }
        self.inner
            .stages
            .write()
            .expect("stage list lock poisoned")
            .push(stage);
        Ok(())
    }

    /// Registers a custom stage under `name` for [`App::configure_named`].
    pub fn register_stage(&self, name: impl Into<String>, stage: impl Stage + 'static) {
        self.inner.registry.register(name, Arc::new(stage));
    }

    /// Dispatches a request through the composed pipeline.
    ///
    /// The first call composes and memoizes the handler chain, freezing the
    /// stage list.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Unhandled`] when no stage produced a response.
    pub fn handle(&self, req: &mut Request) -> Result<Response, DispatchError> {
        (self.composed())(req)
    }

    // Fold stages right-to-left so the first-configured stage is outermost.
    // Overlays treat the parent's composed chain as their base.
    fn composed(&self) -> Handler {
        self.inner
            .composed
            .get_or_init(|| {
                let base = match &self.inner.parent {
                    Some(parent) => App {
                        inner: Arc::clone(parent),
                    }
                    .composed(),
                    None => self.inner.base.clone(),
                };
                let stages = self
                    .inner
                    .stages
                    .read()
                    .expect("stage list lock poisoned")
                    .clone();
                debug!(stages = stages.len(), "composing pipeline");
                stages
                    .iter()
                    .rev()
                    .fold(base, |next, stage| stage.wrap(next, self))
            })
            .clone()
    }

    /// Returns (creating if absent) the named overlay pipeline.
    ///
    /// The overlay shares this application's tables and policies and appends
    /// its own stages around the composed parent chain: an overlay stage
    /// observes and may transform everything the parent pipeline produces.
    /// Invoking the parent never runs overlay stages.
    pub fn env(&self, name: &str) -> App {
        let mut overlays = self
            .inner
            .overlays
            .write()
            .expect("overlay map lock poisoned");
        overlays
            .entry(name.to_owned())
            .or_insert_with(|| App {
                inner: Arc::new(AppInner {
                    base: self.inner.base.clone(),
                    stages: RwLock::new(Vec::new()),
                    composed: OnceLock::new(),
                    parent: Some(Arc::clone(&self.inner)),
                    overlays: RwLock::new(HashMap::new()),
                    registry: Arc::clone(&self.inner.registry),
                    routes: Arc::clone(&self.inner.routes),
                    mounts: Arc::clone(&self.inner.mounts),
                    cors: Arc::clone(&self.inner.cors),
                    accept: Arc::clone(&self.inner.accept),
                    mount_prefix: Arc::clone(&self.inner.mount_prefix),
                }),
            })
            .clone()
    }

    // ── route registration façade ─────────────────────────────────────────

    /// Registers a route with an optional reverse-lookup name.
    pub fn route(
        &self,
        method: Method,
        pattern: &str,
        name: Option<&str>,
        handler: impl IntoHandler,
    ) {
        self.inner
            .routes
            .write()
            .expect("route table lock poisoned")
            .add(method, pattern, into_handler(handler), name);
    }

    /// Registers a `GET` route.
    pub fn get(&self, pattern: &str, handler: impl IntoHandler) {
        self.route(Method::Get, pattern, None, handler);
    }

    /// Registers a `POST` route.
    pub fn post(&self, pattern: &str, handler: impl IntoHandler) {
        self.route(Method::Post, pattern, None, handler);
    }

    /// Registers a `PUT` route.
    pub fn put(&self, pattern: &str, handler: impl IntoHandler) {
        self.route(Method::Put, pattern, None, handler);
    }

    /// Registers a `DELETE` route.
    pub fn delete(&self, pattern: &str, handler: impl IntoHandler) {
        self.route(Method::Delete, pattern, None, handler);
    }

    /// Registers an `OPTIONS` route.
    pub fn options(&self, pattern: &str, handler: impl IntoHandler) {
        self.route(Method::Options, pattern, None, handler);
    }

    /// Generates a URL for the route selected by `bindings` (see
    /// [`RouteTable::url_for`]), prefixed with this application's mount path
    /// when it has been mounted into an outer pipeline.
    pub fn url_for(&self, bindings: &Bindings) -> String {
        let path = self
            .inner
            .routes
            .read()
            .expect("route table lock poisoned")
            .url_for(bindings);
        match self.mount_prefix() {
            Some(prefix) => format!("{prefix}{path}"),
            None => path,
        }
    }

    // ── mount registration façade ─────────────────────────────────────────

    /// Mounts a target under a host/path matcher with the default
    /// trailing-slash redirect behavior.
    pub fn mount(&self, matcher: impl Into<MountMatcher>, target: impl IntoMountTarget) {
        self.mount_with(matcher.into(), target.into_target(), false);
    }

    /// Mounts a target REST-style: no trailing-slash redirect, direct
    /// dispatch.
    pub fn mount_rest(&self, matcher: impl Into<MountMatcher>, target: impl IntoMountTarget) {
        self.mount_with(matcher.into(), target.into_target(), true);
    }

    fn mount_with(&self, matcher: MountMatcher, target: MountTarget, rest_style: bool) {
        if let MountTarget::App(sub) = &target {
            // record the prefix so the sub-app's url_for points at its mounted home
            let prefix = format!(
                "{}{}",
                self.mount_prefix().unwrap_or_default(),
                matcher.path().trim_end_matches('/')
            );
            sub.set_mount_prefix(prefix);
        }
        self.inner
            .mounts
            .write()
            .expect("mount table lock poisoned")
            .add(matcher, target, rest_style);
    }

    // ── policy configuration ──────────────────────────────────────────────

    /// Replaces the cross-origin policy.
    pub fn cors(&self, config: CorsConfig) {
        *self.inner.cors.write().expect("cors config lock poisoned") = config;
    }

    /// Replaces the set of media ranges this application accepts.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidMediaRange`] when a range is not
    /// `type/subtype`.
    pub fn accept<I, S>(&self, ranges: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let policy = AcceptPolicy::new(ranges)?;
        *self
            .inner
            .accept
            .write()
            .expect("accept policy lock poisoned") = Some(policy);
        Ok(())
    }

    // ── shared-state accessors for the built-in stages ────────────────────

    pub(crate) fn route_table(&self) -> Arc<RwLock<RouteTable>> {
        Arc::clone(&self.inner.routes)
    }

    pub(crate) fn mount_table(&self) -> Arc<RwLock<MountTable>> {
        Arc::clone(&self.inner.mounts)
    }

    pub(crate) fn cors_config(&self) -> Arc<RwLock<CorsConfig>> {
        Arc::clone(&self.inner.cors)
    }

    pub(crate) fn accept_policy(&self) -> Arc<RwLock<Option<AcceptPolicy>>> {
        Arc::clone(&self.inner.accept)
    }

    fn mount_prefix(&self) -> Option<String> {
        self.inner
            .mount_prefix
            .read()
            .expect("mount prefix lock poisoned")
            .clone()
    }

    fn set_mount_prefix(&self, prefix: String) {
        *self
            .inner
            .mount_prefix
            .write()
            .expect("mount prefix lock poisoned") = Some(prefix);
    }
}
