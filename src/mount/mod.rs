//! Host/path-prefix dispatch to handlers and sub-applications.
//!
//! A mount binds an optional host and a path prefix to a target. Resolution
//! picks the matching entry with the longest path prefix (aligned on segment
//! boundaries), ties going to registration order. Delegation strips the
//! matched prefix into the request's `script_prefix`, leaving the remainder —
//! `""` when fully consumed, never `"/"` — so an inner route table can match
//! its own root.
//!
//! By default a GET request whose path lands exactly on a mount without a
//! trailing slash is answered with `303 See Other` pointing at the
//! slash-terminated form; registering the mount REST-style disables the
//! redirect and dispatches directly.

use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::http::{Method, Request, Response};
use crate::pipeline::{App, DispatchError, Handler, Stage};

/// What a mount entry matches against: an optional host and a path prefix.
///
/// A bare string is a path matcher; host-based matchers are built explicitly.
///
/// # Examples
///
/// ```
/// use twig::mount::MountMatcher;
///
/// let by_path: MountMatcher = "/api".into();
/// let by_host = MountMatcher::host("api.example.com");
/// let both = MountMatcher::host("api.example.com").with_path("/v2");
/// # let _ = (by_path, by_host, both);
/// ```
#[derive(Debug, Clone)]
pub struct MountMatcher {
    host: Option<String>,
    path: String,
}

impl MountMatcher {
    /// Matches any path on the given host (case-insensitive, port ignored).
    pub fn host(host: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            path: "/".to_owned(),
        }
    }

    /// Restricts this matcher to a path prefix.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// The path prefix this matcher covers.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl From<&str> for MountMatcher {
    fn from(path: &str) -> Self {
        Self {
            host: None,
            path: path.to_owned(),
        }
    }
}

impl From<String> for MountMatcher {
    fn from(path: String) -> Self {
        Self { host: None, path }
    }
}

/// The delegate of a mount entry: a bare handler or a whole sub-application.
#[derive(Clone)]
pub enum MountTarget {
    Handler(Handler),
    App(App),
}

impl MountTarget {
    fn call(&self, req: &mut Request) -> Result<Response, DispatchError> {
        match self {
            MountTarget::Handler(handler) => handler(req),
            MountTarget::App(app) => app.handle(req),
        }
    }
}

/// Conversion into a [`MountTarget`], so `mount` accepts closures and
/// applications alike.
pub trait IntoMountTarget {
    fn into_target(self) -> MountTarget;
}

impl IntoMountTarget for MountTarget {
    fn into_target(self) -> MountTarget {
        self
    }
}

impl IntoMountTarget for App {
    fn into_target(self) -> MountTarget {
        MountTarget::App(self)
    }
}

impl<F> IntoMountTarget for F
where
    F: Fn(&mut Request) -> Result<Response, DispatchError> + Send + Sync + 'static,
{
    fn into_target(self) -> MountTarget {
        MountTarget::Handler(Arc::new(self))
    }
}

// A registered mount. Immutable once stored; the path is kept normalized
// without its trailing slash ("/" becomes "").
#[derive(Clone)]
struct MountEntry {
    host: Option<String>,
    path: String,
    target: MountTarget,
    rest_style: bool,
}

impl MountEntry {
    fn matches(&self, host: Option<&str>, path: &str) -> bool {
        if let Some(want) = &self.host {
            let Some(have) = host else {
                return false;
            };
            // host names compare case-insensitively; a port is not part of the name
            let have = have.rsplit_once(':').map_or(have, |(name, _)| name);
            if !want.eq_ignore_ascii_case(have) {
                return false;
            }
        }
        // prefix aligned on a segment boundary: /foo matches /foo and /foo/x, not /foobar
        path == self.path
            || self.path.is_empty()
            || (path.starts_with(&self.path) && path[self.path.len()..].starts_with('/'))
    }
}

/// Registry of mounts for one application; owned by the `mount` stage.
#[derive(Default)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

impl MountTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a mount entry.
    pub fn add(&mut self, matcher: MountMatcher, target: MountTarget, rest_style: bool) {
        let path = matcher.path.strip_suffix('/').unwrap_or(&matcher.path);
        debug!(host = ?matcher.host, path, rest_style, "registering mount");
        self.entries.push(MountEntry {
            host: matcher.host,
            path: path.to_owned(),
            target,
            rest_style,
        });
    }

    /// Number of registered mounts.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no mounts are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // Longest matching prefix wins; ties go to the earlier registration.
    fn resolve(&self, host: Option<&str>, path: &str) -> Option<MountEntry> {
        let mut best: Option<&MountEntry> = None;
        for entry in &self.entries {
            if entry.matches(host, path)
                && best.is_none_or(|b| entry.path.len() > b.path.len())
            {
                best = Some(entry);
            }
        }
        best.cloned()
    }
}

/// Built-in `mount` stage: delegates matched requests to their target,
/// falling through to the next stage when nothing matches.
pub(crate) struct MountStage;

impl Stage for MountStage {
    fn wrap(&self, next: Handler, app: &App) -> Handler {
        let table: Arc<RwLock<MountTable>> = app.mount_table();

        Arc::new(move |req| {
            let entry = {
                let table = table.read().expect("mount table lock poisoned");
                table.resolve(req.host(), req.path())
            };
            let Some(entry) = entry else {
                return next(req);
            };

            let remainder = req.path()[entry.path.len()..].to_owned();
            if req.method() == &Method::Get
                && !entry.rest_style
                && remainder.is_empty()
                && !req.path().ends_with('/')
            {
                // send the client back to the slash-terminated form
                let location = format!("{}{}/", req.script_prefix(), req.path());
                debug!(%location, "redirecting mount hit without trailing slash");
                return Ok(Response::see_other(location));
            }

            req.push_script_prefix(&entry.path);
            req.set_path(remainder);
            entry.target.call(req)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::StatusCode;

    fn target(tag: &'static str) -> MountTarget {
        MountTarget::Handler(Arc::new(move |_req: &mut Request| {
            Ok(Response::text(tag))
        }))
    }

    fn resolve_tag(table: &MountTable, host: Option<&str>, path: &str) -> Option<String> {
        let entry = table.resolve(host, path)?;
        let mut req = Request::new(Method::Get, path);
        Some(entry.target.call(&mut req).ok()?.body_text())
    }

    #[test]
    fn host_and_path_matchers() {
        let mut table = MountTable::new();
        table.add("/foo".into(), target("/foo"), false);
        table.add(MountMatcher::host("foo.com"), target("foo.com"), false);
        table.add(
            MountMatcher::host("bar.org").with_path("/baz"),
            target("bar.org/baz"),
            false,
        );

        assert_eq!(resolve_tag(&table, Some("bar.com"), "/foo").unwrap(), "/foo");
        assert_eq!(resolve_tag(&table, Some("foo.com"), "/foo").unwrap(), "/foo");
        assert_eq!(resolve_tag(&table, Some("foo.com"), "/").unwrap(), "foo.com");
        assert_eq!(
            resolve_tag(&table, Some("bar.org"), "/baz").unwrap(),
            "bar.org/baz"
        );
        assert!(table.resolve(Some("bing.org"), "/").is_none());
    }

    #[test]
    fn host_match_ignores_case_and_port() {
        let mut table = MountTable::new();
        table.add(MountMatcher::host("foo.com"), target("foo.com"), false);
        assert!(table.resolve(Some("FOO.COM"), "/x").is_some());
        assert!(table.resolve(Some("foo.com:8080"), "/x").is_some());
        assert!(table.resolve(Some("notfoo.com"), "/x").is_none());
        assert!(table.resolve(None, "/x").is_none());
    }

    #[test]
    fn prefix_aligns_on_segment_boundary() {
        let mut table = MountTable::new();
        table.add("/foo".into(), target("foo"), false);
        assert!(table.resolve(None, "/foo").is_some());
        assert!(table.resolve(None, "/foo/bar").is_some());
        assert!(table.resolve(None, "/foobar").is_none());
    }

    #[test]
    fn longest_prefix_wins() {
        let mut table = MountTable::new();
        table.add("/".into(), target("root"), false);
        table.add("/foo".into(), target("foo"), false);
        table.add("/foo/bar".into(), target("foo/bar"), false);

        assert_eq!(resolve_tag(&table, None, "/").unwrap(), "root");
        assert_eq!(resolve_tag(&table, None, "/foo").unwrap(), "foo");
        assert_eq!(resolve_tag(&table, None, "/foo/bar").unwrap(), "foo/bar");
        assert_eq!(resolve_tag(&table, None, "/foo/baz").unwrap(), "foo");
        assert!(table.resolve(None, "/bars").is_none());
    }

    #[test]
    fn tie_breaks_to_first_registered() {
        let mut table = MountTable::new();
        table.add("/same".into(), target("first"), false);
        table.add("/same".into(), target("second"), false);
        assert_eq!(resolve_tag(&table, None, "/same").unwrap(), "first");
    }

    #[test]
    fn redirect_target_is_verbatim_join() {
        // resolution-level check of the see_other helper the stage uses
        let r = Response::see_other("/foo/");
        assert_eq!(r.status(), StatusCode::SeeOther);
        assert_eq!(r.headers().get("Location"), Some("/foo/"));
    }
}
