//! Method + path routing with literal-over-parameter specificity and reverse
//! URL generation.
//!
//! Patterns are ordered segment sequences. A segment is a literal token or a
//! `:name` parameter, and a segment containing a parameter sigil may carry a
//! format suffix after its last `.`, each side independently literal or
//! parameter:
//!
//! | Pattern              | Example match       | Captures                  |
//! |----------------------|---------------------|---------------------------|
//! | `/users`             | `/users`            | *(none)*                  |
//! | `/users/:id`         | `/users/42`         | `id → "42"`               |
//! | `/users/:id.:format` | `/users/42.json`    | `id → "42"`, `format → "json"` |
//! | `/files/:name.txt`   | `/files/notes.txt`  | `name → "notes"`          |
//!
//! Resolution prefers the candidate with the most literal segments at
//! matching positions (`/foo` beats `/:param` for path `/foo`); ties go to
//! registration order. Trailing slashes are normalized on both sides.

use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::debug;

use crate::env::Params;
use crate::http::Method;
use crate::pipeline::{App, Handler, Stage};

// One side of a segment: an exact token or a named capture.
#[derive(Debug, Clone, PartialEq)]
enum Part {
    Literal(String),
    Param(String),
}

impl Part {
    fn parse(token: &str) -> Self {
        match token.strip_prefix(':') {
            Some(name) => Part::Param(name.to_owned()),
            None => Part::Literal(token.to_owned()),
        }
    }

    fn is_literal(&self) -> bool {
        matches!(self, Part::Literal(_))
    }

    // Match one path token side, recording a capture for parameters.
    fn matches(&self, token: &str, params: &mut Params) -> bool {
        match self {
            Part::Literal(lit) => lit == token,
            Part::Param(name) => {
                params.insert(name.clone(), token);
                true
            }
        }
    }
}

// A compiled pattern segment: base part plus optional format suffix.
#[derive(Debug, Clone, PartialEq)]
struct Segment {
    base: Part,
    ext: Option<Part>,
}

impl Segment {
    // A format suffix is only recognized in segments that carry a parameter
    // sigil; plain literal segments keep their dots verbatim.
    fn parse(token: &str) -> Self {
        if token.contains(':') {
            if let Some((base, ext)) = token.rsplit_once('.') {
                if !base.is_empty() && !ext.is_empty() {
                    return Self {
                        base: Part::parse(base),
                        ext: Some(Part::parse(ext)),
                    };
                }
            }
        }
        Self {
            base: Part::parse(token),
            ext: None,
        }
    }

    fn matches(&self, token: &str, params: &mut Params) -> bool {
        match &self.ext {
            None => self.base.matches(token, params),
            Some(ext) => match token.rsplit_once('.') {
                Some((pre, post)) => {
                    self.base.matches(pre, params) && ext.matches(post, params)
                }
                None => false,
            },
        }
    }

    // Literal parts at matching positions; the specificity contribution.
    fn literal_count(&self) -> usize {
        usize::from(self.base.is_literal())
            + self.ext.as_ref().map_or(0, |e| usize::from(e.is_literal()))
    }
}

fn split_path(path: &str) -> Vec<&str> {
    let path = path.strip_suffix('/').unwrap_or(path);
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// A registered route. Immutable once stored.
struct Route {
    method: Method,
    segments: Vec<Segment>,
    handler: Handler,
    name: Option<String>,
    // Structural identity used by reverse lookup when no name matches:
    // literal parts joined by `/`, format suffixes joined by `.`.
    action: String,
}

impl Route {
    fn new(method: Method, pattern: &str, handler: Handler, name: Option<String>) -> Self {
        let segments: Vec<Segment> = split_path(pattern).into_iter().map(Segment::parse).collect();
        let action = derive_action(&segments);
        Self {
            method,
            segments,
            handler,
            name,
            action,
        }
    }

    // Returns the specificity score when this route accepts the path.
    fn matches(&self, method: &Method, path: &str) -> Option<(usize, Params)> {
        if &self.method != method {
            return None;
        }
        let tokens = split_path(path);
        if tokens.len() != self.segments.len() {
            return None;
        }
        let mut params = Params::new();
        for (segment, token) in self.segments.iter().zip(&tokens) {
            if !segment.matches(token, &mut params) {
                return None;
            }
        }
        let score = self.segments.iter().map(Segment::literal_count).sum();
        Some((score, params))
    }

    fn answers_to(&self, action: &str) -> bool {
        if self.name.as_deref() == Some(action) {
            return true;
        }
        // the implicit index route collapses to "" and answers to "index"
        self.action == action || (self.action.is_empty() && action == "index")
    }
}

fn derive_action(segments: &[Segment]) -> String {
    let mut action = String::new();
    for segment in segments {
        if let Part::Literal(lit) = &segment.base {
            if !action.is_empty() {
                action.push('/');
            }
            action.push_str(lit);
        }
        if let Some(Part::Literal(ext)) = &segment.ext {
            action.push('.');
            action.push_str(ext);
        }
    }
    action
}

/// Ordered bindings for reverse URL generation.
///
/// The `action` key (default `"index"`) selects the route; other keys fill
/// parameterized segments left to right, and anything left over becomes a
/// query string in insertion order.
///
/// # Examples
///
/// ```
/// use twig::route::Bindings;
///
/// let bindings = Bindings::new().with("action", "detail").with("id", 123);
/// assert_eq!(bindings.get("id").map(ToString::to_string), Some("123".to_owned()));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    pairs: Vec<(String, Value)>,
}

impl Bindings {
    /// Creates an empty binding set (action defaults to `"index"`).
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a binding, keeping insertion order.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.pairs.push((key.into(), value.into()));
        self
    }

    /// Returns the bound value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

// JSON strings render without quotes; everything else uses its JSON form.
fn coerce(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Registry of routes for one application; owned by the `route` stage.
#[derive(Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a route. Specificity is derived from the pattern; on
    /// resolution ties the earlier registration wins.
    pub fn add(
        &mut self,
        method: Method,
        pattern: &str,
        handler: Handler,
        name: Option<&str>,
    ) {
        debug!(%method, pattern, ?name, "registering route");
        self.routes.push(Route::new(
            method,
            pattern,
            handler,
            name.map(str::to_owned),
        ));
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns `true` when no routes are registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Resolves a request to the most specific matching route.
    ///
    /// Among routes whose method and segment shape accept the path, the one
    /// with the most literal segments wins; ties break to registration order.
    pub fn resolve(&self, method: &Method, path: &str) -> Option<(Handler, Params)> {
        let mut best: Option<(usize, Handler, Params)> = None;
        for route in &self.routes {
            if let Some((score, params)) = route.matches(method, path) {
                let better = match &best {
                    Some((best_score, _, _)) => score > *best_score,
                    None => true,
                };
                if better {
                    best = Some((score, route.handler.clone(), params));
                }
            }
        }
        best.map(|(_, handler, params)| (handler, params))
    }

    /// Generates a URL for the route selected by the bindings' `action`.
    ///
    /// Routes are matched by explicit name first, then by structural action
    /// identity; duplicate identities resolve to the first registration.
    /// Bindings not consumed by parameterized segments are appended as a
    /// query string. An unknown action produces the diagnostic path
    /// `/_<action>_(unknown_route)`.
    pub fn url_for(&self, bindings: &Bindings) -> String {
        let action = bindings
            .get("action")
            .map(coerce)
            .unwrap_or_else(|| "index".to_owned());

        let mut consumed: Vec<&str> = vec!["action"];
        let mut path = String::new();

        match self.routes.iter().find(|r| r.answers_to(&action)) {
            Some(route) => {
                for segment in &route.segments {
                    path.push('/');
                    push_part(&mut path, &segment.base, bindings, &mut consumed);
                    if let Some(ext) = &segment.ext {
                        path.push('.');
                        push_part(&mut path, ext, bindings, &mut consumed);
                    }
                }
                if path.is_empty() {
                    path.push('/');
                }
            }
            None => {
                path = format!("/_{action}_(unknown_route)");
            }
        }

        let query: Vec<String> = bindings
            .pairs
            .iter()
            .filter(|(k, _)| !consumed.contains(&k.as_str()))
            .map(|(k, v)| format!("{k}={}", coerce(v)))
            .collect();
        if !query.is_empty() {
            path.push('?');
            path.push_str(&query.join("&"));
        }
        path
    }
}

fn push_part<'a>(
    out: &mut String,
    part: &'a Part,
    bindings: &Bindings,
    consumed: &mut Vec<&'a str>,
) {
    match part {
        Part::Literal(lit) => out.push_str(lit),
        Part::Param(name) => match bindings.get(name) {
            Some(value) => {
                out.push_str(&coerce(value));
                consumed.push(name);
            }
            // unresolved parameter: keep the token as a diagnostic
            None => {
                out.push(':');
                out.push_str(name);
            }
        },
    }
}

/// Built-in `route` stage: dispatches to the table, falling through to the
/// next stage when nothing matches.
pub(crate) struct RouteStage;

impl Stage for RouteStage {
    fn wrap(&self, next: Handler, app: &App) -> Handler {
        let table: Arc<RwLock<RouteTable>> = app.route_table();

        Arc::new(move |req| {
            let resolved = table
                .read()
                .expect("route table lock poisoned")
                .resolve(req.method(), req.path());
            match resolved {
                Some((handler, params)) => {
                    req.set_params(params);
                    handler(req)
                }
                None => next(req),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Request, Response};
    use crate::pipeline::DispatchError;

    fn handler(tag: &'static str) -> Handler {
        Arc::new(move |req: &mut Request| {
            let rendered = tag.replace("{}", req.param("param").unwrap_or(""));
            Ok(Response::text(rendered))
        })
    }

    fn resolve_body(table: &RouteTable, path: &str) -> Option<String> {
        let (h, params) = table.resolve(&Method::Get, path)?;
        let mut req = Request::new(Method::Get, path);
        req.set_params(params);
        let response = h(&mut req).ok()?;
        Some(response.body_text())
    }

    fn mixed_table() -> RouteTable {
        let mut table = RouteTable::new();
        table.add(Method::Get, "/:param", handler("[{}]"), None);
        table.add(Method::Get, "/foo", handler("foo"), None);
        table.add(Method::Get, "/bar/:param", handler("bar/[{}]"), None);
        table.add(Method::Get, "/bar/foo", handler("bar/foo"), None);
        table.add(Method::Get, "/baz/:param/qux", handler("baz/[{}]/qux"), None);
        table.add(Method::Get, "/baz/123/qux", handler("baz/123/qux"), None);
        table
    }

    #[test]
    fn literal_beats_parameter() {
        let table = mixed_table();
        assert_eq!(resolve_body(&table, "/foo").unwrap(), "foo");
        assert_eq!(resolve_body(&table, "/abc").unwrap(), "[abc]");
        assert_eq!(resolve_body(&table, "/bar/foo").unwrap(), "bar/foo");
        assert_eq!(resolve_body(&table, "/bar/abc").unwrap(), "bar/[abc]");
        assert_eq!(resolve_body(&table, "/baz/abc/qux").unwrap(), "baz/[abc]/qux");
        assert_eq!(resolve_body(&table, "/baz/123/qux").unwrap(), "baz/123/qux");
    }

    #[test]
    fn literal_wins_regardless_of_registration_order() {
        let mut table = RouteTable::new();
        table.add(Method::Get, "/bar/foo", handler("bar/foo"), None);
        table.add(Method::Get, "/bar/:param", handler("bar/[{}]"), None);
        assert_eq!(resolve_body(&table, "/bar/foo").unwrap(), "bar/foo");
        assert_eq!(resolve_body(&table, "/bar/abc").unwrap(), "bar/[abc]");
    }

    #[test]
    fn ties_break_to_first_registered() {
        let mut table = RouteTable::new();
        table.add(Method::Get, "/dup", handler("first"), None);
        table.add(Method::Get, "/dup", handler("second"), None);
        assert_eq!(resolve_body(&table, "/dup").unwrap(), "first");
    }

    #[test]
    fn method_partitions_routes() {
        let mut table = RouteTable::new();
        table.add(Method::Post, "/thing", handler("posted"), None);
        assert!(table.resolve(&Method::Get, "/thing").is_none());
        assert!(table.resolve(&Method::Post, "/thing").is_some());
    }

    #[test]
    fn no_match_is_none() {
        let table = mixed_table();
        assert!(table.resolve(&Method::Get, "/nope/nope/nope/nope").is_none());
    }

    #[test]
    fn trailing_slash_normalized() {
        let mut table = RouteTable::new();
        table.add(Method::Get, "/users/", handler("users"), None);
        assert_eq!(resolve_body(&table, "/users").unwrap(), "users");
        assert_eq!(resolve_body(&table, "/users/").unwrap(), "users");
    }

    #[test]
    fn format_suffix_captures_both_sides() {
        let mut table = RouteTable::new();
        table.add(Method::Get, "/bar/:id.:format", handler(""), None);
        let (_, params) = table.resolve(&Method::Get, "/bar/42.json").unwrap();
        assert_eq!(params.get("id"), Some("42"));
        assert_eq!(params.get("format"), Some("json"));
        assert!(table.resolve(&Method::Get, "/bar/42").is_none());
    }

    #[test]
    fn literal_format_suffix_must_match() {
        let mut table = RouteTable::new();
        table.add(Method::Get, "/baz/:param.html", handler(""), None);
        assert!(table.resolve(&Method::Get, "/baz/x.html").is_some());
        assert!(table.resolve(&Method::Get, "/baz/x.json").is_none());
    }

    fn url_table() -> RouteTable {
        let noop: Handler = Arc::new(|req: &mut Request| {
            Err(DispatchError::unhandled(req))
        });
        let mut table = RouteTable::new();
        table.add(Method::Get, "/:param", noop.clone(), None);
        table.add(Method::Get, "/foo", noop.clone(), None);
        table.add(Method::Get, "/foo/:param", noop.clone(), None);
        table.add(Method::Get, "/bar/foo", noop.clone(), None);
        table.add(Method::Get, "/bar/:param", noop.clone(), None);
        table.add(Method::Get, "/baz/:param/qux", noop.clone(), None);
        table.add(Method::Get, "/baz/:param.html", noop, None);
        table
    }

    #[test]
    fn url_for_default_action_is_index() {
        let table = url_table();
        assert_eq!(table.url_for(&Bindings::new().with("param", "foo")), "/foo");
        assert_eq!(
            table.url_for(&Bindings::new().with("action", "index").with("param", "foo")),
            "/foo"
        );
    }

    #[test]
    fn url_for_appends_unconsumed_bindings() {
        let table = url_table();
        assert_eq!(
            table.url_for(&Bindings::new().with("action", "foo").with("bar", "baz")),
            "/foo?bar=baz"
        );
    }

    #[test]
    fn url_for_unknown_action_fallback() {
        let table = url_table();
        assert_eq!(
            table.url_for(&Bindings::new().with("action", "nonexisting").with("bar", "baz")),
            "/_nonexisting_(unknown_route)?bar=baz"
        );
    }

    #[test]
    fn url_for_duplicate_identity_shadows_later_routes() {
        // `/foo` and `/foo/:param` derive the same identity; only the first
        // registration is reverse-resolvable, so `param` lands in the query.
        let table = url_table();
        assert_eq!(
            table.url_for(&Bindings::new().with("action", "foo").with("param", 123)),
            "/foo?param=123"
        );
    }

    #[test]
    fn url_for_substitutes_parameters() {
        let table = url_table();
        assert_eq!(
            table.url_for(&Bindings::new().with("action", "bar/foo")),
            "/bar/foo"
        );
        assert_eq!(
            table.url_for(&Bindings::new().with("action", "bar").with("param", "baz")),
            "/bar/baz"
        );
        assert_eq!(
            table.url_for(&Bindings::new().with("action", "baz/qux").with("param", 123)),
            "/baz/123/qux"
        );
        assert_eq!(
            table.url_for(&Bindings::new().with("action", "baz.html").with("param", 123)),
            "/baz/123.html"
        );
    }

    #[test]
    fn url_for_named_routes() {
        let noop: Handler = Arc::new(|req: &mut Request| {
            Err(DispatchError::unhandled(req))
        });
        let mut table = RouteTable::new();
        table.add(Method::Get, "/:param", noop.clone(), Some("param"));
        table.add(Method::Get, "/foo", noop.clone(), Some("fooindex"));
        table.add(Method::Get, "/foo/:id", noop.clone(), Some("foodetail"));
        table.add(Method::Get, "/bar/:id", noop.clone(), Some("bardetail"));
        table.add(Method::Get, "/bar/:id.:format", noop, Some("bardetailformat"));

        assert_eq!(
            table.url_for(&Bindings::new().with("action", "param").with("param", "test")),
            "/test"
        );
        assert_eq!(table.url_for(&Bindings::new().with("action", "fooindex")), "/foo");
        assert_eq!(
            table.url_for(&Bindings::new().with("action", "foodetail").with("id", 123)),
            "/foo/123"
        );
        assert_eq!(
            table.url_for(&Bindings::new().with("action", "bardetail").with("id", 123)),
            "/bar/123"
        );
        assert_eq!(
            table.url_for(
                &Bindings::new()
                    .with("action", "bardetailformat")
                    .with("id", 123)
                    .with("format", "html")
            ),
            "/bar/123.html"
        );
    }
}
