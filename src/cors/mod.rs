//! Cross-origin request validation and response-header computation.
//!
//! The `cors` stage never blocks execution: the wrapped chain always runs and
//! its response is always returned. Validation only decides which
//! `Access-Control-*` headers the response carries — a compliant client
//! enforces the policy on its side from their presence or absence.
//!
//! A request is a *preflight* iff its method is `OPTIONS` and it carries an
//! `Access-Control-Request-Method` header; every other request (including
//! plain `OPTIONS`) is a *simple* cross-origin request.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::http::{Method, Request, Response};
use crate::pipeline::{App, Handler, Stage};

/// CORS header names used by the stage.
mod header {
    pub const ALLOW_ORIGIN: &str = "Access-Control-Allow-Origin";
    pub const ALLOW_METHODS: &str = "Access-Control-Allow-Methods";
    pub const ALLOW_HEADERS: &str = "Access-Control-Allow-Headers";
    pub const ALLOW_CREDENTIALS: &str = "Access-Control-Allow-Credentials";
    pub const EXPOSE_HEADERS: &str = "Access-Control-Expose-Headers";
    pub const MAX_AGE: &str = "Access-Control-Max-Age";
    pub const REQUEST_METHOD: &str = "Access-Control-Request-Method";
    pub const REQUEST_HEADERS: &str = "Access-Control-Request-Headers";
}

/// Cross-origin access policy for an application.
///
/// Field names deserialize in camelCase so a policy can be loaded straight
/// from a JSON or TOML config document:
///
/// ```
/// use twig::cors::CorsConfig;
///
/// let config: CorsConfig = serde_json::from_str(
///     r#"{"allowOrigin": ["http://example.com"], "exposeHeaders": ["X-FooBar"]}"#,
/// ).unwrap();
/// assert_eq!(config.allow_origin, vec!["http://example.com"]);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CorsConfig {
    /// Origins allowed to read responses. Literal values compared
    /// case-sensitively; the single entry `"*"` allows every origin.
    pub allow_origin: Vec<String>,
    /// Methods a preflight may request.
    pub allow_methods: Vec<String>,
    /// Request headers a preflight may request (compared case-insensitively).
    pub allow_headers: Vec<String>,
    /// Response headers exposed to client-side script on simple requests.
    pub expose_headers: Vec<String>,
    /// Preflight cache lifetime in seconds.
    pub max_age: Option<u64>,
    /// Whether credentialed requests are allowed.
    pub allow_credentials: bool,
}

impl CorsConfig {
    /// Origin values are matched literally and case-sensitively; `"*"` in the
    /// configured list allows any origin, but the response always echoes the
    /// literal request origin rather than `*`.
    fn origin_allowed(&self, origin: &str) -> bool {
        self.allow_origin.iter().any(|o| o == "*" || o == origin)
    }

    fn method_allowed(&self, method: &str) -> bool {
        self.allow_methods.iter().any(|m| m == method)
    }

    fn headers_allowed(&self, requested: &str) -> bool {
        requested.split(',').map(str::trim).all(|name| {
            self.allow_headers
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(name))
        })
    }
}

/// Built-in `cors` stage: runs the rest of the chain, then decorates the
/// response according to the application's [`CorsConfig`].
pub(crate) struct CorsStage;

impl Stage for CorsStage {
    fn wrap(&self, next: Handler, app: &App) -> Handler {
        let config: Arc<RwLock<CorsConfig>> = app.cors_config();

        Arc::new(move |req: &mut Request| {
            let origin = req.headers().get("origin").map(str::to_owned);
            let request_method = req.headers().get(header::REQUEST_METHOD).map(str::to_owned);
            let request_headers = req
                .headers()
                .get(header::REQUEST_HEADERS)
                .map(str::to_owned);
            let is_preflight = req.method() == &Method::Options && request_method.is_some();

            // The resource always executes; CORS only shapes the headers.
            let mut response = next(req)?;

            let config = config.read().expect("cors config lock poisoned").clone();
            let Some(origin) = origin else {
                return Ok(response);
            };
            if !config.origin_allowed(&origin) {
                debug!(%origin, "origin not in CORS allow-list");
                return Ok(response);
            }

            if is_preflight {
                let method = request_method.unwrap_or_default();
                if !config.method_allowed(&method) {
                    debug!(%method, "preflight requested method not allowed");
                    return Ok(response);
                }
                if let Some(requested) = &request_headers {
                    if !config.headers_allowed(requested) {
                        // observable policy is the configured list below; the
                        // client compares it against what it asked for
                        debug!(%requested, "preflight requested headers not all allowed");
                    }
                }

                response.headers_mut().set(header::ALLOW_ORIGIN, &origin);
                response
                    .headers_mut()
                    .set(header::ALLOW_METHODS, config.allow_methods.join(", "));
                if !config.allow_headers.is_empty() {
                    response
                        .headers_mut()
                        .set(header::ALLOW_HEADERS, config.allow_headers.join(", "));
                }
                if let Some(max_age) = config.max_age {
                    response
                        .headers_mut()
                        .set(header::MAX_AGE, max_age.to_string());
                }
            } else {
                response.headers_mut().set(header::ALLOW_ORIGIN, &origin);
                if !config.expose_headers.is_empty() {
                    response
                        .headers_mut()
                        .set(header::EXPOSE_HEADERS, config.expose_headers.join(", "));
                }
            }

            if config.allow_credentials {
                response.headers_mut().set(header::ALLOW_CREDENTIALS, "true");
            }

            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CorsConfig {
        CorsConfig {
            allow_origin: vec!["http://example.com".to_owned()],
            allow_methods: vec!["POST".to_owned()],
            allow_headers: vec!["X-FooBar".to_owned()],
            ..CorsConfig::default()
        }
    }

    #[test]
    fn origin_match_is_case_sensitive() {
        let c = config();
        assert!(c.origin_allowed("http://example.com"));
        assert!(!c.origin_allowed("http://exAmpLe.Com"));
        assert!(!c.origin_allowed("http://example2.com"));
    }

    #[test]
    fn wildcard_allows_any_origin() {
        let c = CorsConfig {
            allow_origin: vec!["*".to_owned()],
            ..CorsConfig::default()
        };
        assert!(c.origin_allowed("http://anything.invalid"));
    }

    #[test]
    fn header_match_is_case_insensitive() {
        let c = config();
        assert!(c.headers_allowed("x-foobar"));
        assert!(c.headers_allowed(" X-FOOBAR "));
        assert!(!c.headers_allowed("X-NotFooBar"));
        assert!(!c.headers_allowed("X-FooBar, X-Other"));
    }

    #[test]
    fn method_match_is_exact() {
        let c = config();
        assert!(c.method_allowed("POST"));
        assert!(!c.method_allowed("DELETE"));
        assert!(!c.method_allowed("post"));
    }

    mod stage {
        use super::*;
        use crate::pipeline::App;

        fn simple_app() -> App {
            let app = App::new();
            app.configure_named(&["cors", "route"]).unwrap();
            app.cors(CorsConfig {
                allow_origin: vec!["http://example.com".to_owned()],
                expose_headers: vec!["X-FooBar".to_owned()],
                ..CorsConfig::default()
            });
            app.get("/", |_req: &mut Request| Ok(Response::text("ok")));
            app
        }

        fn get_from(origin: Option<&str>) -> Request {
            let req = Request::new(Method::Get, "/");
            match origin {
                Some(o) => req.with_header("Origin", o),
                None => req,
            }
        }

        #[test]
        fn same_origin_request_gets_no_cors_headers() {
            let app = simple_app();
            let resp = app.handle(&mut get_from(None)).unwrap();
            assert_eq!(resp.headers().get(header::ALLOW_ORIGIN), None);
            assert_eq!(resp.body_text(), "ok");
        }

        #[test]
        fn disallowed_origin_still_runs_the_handler() {
            let app = simple_app();
            for origin in ["http://example2.com", "http://exAmpLe.Com"] {
                let resp = app.handle(&mut get_from(Some(origin))).unwrap();
                assert_eq!(resp.headers().get(header::ALLOW_ORIGIN), None, "{origin}");
                assert_eq!(resp.body_text(), "ok");
            }
        }

        #[test]
        fn allowed_origin_is_echoed_with_exposed_headers() {
            let app = simple_app();
            let resp = app.handle(&mut get_from(Some("http://example.com"))).unwrap();
            assert_eq!(
                resp.headers().get(header::ALLOW_ORIGIN),
                Some("http://example.com")
            );
            assert_eq!(resp.headers().get(header::EXPOSE_HEADERS), Some("X-FooBar"));
            assert_eq!(resp.body_text(), "ok");
        }

        #[test]
        fn wildcard_config_echoes_the_literal_origin() {
            let app = simple_app();
            app.cors(CorsConfig {
                allow_origin: vec!["*".to_owned()],
                expose_headers: vec!["X-FooBar".to_owned()],
                ..CorsConfig::default()
            });
            let resp = app.handle(&mut get_from(Some("http://example3.com"))).unwrap();
            assert_eq!(
                resp.headers().get(header::ALLOW_ORIGIN),
                Some("http://example3.com")
            );
            assert_eq!(resp.headers().get(header::EXPOSE_HEADERS), Some("X-FooBar"));
        }

        fn preflight_app() -> App {
            let app = App::new();
            app.configure_named(&["cors", "route"]).unwrap();
            app.cors(CorsConfig {
                allow_origin: vec!["http://example.com".to_owned()],
                allow_methods: vec!["POST".to_owned()],
                allow_headers: vec!["X-FooBar".to_owned()],
                max_age: Some(1728000),
                allow_credentials: true,
                ..CorsConfig::default()
            });
            app.options("/", |_req: &mut Request| Ok(Response::text("preflight okay")));
            app
        }

        fn preflight(origin: Option<&str>, method: &str, headers: Option<&str>) -> Request {
            let mut req =
                Request::new(Method::Options, "/").with_header(header::REQUEST_METHOD, method);
            if let Some(o) = origin {
                req = req.with_header("Origin", o);
            }
            if let Some(h) = headers {
                req = req.with_header(header::REQUEST_HEADERS, h);
            }
            req
        }

        #[test]
        fn preflight_without_origin_gets_no_cors_headers() {
            let app = preflight_app();
            let resp = app.handle(&mut preflight(None, "POST", None)).unwrap();
            assert_eq!(resp.headers().get(header::ALLOW_ORIGIN), None);
            assert_eq!(resp.body_text(), "preflight okay");
        }

        #[test]
        fn preflight_from_disallowed_origin_gets_no_cors_headers() {
            let app = preflight_app();
            let resp = app
                .handle(&mut preflight(Some("http://example2.com"), "POST", None))
                .unwrap();
            assert_eq!(resp.headers().get(header::ALLOW_ORIGIN), None);
            assert_eq!(resp.body_text(), "preflight okay");
        }

        #[test]
        fn preflight_for_disallowed_method_suppresses_all_cors_headers() {
            let app = preflight_app();
            let resp = app
                .handle(&mut preflight(Some("http://example.com"), "DELETE", None))
                .unwrap();
            assert_eq!(resp.headers().get(header::ALLOW_ORIGIN), None);
            assert_eq!(resp.headers().get(header::ALLOW_METHODS), None);
            assert_eq!(resp.body_text(), "preflight okay");
        }

        #[test]
        fn valid_preflight_advertises_the_policy() {
            let app = preflight_app();
            let resp = app
                .handle(&mut preflight(Some("http://example.com"), "POST", None))
                .unwrap();
            assert_eq!(
                resp.headers().get(header::ALLOW_ORIGIN),
                Some("http://example.com")
            );
            assert_eq!(resp.headers().get(header::ALLOW_METHODS), Some("POST"));
            assert_eq!(resp.headers().get(header::ALLOW_HEADERS), Some("X-FooBar"));
            assert_eq!(resp.headers().get(header::MAX_AGE), Some("1728000"));
            assert_eq!(resp.headers().get(header::ALLOW_CREDENTIALS), Some("true"));
            assert_eq!(resp.body_text(), "preflight okay");
        }

        #[test]
        fn unlisted_requested_header_still_advertises_the_configured_list() {
            let app = preflight_app();
            let resp = app
                .handle(&mut preflight(
                    Some("http://example.com"),
                    "POST",
                    Some("X-NotFooBar"),
                ))
                .unwrap();
            // the client compares the advertised list against what it asked for
            assert_eq!(
                resp.headers().get(header::ALLOW_ORIGIN),
                Some("http://example.com")
            );
            assert_eq!(resp.headers().get(header::ALLOW_HEADERS), Some("X-FooBar"));
        }
    }

    #[test]
    fn config_deserializes_camel_case() {
        let c: CorsConfig = serde_json::from_str(
            r#"{
                "allowOrigin": ["http://example.com"],
                "allowMethods": ["POST"],
                "allowHeaders": ["X-FooBar"],
                "maxAge": 1728000,
                "allowCredentials": true
            }"#,
        )
        .unwrap();
        assert_eq!(c.max_age, Some(1728000));
        assert!(c.allow_credentials);
        assert!(c.expose_headers.is_empty());
    }
}
