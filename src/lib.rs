//! # twig
//!
//! A composable middleware pipeline, path router, and content negotiator for
//! HTTP-style applications. The library is transport-agnostic: it dispatches
//! in-memory [`Request`] values and produces [`Response`] values, leaving
//! sockets and I/O to the embedder.
//!
//! ## Quick Start
//!
//! ```rust
//! use twig::{App, Response};
//! use twig::http::{Method, Request};
//!
//! let app = App::new();
//! app.configure_named(&["route"]).unwrap();
//! app.get("/users/:id", |req: &mut Request| {
//!     Ok(Response::text(format!("user {}", req.param("id").unwrap_or(""))))
//! });
//!
//! let mut req = Request::new(Method::Get, "/users/42");
//! let response = app.handle(&mut req).unwrap();
//! assert_eq!(response.body_text(), "user 42");
//! ```
//!
//! Applications compose: the `mount` stage delegates path/host subtrees to
//! other [`App`]s, the `accept` stage negotiates `Accept` headers against a
//! declared policy, and the `cors` stage decorates responses with
//! `Access-Control-*` headers.

pub mod accept;
pub mod cors;
pub mod env;
pub mod http;
pub mod mount;
pub mod pipeline;
pub mod route;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use pipeline::{App, ConfigError, DispatchError, Handler, Stage};
pub use route::Bindings;
