//! `Accept` header parsing and content negotiation.
//!
//! The `accept` stage parses the client's `Accept` header into ranked
//! [`AcceptPreference`] values, negotiates them against the media ranges the
//! application declared via [`App::accept`](crate::App::accept), and either
//! attaches the ranked list to the request's environment bag (success), or
//! short-circuits with `400 Bad Request` (unparseable header) or
//! `406 Not Acceptable` (nothing the server offers is acceptable).
//!
//! A missing `Accept` header is treated as the single implicit preference
//! `*/*` with quality 1.

use std::cmp::Ordering;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::http::{Request, Response, StatusCode};
use crate::pipeline::{App, Handler, Stage};

/// A single client media-range preference parsed from an `Accept` header.
///
/// Parameters that appear *before* the `q` parameter (such as `level`) are
/// retained; accept-extension parameters after `q` are discarded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcceptPreference {
    /// Full media range as sent, lower-cased (e.g. `text/html` or `*/*`).
    pub media_type: String,
    /// The type half of the range (`text`, `application`, or `*`).
    pub main_type: String,
    /// The subtype half of the range (`html`, `json`, or `*`).
    pub sub_type: String,
    /// Quality weight in `[0, 1]`; defaults to 1 when no `q` parameter is given.
    pub quality: f64,
    /// Media-type parameters seen before `q`, in order (e.g. `level=1`).
    pub params: Vec<(String, String)>,
}

impl AcceptPreference {
    /// Returns `true` if this preference is compatible with the given server
    /// media range, treating `*` as matching anything on either side.
    fn matches(&self, range: &MediaRange) -> bool {
        part_matches(&self.main_type, &range.main_type)
            && part_matches(&self.sub_type, &range.sub_type)
    }
}

fn part_matches(client: &str, server: &str) -> bool {
    client == "*" || server == "*" || client == server
}

/// A server-declared acceptable media range.
#[derive(Debug, Clone)]
struct MediaRange {
    raw: String,
    main_type: String,
    sub_type: String,
}

impl MediaRange {
    /// Specificity for tie-breaking within a scan: exact sides beat wildcards.
    fn specificity(&self) -> usize {
        usize::from(self.main_type != "*") + usize::from(self.sub_type != "*")
    }
}

/// The set of media ranges an application accepts, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct AcceptPolicy {
    ranges: Vec<MediaRange>,
}

/// A malformed media range handed to [`App::accept`](crate::App::accept).
#[derive(Debug, Error)]
#[error("invalid media range {0:?}: expected type/subtype")]
pub struct InvalidMediaRange(pub String);

impl AcceptPolicy {
    /// Builds a policy from `type/subtype` strings (wildcards allowed on
    /// either side). Fails fast on a range that is not two non-empty
    /// slash-separated parts.
    pub fn new<I, S>(ranges: I) -> Result<Self, InvalidMediaRange>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed = Vec::new();
        for range in ranges {
            let raw = range.as_ref().trim().to_ascii_lowercase();
            let (main_type, sub_type) = split_media_type(&raw)
                .ok_or_else(|| InvalidMediaRange(range.as_ref().to_owned()))?;
            parsed.push(MediaRange {
                raw,
                main_type,
                sub_type,
            });
        }
        Ok(Self { ranges: parsed })
    }

    /// The declared ranges joined for the 406 body.
    fn characteristics(&self) -> String {
        self.ranges
            .iter()
            .map(|r| r.raw.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Finds the server range best satisfying `pref`, preferring exact sides
    /// over wildcards. Returns `None` when nothing is compatible.
    fn best_match(&self, pref: &AcceptPreference) -> Option<&MediaRange> {
        self.ranges
            .iter()
            .filter(|range| pref.matches(range))
            .max_by_key(|range| range.specificity())
    }
}

fn split_media_type(raw: &str) -> Option<(String, String)> {
    let mut parts = raw.splitn(2, '/');
    let main_type = parts.next()?.trim();
    let sub_type = parts.next()?.trim();
    if main_type.is_empty() || sub_type.is_empty() {
        return None;
    }
    Some((main_type.to_owned(), sub_type.to_owned()))
}

/// Why an `Accept` header failed to parse. Rendered into the 400 body.
#[derive(Debug, Error, PartialEq)]
pub enum AcceptParseError {
    #[error("malformed media range {0:?}")]
    MalformedRange(String),

    #[error("malformed quality value {0:?}")]
    MalformedQuality(String),
}

/// Parses an `Accept` header value into preferences in header order.
///
/// Each comma-separated entry must begin with a `type/subtype` token (either
/// side may be `*`); semicolon-delimited `key=value` parameters follow.
/// A parameter named `q` sets the quality; parameters before it are retained,
/// parameters after it are accept-extensions and are dropped.
///
/// # Errors
///
/// Any entry that is empty or whose first token is not two non-empty
/// slash-separated parts fails the whole header, as does a `q` value that is
/// not a number in `[0, 1]`.
pub fn parse_accept(header: &str) -> Result<Vec<AcceptPreference>, AcceptParseError> {
    let mut prefs = Vec::new();

    for entry in header.split(',') {
        let entry = entry.trim();
        let mut tokens = entry.split(';').map(str::trim);

        let range = tokens.next().unwrap_or("").to_ascii_lowercase();
        let (main_type, sub_type) = split_media_type(&range)
            .ok_or_else(|| AcceptParseError::MalformedRange(entry.to_owned()))?;

        let mut quality = 1.0;
        let mut params = Vec::new();
        for token in tokens {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            if key == "q" {
                quality = value
                    .parse::<f64>()
                    .ok()
                    .filter(|q| (0.0..=1.0).contains(q))
                    .ok_or_else(|| AcceptParseError::MalformedQuality(value.to_owned()))?;
                // everything after q is an accept-extension
                break;
            }
            params.push((key.to_owned(), value.to_owned()));
        }

        prefs.push(AcceptPreference {
            media_type: format!("{main_type}/{sub_type}"),
            main_type,
            sub_type,
            quality,
            params,
        });
    }

    Ok(prefs)
}

/// Stable-sorts preferences by descending quality, keeping header order among
/// equal qualities.
pub fn rank(mut prefs: Vec<AcceptPreference>) -> Vec<AcceptPreference> {
    prefs.sort_by(|a, b| {
        b.quality
            .partial_cmp(&a.quality)
            .unwrap_or(Ordering::Equal)
    });
    prefs
}

fn implicit_any() -> Vec<AcceptPreference> {
    vec![AcceptPreference {
        media_type: "*/*".to_owned(),
        main_type: "*".to_owned(),
        sub_type: "*".to_owned(),
        quality: 1.0,
        params: Vec::new(),
    }]
}

/// Built-in `accept` stage: negotiates the request against the application's
/// accept policy before the rest of the chain runs.
pub(crate) struct AcceptStage;

impl Stage for AcceptStage {
    fn wrap(&self, next: Handler, app: &App) -> Handler {
        let policy: Arc<RwLock<Option<AcceptPolicy>>> = app.accept_policy();

        Arc::new(move |req: &mut Request| {
            let Some(policy) = policy.read().expect("accept policy lock poisoned").clone()
            else {
                // no policy declared — negotiation is a no-op
                return next(req);
            };

            let prefs = match req.headers().get("accept") {
                Some(header) => match parse_accept(header) {
                    Ok(prefs) => rank(prefs),
                    Err(err) => {
                        debug!(%err, "rejecting unparseable Accept header");
                        return Ok(Response::new(StatusCode::BadRequest)
                            .header("Content-Type", "text/plain; charset=utf-8")
                            .body(format!("Bad Request. {err}")));
                    }
                },
                None => implicit_any(),
            };

            let matched = prefs.iter().find_map(|pref| {
                policy.best_match(pref).map(|range| (pref, range))
            });

            match matched {
                Some((pref, range)) => {
                    debug!(client = %pref.media_type, server = %range.raw, "accept negotiation succeeded");
                    req.env_mut().insert(prefs);
                    next(req)
                }
                None => Ok(Response::new(StatusCode::NotAcceptable)
                    .header("Content-Type", "text/plain; charset=utf-8")
                    .body(format!(
                        "Not Acceptable. Available entity content characteristics: {}",
                        policy.characteristics()
                    ))),
            }
        })
    }
}
