//! User-facing location parsing
//!
//! Accepted forms:
//! - `scheme://[endpoint:]user/repo/[branch]/[path]` for stores
//! - `file:///abs/path`
//! - a bare path, made absolute against the working directory

use std::path::Path;

use crate::error::{Error, Result};

/// A parsed location, before it is bound to a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// Absolute local path. A trailing `/` given by the user is kept.
    Local { path: String },
    /// Store path `user/repo/[branch]/[path]`. A trailing `/` is kept.
    Store {
        scheme: String,
        endpoint: Option<String>,
        path: String,
    },
}

impl Location {
    pub fn parse(url: &str, cwd: &Path) -> Result<Self> {
        if url.is_empty() {
            return Err(Error::validation("empty location"));
        }
        let Some((scheme, rest)) = url.split_once("://") else {
            return Ok(Location::Local {
                path: absolutize(url, cwd),
            });
        };

        match scheme {
            "file" => Ok(Location::Local {
                path: absolutize(rest, cwd),
            }),
            "" => Err(Error::validation(format!("missing scheme in {}", url))),
            _ => {
                let rest = rest.trim_start_matches('/');
                let (endpoint, path) = match rest.split_once('/') {
                    Some((first, tail)) if first.contains(':') => {
                        let (endpoint, user) = first.split_once(':').unwrap_or((first, ""));
                        (Some(endpoint.to_string()), format!("{}/{}", user, tail))
                    }
                    None if rest.contains(':') => {
                        let (endpoint, user) = rest.split_once(':').unwrap_or((rest, ""));
                        (Some(endpoint.to_string()), user.to_string())
                    }
                    _ => (None, rest.to_string()),
                };
                if endpoint.as_deref() == Some("") {
                    return Err(Error::validation(format!("empty endpoint in {}", url)));
                }
                if path.split('/').filter(|c| !c.is_empty()).count() < 2 {
                    return Err(Error::validation(format!(
                        "expecting {}://[endpoint:]user/repo/[branch]/[path], got {}",
                        scheme, url
                    )));
                }
                Ok(Location::Store {
                    scheme: scheme.to_string(),
                    endpoint,
                    path,
                })
            }
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Location::Local { .. })
    }
}

/// Absolute, lexically cleaned form of `p`. A trailing `/` survives.
fn absolutize(p: &str, cwd: &Path) -> String {
    let joined = if p.starts_with('/') {
        p.to_string()
    } else {
        format!("{}/{}", cwd.to_string_lossy().trim_end_matches('/'), p)
    };
    let trailing = joined.ends_with('/') || joined.ends_with("/.") || joined.ends_with("/..");

    let mut parts: Vec<&str> = Vec::new();
    for component in joined.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            c => parts.push(c),
        }
    }

    let mut out = format!("/{}", parts.join("/"));
    if trailing && out != "/" {
        out.push('/');
    }
    out
}
