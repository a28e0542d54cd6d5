//! Route compilation and selection.
//!
//! Routes are compiled once at build time and immutable afterwards, so the
//! per-request match walks a plain slice with no locks.

use regex::Regex;
use url::Url;

use trellis_core::config::RouteSpec;
use trellis_core::error::ProxyBuildError;

/// One compiled route: optional path regex plus the parsed upstream.
#[derive(Debug, Clone)]
pub struct Route {
    regex: Option<Regex>,
    upstream: Url,
}

impl Route {
    fn matches(&self, path: &str) -> bool {
        self.regex.as_ref().is_none_or(|re| re.is_match(path))
    }

    #[must_use]
    pub const fn upstream(&self) -> &Url {
        &self.upstream
    }

    /// `host:port` of the upstream, for raw TCP dialing.
    #[must_use]
    pub fn upstream_authority(&self) -> String {
        let host = self.upstream.host_str().unwrap_or("localhost");
        let port = self.upstream.port_or_known_default().unwrap_or(80);
        format!("{host}:{port}")
    }
}

/// The ordered route set of one listener.
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    /// Compile every route; any invalid regex or upstream fails the whole
    /// build.
    pub fn build(specs: &[RouteSpec]) -> Result<Self, ProxyBuildError> {
        let mut routes = Vec::with_capacity(specs.len());
        for spec in specs {
            let regex = match &spec.path_regexp {
                None => None,
                Some(pattern) => Some(Regex::new(pattern).map_err(|e| {
                    ProxyBuildError::InvalidRouteRegex {
                        pattern: pattern.clone(),
                        message: e.to_string(),
                    }
                })?),
            };
            let upstream = parse_upstream(&spec.upstream)?;
            routes.push(Route { regex, upstream });
        }
        Ok(Self { routes })
    }

    /// First route whose regex (or catch-all) matches the path.
    #[must_use]
    pub fn select(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|r| r.matches(path))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Parse an upstream, defaulting the scheme to `http://` when absent.
fn parse_upstream(raw: &str) -> Result<Url, ProxyBuildError> {
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    };
    let url = Url::parse(&with_scheme).map_err(|e| ProxyBuildError::InvalidUpstream {
        upstream: raw.to_string(),
        message: e.to_string(),
    })?;
    if url.host_str().is_none() {
        return Err(ProxyBuildError::InvalidUpstream {
            upstream: raw.to_string(),
            message: "upstream has no host".into(),
        });
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(path_regexp: Option<&str>, upstream: &str) -> RouteSpec {
        RouteSpec {
            path_regexp: path_regexp.map(ToString::to_string),
            upstream: upstream.to_string(),
        }
    }

    #[test]
    fn first_match_wins_in_declaration_order() {
        let table = RouteTable::build(&[
            spec(Some("^/api/.+"), "127.0.0.1:3001"),
            spec(None, "127.0.0.1:3000"),
        ])
        .unwrap();

        let api = table.select("/api/users").unwrap();
        assert_eq!(api.upstream().port(), Some(3001));

        let other = table.select("/index.html").unwrap();
        assert_eq!(other.upstream().port(), Some(3000));
    }

    #[test]
    fn no_match_without_catch_all() {
        let table = RouteTable::build(&[spec(Some("^/api/.+"), "127.0.0.1:3001")]).unwrap();
        assert!(table.select("/other").is_none());
        // The regex requires at least one character after the prefix.
        assert!(table.select("/api/").is_none());
    }

    #[test]
    fn scheme_defaults_to_http() {
        let table = RouteTable::build(&[spec(None, "127.0.0.1:3000")]).unwrap();
        let route = table.select("/").unwrap();
        assert_eq!(route.upstream().scheme(), "http");
        assert_eq!(route.upstream_authority(), "127.0.0.1:3000");
    }

    #[test]
    fn explicit_scheme_is_kept() {
        let table = RouteTable::build(&[spec(None, "https://internal:8443")]).unwrap();
        assert_eq!(table.select("/").unwrap().upstream().scheme(), "https");
    }

    #[test]
    fn default_port_fills_authority() {
        let table = RouteTable::build(&[spec(None, "upstream.local")]).unwrap();
        assert_eq!(table.select("/").unwrap().upstream_authority(), "upstream.local:80");
    }

    #[test]
    fn invalid_regex_fails_the_build() {
        let err = RouteTable::build(&[spec(Some("["), "127.0.0.1:3000")]).unwrap_err();
        assert!(matches!(err, ProxyBuildError::InvalidRouteRegex { .. }));
    }

    #[test]
    fn invalid_upstream_fails_the_build() {
        let err = RouteTable::build(&[spec(None, "http://")]).unwrap_err();
        assert!(matches!(err, ProxyBuildError::InvalidUpstream { .. }));
    }
}
