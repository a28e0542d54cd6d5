//! Configuration loading and validation.
//!
//! HJSON parsing and template expansion happen upstream; this loader takes
//! the already-expanded JSON document. `load` only parses: the supervisor
//! tolerates duplicate names (last definition wins) and reports missing
//! dependencies per-service at start time, so `trellis run` must not refuse
//! documents the runtime is built to handle. The stricter structural checks
//! live in `check`, behind the `trellis check` subcommand.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result, bail};

use trellis_core::config::TrellisConfig;
use trellis_proxy::RouteTable;

/// Read and parse the configuration document.
pub fn load(path: &Path) -> Result<TrellisConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

/// Structural checks for `trellis check`: service names must be unique and
/// non-empty, argv non-empty, `depends_on` targets known; every listen
/// address must parse and every route table must compile.
pub fn check(config: &TrellisConfig) -> Result<()> {
    let mut seen = HashSet::new();
    for service in &config.services {
        if service.name.is_empty() {
            bail!("service with empty name");
        }
        if service.argv.is_empty() {
            bail!("service {} has an empty argv", service.name);
        }
        if !seen.insert(service.name.as_str()) {
            bail!("duplicate service name: {}", service.name);
        }
    }
    for service in &config.services {
        for dep in &service.depends_on {
            if !seen.contains(dep.as_str()) {
                bail!(
                    "service {} depends on unknown service {}",
                    service.name,
                    dep
                );
            }
        }
    }

    for listener in &config.proxies {
        listener
            .listen
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("listen address {:?}", listener.listen))?;
        RouteTable::build(&listener.routes)
            .with_context(|| format!("routes for listener {}", listener.listen))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_a_minimal_document() {
        let file = write_config(
            r#"{
                "services": [
                    {"name": "web", "argv": ["./web"]},
                    {"name": "api", "argv": ["./api"], "depends_on": ["web"]}
                ],
                "proxies": [
                    {"listen": "127.0.0.1:1099", "routes": [{"upstream": "127.0.0.1:3000"}]}
                ]
            }"#,
        );
        let config = load(file.path()).unwrap();
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.proxies.len(), 1);
        check(&config).unwrap();
    }

    #[test]
    fn duplicate_names_load_but_fail_check() {
        let file = write_config(
            r#"{"services": [
                {"name": "web", "argv": ["./web"]},
                {"name": "web", "argv": ["./other"]}
            ]}"#,
        );
        // `run` keeps going (the supervisor keeps the last definition);
        // only `check` refuses.
        let config = load(file.path()).unwrap();
        let err = check(&config).unwrap_err();
        assert!(err.to_string().contains("duplicate service name"));
    }

    #[test]
    fn unknown_dependencies_load_but_fail_check() {
        let file = write_config(
            r#"{"services": [{"name": "api", "argv": ["./api"], "depends_on": ["db"]}]}"#,
        );
        let config = load(file.path()).unwrap();
        let err = check(&config).unwrap_err();
        assert!(err.to_string().contains("unknown service"));
    }

    #[test]
    fn check_flags_empty_argv() {
        let config: TrellisConfig =
            serde_json::from_str(r#"{"services": [{"name": "web", "argv": []}]}"#).unwrap();
        let err = check(&config).unwrap_err();
        assert!(err.to_string().contains("empty argv"));
    }

    #[test]
    fn check_flags_bad_routes() {
        let config: TrellisConfig = serde_json::from_str(
            r#"{"proxies": [{"listen": "127.0.0.1:1099", "routes": [{"path_regexp": "[", "upstream": "127.0.0.1:3000"}]}]}"#,
        )
        .unwrap();
        assert!(check(&config).is_err());
    }

    #[test]
    fn check_flags_bad_listen_addresses() {
        let config: TrellisConfig = serde_json::from_str(
            r#"{"proxies": [{"listen": "not-an-address", "routes": []}]}"#,
        )
        .unwrap();
        assert!(check(&config).is_err());
    }
}
