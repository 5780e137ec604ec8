//! Descriptor loading with helpful error messages

use std::path::{Component, Path, PathBuf};

use tracing::debug;

use super::schema::{RawApplication, RawDescriptor, RawEnvironment};
use super::{AppKind, ApplicationDescriptor, BuildKind, EnvironmentSpec, validate_name};
use crate::error::ConfigError;

pub const TOML_DESCRIPTOR: &str = "deploy.toml";
pub const JSON_DESCRIPTOR: &str = "deploy.json";

/// Load every application declared under `root`, in name order.
///
/// `deploy.toml` wins over `deploy.json` when both exist.
pub fn load_descriptors(root: &Path) -> Result<Vec<ApplicationDescriptor>, ConfigError> {
    let toml_path = root.join(TOML_DESCRIPTOR);
    let json_path = root.join(JSON_DESCRIPTOR);

    let (path, is_toml) = if toml_path.is_file() {
        (toml_path, true)
    } else if json_path.is_file() {
        (json_path, false)
    } else {
        return Err(ConfigError::MissingDescriptor {
            root: root.to_path_buf(),
        });
    };

    let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    debug!(path = %path.display(), "loading descriptor");

    if is_toml {
        parse_toml_str(&content, &path)
    } else {
        parse_json_str(&content, &path)
    }
}

/// Parse a `deploy.toml` body. `path` is only used in error messages.
pub fn parse_toml_str(content: &str, path: &Path) -> Result<Vec<ApplicationDescriptor>, ConfigError> {
    let raw: RawDescriptor = toml::from_str(content).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: enhance_toml_error(&e, content),
    })?;
    build(raw)
}

/// Parse a `deploy.json` body. `path` is only used in error messages.
pub fn parse_json_str(content: &str, path: &Path) -> Result<Vec<ApplicationDescriptor>, ConfigError> {
    let raw: RawDescriptor = serde_json::from_str(content).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    build(raw)
}

/// Point at the offending line with a couple of lines of context.
fn enhance_toml_error(error: &toml::de::Error, content: &str) -> String {
    let Some(span) = error.span() else {
        return error.message().to_string();
    };
    let line_num = content[..span.start.min(content.len())]
        .matches('\n')
        .count()
        + 1;
    format!(
        "error at line {}:\n{}\n\n{}",
        line_num,
        line_context(content, line_num),
        error.message()
    )
}

fn line_context(content: &str, line_num: usize) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let start = line_num.saturating_sub(2);
    let end = (line_num + 1).min(lines.len());

    lines
        .get(start..end)
        .unwrap_or_default()
        .iter()
        .enumerate()
        .map(|(i, line)| {
            let num = start + i + 1;
            let marker = if num == line_num { ">>>" } else { "   " };
            format!("{} {:4} | {}", marker, num, line)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn build(raw: RawDescriptor) -> Result<Vec<ApplicationDescriptor>, ConfigError> {
    if raw.is_empty() {
        return Err(ConfigError::NoApplications);
    }
    raw.into_iter()
        .map(|(name, app)| build_application(name, app))
        .collect()
}

fn build_application(name: String, raw: RawApplication) -> Result<ApplicationDescriptor, ConfigError> {
    validate_name("application", &name)?;
    if let Some((field, _)) = raw.environments.iter().find(|(_, value)| !value.is_object()) {
        return Err(ConfigError::UnknownField {
            app: name,
            field: field.clone(),
        });
    }

    let folder = required(&name, "folder", raw.folder)?;
    let folder = validate_folder(&name, &folder)?;
    if folder.split('/').next() == Some(name.as_str()) {
        return Err(ConfigError::InvalidField {
            app: name.clone(),
            field: "folder".to_string(),
            message: format!(
                "must not start with a directory named '{name}': the built binary is written to that path"
            ),
        });
    }
    let build = BuildKind::parse(&name, &required(&name, "build", raw.build)?)?;
    let kind = AppKind::parse(&name, &required(&name, "type", raw.kind)?)?;

    if raw.environments.is_empty() {
        return Err(ConfigError::MissingField {
            app: name,
            field: "<environment>".to_string(),
        });
    }

    let mut environments = std::collections::BTreeMap::new();
    for (env_name, env) in raw.environments {
        validate_name("environment", &env_name)?;
        let env: RawEnvironment =
            serde_json::from_value(env).map_err(|e| ConfigError::MalformedEnvironment {
                app: name.clone(),
                environment: env_name.clone(),
                message: e.to_string(),
            })?;
        let spec = build_environment(&name, &env_name, kind, env)?;
        environments.insert(env_name, spec);
    }

    Ok(ApplicationDescriptor {
        name,
        folder,
        build,
        kind,
        environments,
    })
}

fn build_environment(
    app: &str,
    env: &str,
    kind: AppKind,
    raw: RawEnvironment,
) -> Result<EnvironmentSpec, ConfigError> {
    let invalid = |field: &str, message: &str| ConfigError::InvalidEnvironment {
        app: app.to_string(),
        environment: env.to_string(),
        field: field.to_string(),
        message: message.to_string(),
    };

    let servers = host_list(raw.servers.unwrap_or_default(), |m| invalid("servers", m))?;
    if servers.is_empty() {
        return Err(invalid("servers", "at least one server is required"));
    }
    let proxies = host_list(raw.proxies.unwrap_or_default(), |m| invalid("proxies", m))?;
    let domains: std::collections::BTreeSet<String> = raw
        .domains
        .unwrap_or_default()
        .into_iter()
        .map(|d| d.trim().to_ascii_lowercase())
        .collect();
    if domains.iter().any(|d| d.is_empty() || d.contains(char::is_whitespace)) {
        return Err(invalid("domains", "domains must be non-empty and contain no whitespace"));
    }

    if kind == AppKind::Web {
        if proxies.is_empty() {
            return Err(invalid("proxies", "web applications need at least one proxy"));
        }
        if domains.is_empty() {
            return Err(invalid("domains", "web applications need at least one domain"));
        }
    }

    Ok(EnvironmentSpec {
        servers,
        proxies,
        domains,
    })
}

/// Trim, reject blanks, drop duplicates keeping the first occurrence.
fn host_list(
    hosts: Vec<String>,
    invalid: impl Fn(&str) -> ConfigError,
) -> Result<Vec<String>, ConfigError> {
    let mut out: Vec<String> = Vec::with_capacity(hosts.len());
    for host in hosts {
        let host = host.trim();
        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(invalid("host names must be non-empty and contain no whitespace"));
        }
        if !out.iter().any(|h| h == host) {
            out.push(host.to_string());
        }
    }
    Ok(out)
}

fn required(app: &str, field: &str, value: Option<String>) -> Result<String, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::MissingField {
            app: app.to_string(),
            field: field.to_string(),
        }),
    }
}

/// The folder must stay inside the source root.
fn validate_folder(app: &str, folder: &str) -> Result<String, ConfigError> {
    let invalid = |message: &str| ConfigError::InvalidField {
        app: app.to_string(),
        field: "folder".to_string(),
        message: message.to_string(),
    };
    let path = PathBuf::from(folder);
    if path.is_absolute() || folder.starts_with('/') {
        return Err(invalid("must be relative to the source root"));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(invalid("must not contain `..`"));
    }
    Ok(folder.trim_end_matches('/').to_string())
}
