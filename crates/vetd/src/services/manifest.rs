//! Dependency manifest formats accepted by the parse stage.
//!
//! - JSON with a package list: `{"packages": [{"name", "version", "licenses"}]}`
//! - JSON with a dependency map: `{"dependencies": {"name": "version"}}`
//! - Requirement lines: `name==version` with an optional `; license=A,B`
//!   suffix. Blank lines and `#` comments are ignored.

use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("manifest is empty")]
    Empty,
    #[error("invalid json manifest: {0}")]
    Json(String),
    #[error("json manifest has neither `packages` nor `dependencies`")]
    UnknownShape,
    #[error("line {line}: {reason}")]
    Line { line: usize, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub name: String,
    pub version: String,
    pub licenses: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct JsonManifest {
    #[serde(default)]
    packages: Option<Vec<JsonPackage>>,
    #[serde(default)]
    dependencies: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct JsonPackage {
    name: String,
    version: String,
    #[serde(default)]
    licenses: Vec<String>,
}

pub fn parse_manifest(payload: &str) -> Result<Vec<ManifestEntry>, ManifestError> {
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        return Err(ManifestError::Empty);
    }
    let entries = if trimmed.starts_with('{') {
        parse_json(trimmed)?
    } else {
        parse_lines(trimmed)?
    };
    if entries.is_empty() {
        return Err(ManifestError::Empty);
    }
    Ok(entries)
}

fn parse_json(payload: &str) -> Result<Vec<ManifestEntry>, ManifestError> {
    let manifest: JsonManifest =
        serde_json::from_str(payload).map_err(|err| ManifestError::Json(err.to_string()))?;
    if let Some(packages) = manifest.packages {
        return Ok(packages
            .into_iter()
            .map(|pkg| ManifestEntry {
                name: pkg.name.trim().to_string(),
                version: pkg.version.trim().to_string(),
                licenses: clean_licenses(pkg.licenses.iter().map(String::as_str)),
            })
            .collect());
    }
    if let Some(dependencies) = manifest.dependencies {
        return Ok(dependencies
            .into_iter()
            .map(|(name, version)| ManifestEntry {
                name: name.trim().to_string(),
                version: version.trim().to_string(),
                licenses: Vec::new(),
            })
            .collect());
    }
    Err(ManifestError::UnknownShape)
}

fn parse_lines(payload: &str) -> Result<Vec<ManifestEntry>, ManifestError> {
    let mut entries = Vec::new();
    for (idx, raw) in payload.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (requirement, options) = match line.split_once(';') {
            Some((req, opts)) => (req.trim(), Some(opts.trim())),
            None => (line, None),
        };
        let Some((name, version)) = requirement.split_once("==") else {
            return Err(ManifestError::Line {
                line: idx + 1,
                reason: format!("expected `name==version`, got `{requirement}`"),
            });
        };
        let licenses = match options {
            Some(opts) => parse_license_option(opts).map_err(|reason| ManifestError::Line {
                line: idx + 1,
                reason,
            })?,
            None => Vec::new(),
        };
        entries.push(ManifestEntry {
            name: name.trim().to_string(),
            version: version.trim().to_string(),
            licenses,
        });
    }
    Ok(entries)
}

fn parse_license_option(options: &str) -> Result<Vec<String>, String> {
    let Some((key, value)) = options.split_once('=') else {
        return Err(format!("expected `license=...`, got `{options}`"));
    };
    if key.trim() != "license" {
        return Err(format!("unknown option `{}`", key.trim()));
    }
    Ok(clean_licenses(value.split(',')))
}

fn clean_licenses<'a>(raw: impl Iterator<Item = &'a str>) -> Vec<String> {
    raw.map(str::trim)
        .filter(|license| !license.is_empty())
        .map(str::to_string)
        .collect()
}
