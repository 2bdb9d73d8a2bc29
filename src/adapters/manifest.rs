//! Manifest parsing and tool extraction shared by the adapters.
//!
//! | Input | Helper |
//! |-------|--------|
//! | `package.json` | [`package_json_dependencies`] |
//! | `pyproject.toml` | [`pyproject_dependencies`] |
//! | `requirements.txt` | [`requirements_dependencies`] |
//! | JSON `tools` array | [`tools_from_json`] |
//! | Python / JS / TS source | [`tools_from_source`] |
//!
//! Tool extraction is purely textual; nothing here evaluates the code it
//! reads.

use std::collections::HashSet;

use serde_json::Value;

use crate::error::ParseError;
use crate::models::{Dependency, DependencyType, Tool};
use crate::risk::SourceFile;

/// Manifest file names the GitHub adapter looks for, in priority order.
pub const MANIFEST_FILES: [&str; 3] = ["package.json", "pyproject.toml", "requirements.txt"];

/// Extras treated as development-only dependencies.
const DEV_EXTRAS: [&str; 5] = ["dev", "test", "tests", "testing", "develop"];

/// Dispatch on the manifest file name.
pub fn dependencies_from_manifest(
    file_name: &str,
    content: &str,
) -> Result<Vec<Dependency>, ParseError> {
    let base = file_name.rsplit('/').next().unwrap_or(file_name);
    match base {
        "package.json" => {
            let value: Value = serde_json::from_str(content)?;
            Ok(package_json_dependencies(&value))
        }
        "pyproject.toml" => pyproject_dependencies(content),
        "requirements.txt" => Ok(requirements_dependencies(content)),
        other => Err(ParseError::Malformed(format!(
            "unsupported manifest file: {}",
            other
        ))),
    }
}

/// `dependencies`, `devDependencies` and `peerDependencies` of a package
/// document.
pub fn package_json_dependencies(doc: &Value) -> Vec<Dependency> {
    let sections = [
        ("dependencies", DependencyType::Runtime),
        ("devDependencies", DependencyType::Dev),
        ("peerDependencies", DependencyType::Peer),
    ];

    let mut deps = Vec::new();
    for (key, dependency_type) in sections {
        if let Some(map) = doc.get(key).and_then(Value::as_object) {
            for (name, version) in map {
                deps.push(Dependency {
                    name: name.clone(),
                    version_constraint: version.as_str().map(str::to_string),
                    dependency_type,
                });
            }
        }
    }
    deps
}

/// PEP 621 `[project]` tables, falling back to Poetry's layout.
pub fn pyproject_dependencies(content: &str) -> Result<Vec<Dependency>, ParseError> {
    let doc: toml::Value = toml::from_str(content)?;
    let mut deps = Vec::new();

    if let Some(project) = doc.get("project") {
        if let Some(list) = project.get("dependencies").and_then(toml::Value::as_array) {
            for spec in list.iter().filter_map(toml::Value::as_str) {
                if let Some(dep) = requirement_to_dependency(spec, DependencyType::Runtime) {
                    deps.push(dep);
                }
            }
        }
        if let Some(optional) = project
            .get("optional-dependencies")
            .and_then(toml::Value::as_table)
        {
            for (extra, list) in optional {
                if !DEV_EXTRAS.contains(&extra.as_str()) {
                    continue;
                }
                for spec in list.as_array().into_iter().flatten().filter_map(toml::Value::as_str) {
                    if let Some(dep) = requirement_to_dependency(spec, DependencyType::Dev) {
                        deps.push(dep);
                    }
                }
            }
        }
    }

    if let Some(poetry) = doc.get("tool").and_then(|t| t.get("poetry")) {
        push_poetry_table(poetry.get("dependencies"), DependencyType::Runtime, &mut deps);
        push_poetry_table(poetry.get("dev-dependencies"), DependencyType::Dev, &mut deps);
        if let Some(groups) = poetry.get("group").and_then(toml::Value::as_table) {
            for group in groups.values() {
                push_poetry_table(group.get("dependencies"), DependencyType::Dev, &mut deps);
            }
        }
    }

    Ok(deps)
}

fn push_poetry_table(
    table: Option<&toml::Value>,
    dependency_type: DependencyType,
    deps: &mut Vec<Dependency>,
) {
    let Some(table) = table.and_then(toml::Value::as_table) else {
        return;
    };
    for (name, spec) in table {
        if name == "python" {
            continue;
        }
        let version = match spec {
            toml::Value::String(v) => Some(v.clone()),
            toml::Value::Table(t) => t.get("version").and_then(|v| v.as_str()).map(str::to_string),
            _ => None,
        };
        deps.push(Dependency {
            name: name.clone(),
            version_constraint: version,
            dependency_type,
        });
    }
}

/// One dependency per requirement line; options, includes and editable
/// installs are skipped.
pub fn requirements_dependencies(content: &str) -> Vec<Dependency> {
    content
        .lines()
        .map(|line| line.split(" #").next().unwrap_or(line).trim())
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('-'))
        .filter_map(|line| requirement_to_dependency(line, DependencyType::Runtime))
        .collect()
}

/// A parsed PEP 508 requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    pub constraint: Option<String>,
    /// Value of an `extra == "…"` marker, if any.
    pub extra: Option<String>,
}

/// Parse `name[extras] (>=1.0) ; marker`.
pub fn parse_requirement(spec: &str) -> Option<Requirement> {
    let (requirement, marker) = match spec.split_once(';') {
        Some((r, m)) => (r.trim(), Some(m.trim())),
        None => (spec.trim(), None),
    };

    let name_end = requirement
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'))
        .unwrap_or(requirement.len());
    let name = &requirement[..name_end];
    if name.is_empty() {
        return None;
    }

    let mut rest = requirement[name_end..].trim_start();
    if rest.starts_with('[') {
        rest = rest.find(']').map_or("", |end| &rest[end + 1..]).trim_start();
    }
    let constraint = rest
        .trim_start_matches('(')
        .trim_end_matches(')')
        .trim()
        .to_string();

    Some(Requirement {
        name: name.to_string(),
        constraint: (!constraint.is_empty()).then_some(constraint),
        extra: marker.and_then(extra_from_marker),
    })
}

fn extra_from_marker(marker: &str) -> Option<String> {
    let idx = marker.find("extra")?;
    let after = marker[idx + "extra".len()..].trim_start();
    let after = after.strip_prefix("==")?.trim_start();
    let (literal, _) = string_literal(after)?;
    Some(literal)
}

/// Map a requirement to a dependency. Requirements gated behind a
/// non-development extra are optional features and are dropped.
pub fn requirement_to_dependency(
    spec: &str,
    default_type: DependencyType,
) -> Option<Dependency> {
    let req = parse_requirement(spec)?;
    let dependency_type = match req.extra.as_deref() {
        None => default_type,
        Some(extra) if DEV_EXTRAS.contains(&extra) => DependencyType::Dev,
        Some(_) => return None,
    };
    Some(Dependency {
        name: req.name,
        version_constraint: req.constraint,
        dependency_type,
    })
}

// ═══════════════════════════════════════════════════════════════════════
// Tool extraction
// ═══════════════════════════════════════════════════════════════════════

/// Tools declared in a JSON `tools` array.
///
/// Accepts `inputSchema`, `input_schema` or `parameters` for the schema.
pub fn tools_from_json(doc: &Value) -> Vec<Tool> {
    let Some(items) = doc.get("tools").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let name = item.get("name")?.as_str()?.trim();
            if name.is_empty() {
                return None;
            }
            let schema = ["inputSchema", "input_schema", "parameters"]
                .iter()
                .find_map(|k| item.get(*k))
                .cloned()
                .unwrap_or_else(|| serde_json::json!({}));
            Some(Tool {
                name: name.to_string(),
                description: item
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                input_schema: schema,
            })
        })
        .collect()
}

/// Tools registered in source code.
///
/// Recognises Python functions decorated with `@<anything>.tool(…)` and
/// JavaScript/TypeScript `.tool("name", "description", …)` and
/// `registerTool("name", …)` calls.
pub fn tools_from_source(files: &[SourceFile]) -> Vec<Tool> {
    let mut tools = Vec::new();
    for file in files {
        if file.path.ends_with(".py") {
            python_tools(&file.content, &mut tools);
        } else if [".js", ".mjs", ".cjs", ".ts", ".mts", ".tsx"]
            .iter()
            .any(|ext| file.path.ends_with(ext))
        {
            js_tools(&file.content, &mut tools);
        }
    }
    tools
}

fn python_tools(content: &str, tools: &mut Vec<Tool>) {
    let mut decorated = false;
    for line in content.lines() {
        let t = line.trim();
        if (t.starts_with('@') && t.contains(".tool(")) || t == "@tool" || t.starts_with("@tool(") {
            decorated = true;
            continue;
        }
        if !decorated {
            continue;
        }
        if t.starts_with('@') || t.is_empty() {
            continue;
        }
        let signature = t.strip_prefix("async ").unwrap_or(t);
        if let Some(rest) = signature.strip_prefix("def ") {
            let name: String = rest
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_')
                .collect();
            if !name.is_empty() {
                tools.push(Tool {
                    name,
                    description: None,
                    input_schema: serde_json::json!({}),
                });
            }
        }
        decorated = false;
    }
}

fn js_tools(content: &str, tools: &mut Vec<Tool>) {
    for pattern in [".tool(", "registerTool("] {
        let mut search = content;
        while let Some(idx) = search.find(pattern) {
            let after = &search[idx + pattern.len()..];
            search = after;

            let Some((name, rest)) = string_literal(after.trim_start()) else {
                continue;
            };
            let description = rest
                .trim_start()
                .strip_prefix(',')
                .and_then(|r| string_literal(r.trim_start()))
                .map(|(d, _)| d);
            tools.push(Tool {
                name,
                description,
                input_schema: serde_json::json!({}),
            });
        }
    }
}

/// Parse a quoted literal at the start of `s`. Returns the unescaped
/// content and the remainder after the closing quote.
fn string_literal(s: &str) -> Option<(String, &str)> {
    let quote = s.chars().next().filter(|c| matches!(c, '"' | '\'' | '`'))?;
    let mut out = String::new();
    let mut escaped = false;
    for (i, c) in s[1..].char_indices() {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == quote {
            return Some((out, &s[1 + i + c.len_utf8()..]));
        } else {
            out.push(c);
        }
    }
    None
}

/// Keep the first tool of each name.
pub fn dedup_tools(tools: Vec<Tool>) -> Vec<Tool> {
    let mut seen = HashSet::new();
    tools
        .into_iter()
        .filter(|t| seen.insert(t.name.clone()))
        .collect()
}
