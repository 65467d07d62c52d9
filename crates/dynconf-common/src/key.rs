//! Config keys and the templates they are rendered from
//!
//! Key templates use the `{{.Field}}` action syntax with three fields:
//! `Category`, `ClientServiceName` and `ServerServiceName`.

use std::fmt::{Display, Formatter};
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::error::{DynconfError, Result};

static PLACEHOLDER: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\{\{\s*\.([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("Invalid regex pattern")
});

/// Identifies one watchable configuration item in a backend.
///
/// Apollo addresses an item by namespace, cluster and item key. etcd, Consul
/// and ZooKeeper only use `key`, which holds the full path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ConfigKey {
    pub namespace: String,
    pub cluster: String,
    pub key: String,
}

impl ConfigKey {
    /// Key addressed by a single path
    pub fn path(path: impl Into<String>) -> Self {
        Self {
            key: path.into(),
            ..Default::default()
        }
    }

    /// Key addressed by namespace, cluster and item key
    pub fn new(
        namespace: impl Into<String>,
        cluster: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            cluster: cluster.into(),
            key: key.into(),
        }
    }
}

impl Display for ConfigKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<&str> = [
            self.namespace.as_str(),
            self.cluster.as_str(),
            self.key.as_str(),
        ]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect();
        write!(f, "{}", parts.join("/"))
    }
}

/// Template inputs for rendering a config key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigParamConfig {
    pub category: String,
    pub client_service_name: String,
    pub server_service_name: String,
}

impl ConfigParamConfig {
    pub fn new(
        category: impl Into<String>,
        client_service_name: impl Into<String>,
        server_service_name: impl Into<String>,
    ) -> Self {
        Self {
            category: category.into(),
            client_service_name: client_service_name.into(),
            server_service_name: server_service_name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TemplateField {
    Category,
    ClientServiceName,
    ServerServiceName,
}

impl TemplateField {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "Category" => Some(TemplateField::Category),
            "ClientServiceName" => Some(TemplateField::ClientServiceName),
            "ServerServiceName" => Some(TemplateField::ServerServiceName),
            _ => None,
        }
    }

    fn value<'a>(&self, param: &'a ConfigParamConfig) -> &'a str {
        match self {
            TemplateField::Category => &param.category,
            TemplateField::ClientServiceName => &param.client_service_name,
            TemplateField::ServerServiceName => &param.server_service_name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(TemplateField),
}

/// A parsed key template such as `{{.ClientServiceName}}/{{.Category}}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl KeyTemplate {
    /// Parse a template, rejecting unknown fields and unbalanced actions
    pub fn parse(source: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut cursor = 0;

        for caps in PLACEHOLDER.captures_iter(source) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            push_literal(&mut segments, source, &source[cursor..whole.start()])?;

            let field = TemplateField::parse(name.as_str()).ok_or_else(|| {
                DynconfError::Template(format!(
                    "can't evaluate field {} in template {:?}",
                    name.as_str(),
                    source
                ))
            })?;
            segments.push(Segment::Field(field));
            cursor = whole.end();
        }
        push_literal(&mut segments, source, &source[cursor..])?;

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// Render the template with the given inputs
    pub fn render(&self, param: &ConfigParamConfig) -> String {
        self.segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(text) => text.as_str(),
                Segment::Field(field) => field.value(param),
            })
            .collect()
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

fn push_literal(segments: &mut Vec<Segment>, source: &str, literal: &str) -> Result<()> {
    if literal.contains("{{") || literal.contains("}}") {
        return Err(DynconfError::Template(format!(
            "malformed action in template {:?}",
            source
        )));
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param() -> ConfigParamConfig {
        ConfigParamConfig::new("retry", "frontend", "backend")
    }

    #[test]
    fn test_render_path_template() {
        let template =
            KeyTemplate::parse("{{.ClientServiceName}}/{{.ServerServiceName}}/{{.Category}}")
                .unwrap();
        assert_eq!(template.render(&param()), "frontend/backend/retry");
    }

    #[test]
    fn test_render_with_spaces_and_literals() {
        let template = KeyTemplate::parse("cfg-{{ .ServerServiceName }}.{{.Category}}.json").unwrap();
        assert_eq!(template.render(&param()), "cfg-backend.retry.json");
    }

    #[test]
    fn test_plain_template() {
        let template = KeyTemplate::parse("static").unwrap();
        assert_eq!(template.render(&param()), "static");
        assert_eq!(template.source(), "static");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = KeyTemplate::parse("{{.Region}}/{{.Category}}").unwrap_err();
        assert!(matches!(err, DynconfError::Template(_)));
        assert!(err.to_string().contains("Region"));
    }

    #[test]
    fn test_unbalanced_action_rejected() {
        assert!(KeyTemplate::parse("{{.Category").is_err());
        assert!(KeyTemplate::parse("{{.Category}}}}").is_err());
        assert!(KeyTemplate::parse("{{Category}}").is_err());
    }

    #[test]
    fn test_config_key_display() {
        assert_eq!(ConfigKey::new("n1", "c1", "k1").to_string(), "n1/c1/k1");
        assert_eq!(
            ConfigKey::path("/KitexConfig/a/b/retry").to_string(),
            "/KitexConfig/a/b/retry"
        );
        assert_eq!(ConfigKey::new("n1", "", "k1").to_string(), "n1/k1");
    }
}
