//! Execution requests.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use handlebars::Handlebars;
use itertools::Itertools;
use serde::Serialize;

use crate::error::MeshError;
use crate::resource::{Kind, Resource, Target};

/// Picks targets by unique name or by shared label.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Selector {
    Name(String),
    Label(String),
}

impl Selector {
    /// The bare name or label, without the kind prefix.
    pub fn value(&self) -> &str {
        match self {
            Selector::Name(value) | Selector::Label(value) => value,
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Selector::Name(name) => f.write_str(name),
            Selector::Label(label) => write!(f, "label:{}", label),
        }
    }
}

/// `web1` and `name:web1` select by name, `label:prod` selects by label.
impl FromStr for Selector {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let selector = match s.split_once(':') {
            Some(("label", label)) => Selector::Label(label.to_owned()),
            Some(("name", name)) => Selector::Name(name.to_owned()),
            _ => Selector::Name(s.to_owned()),
        };
        if selector.value().is_empty() {
            return Err(MeshError::InvalidDescriptor(format!(
                "empty selector '{}'",
                s
            )));
        }
        Ok(selector)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    /// A script file on the calling host. Its contents are shipped to the target.
    Path(PathBuf),
    /// A command line.
    Inline(String),
}

impl Script {
    pub async fn load(&self) -> Result<String, MeshError> {
        match self {
            Script::Inline(command) => Ok(command.clone()),
            Script::Path(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
                MeshError::InvalidDescriptor(format!(
                    "cannot read script {}: {}",
                    path.display(),
                    e
                ))
            }),
        }
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Script::Path(path) => write!(f, "{}", path.display()),
            Script::Inline(command) => write!(f, "'{}'", command),
        }
    }
}

/// One requested unit of work. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionDescriptor {
    selector: Selector,
    script: Script,
    target_kind: Option<Kind>,
    templated: bool,
}

impl ExecutionDescriptor {
    pub fn new(selector: Selector, script: Script) -> Self {
        Self {
            selector,
            script,
            target_kind: None,
            templated: false,
        }
    }

    /// Forces local or remote execution instead of following the resource's kind.
    pub fn with_target_kind(mut self, kind: Kind) -> Self {
        self.target_kind = Some(kind);
        self
    }

    /// Renders the script as a handlebars template against each resource.
    pub fn templated(mut self, templated: bool) -> Self {
        self.templated = templated;
        self
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    pub fn target_kind(&self) -> Option<Kind> {
        self.target_kind
    }

    pub fn is_templated(&self) -> bool {
        self.templated
    }

    /// The same request pinned to one resource by name.
    pub(crate) fn pinned_to(&self, name: &str) -> Self {
        Self {
            selector: Selector::Name(name.to_owned()),
            ..self.clone()
        }
    }

    /// Decides how `resource` gets reached for this request.
    pub fn target_for(&self, resource: &Resource) -> Result<Target, MeshError> {
        match (self.target_kind, &resource.target) {
            (None, target) => Ok(target.clone()),
            (Some(Kind::Remote), target @ Target::Remote { .. }) => Ok(target.clone()),
            (Some(Kind::Remote), Target::Local { .. }) => Err(MeshError::InvalidDescriptor(
                format!("'{}' is a local resource and cannot run remotely", resource.name),
            )),
            (Some(Kind::Local), target) => Ok(Target::Local {
                credentials: target.credentials().cloned(),
            }),
        }
    }

    /// Fills in the script text for one resource.
    pub fn render(
        &self,
        registry: &mut Handlebars,
        script: String,
        resource: &Resource,
    ) -> Result<String, MeshError> {
        if !self.templated {
            return Ok(script);
        }
        if !registry.has_template(&script) {
            registry
                .register_template_string(&script, &script)
                .map_err(|e| MeshError::InvalidDescriptor(format!("bad script template: {}", e)))?;
        }
        registry
            .render(&script, &TemplateContext::new(resource))
            .map_err(|e| {
                MeshError::InvalidDescriptor(format!(
                    "failed to render script for '{}': {}",
                    resource.name, e
                ))
            })
    }
}

/// Values visible to a script template. Auth material is deliberately absent.
#[derive(Serialize)]
struct TemplateContext<'a> {
    name: &'a str,
    kind: String,
    address: Option<&'a str>,
    username: Option<&'a str>,
    labels: String,
    #[serde(flatten)]
    params: &'a BTreeMap<String, String>,
}

impl<'a> TemplateContext<'a> {
    fn new(resource: &'a Resource) -> Self {
        let address = match &resource.target {
            Target::Remote { address, .. } => Some(address.as_str()),
            Target::Local { .. } => None,
        };
        Self {
            name: &resource.name,
            kind: resource.kind().to_string(),
            address,
            username: resource
                .target
                .credentials()
                .map(|c| c.username.as_str()),
            labels: resource.labels.iter().join(","),
            params: &resource.params,
        }
    }
}

/// A fresh registry with the extra string helpers registered.
pub fn template_registry() -> Handlebars<'static> {
    let mut registry = Handlebars::new();
    // Scripts are shell, not HTML.
    registry.register_escape_fn(handlebars::no_escape);
    handlebars_misc_helpers::register(&mut registry);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ConnectionSpec;

    fn web1() -> Resource {
        let mut params = BTreeMap::new();
        params.insert("role".to_string(), "frontend".to_string());
        ConnectionSpec {
            labels: vec!["prod".to_string()],
            kind: Kind::Remote,
            address: Some("10.0.0.5".to_string()),
            username: Some("ubuntu".to_string()),
            key: Some("/keys/prod".to_string()),
            params,
            ..Default::default()
        }
        .into_resource("web1".to_string())
        .unwrap()
    }

    #[test]
    fn test_selector_parsing() {
        assert_eq!(
            "web1".parse::<Selector>().unwrap(),
            Selector::Name("web1".to_string())
        );
        assert_eq!(
            "name:web1".parse::<Selector>().unwrap(),
            Selector::Name("web1".to_string())
        );
        assert_eq!(
            "label:prod".parse::<Selector>().unwrap(),
            Selector::Label("prod".to_string())
        );
        assert!("label:".parse::<Selector>().is_err());
    }

    #[test]
    fn test_target_follows_resource_by_default() {
        let descriptor =
            ExecutionDescriptor::new(Selector::Name("web1".into()), Script::Inline("uptime".into()));
        assert_eq!(descriptor.target_for(&web1()).unwrap().kind(), Kind::Remote);
    }

    #[test]
    fn test_local_override_keeps_identity() {
        let descriptor =
            ExecutionDescriptor::new(Selector::Name("web1".into()), Script::Inline("id".into()))
                .with_target_kind(Kind::Local);
        let target = descriptor.target_for(&web1()).unwrap();
        assert_eq!(target.kind(), Kind::Local);
        assert_eq!(target.credentials().unwrap().username, "ubuntu");
    }

    #[test]
    fn test_remote_override_on_local_resource_fails() {
        let laptop = ConnectionSpec::default()
            .into_resource("laptop".to_string())
            .unwrap();
        let descriptor =
            ExecutionDescriptor::new(Selector::Name("laptop".into()), Script::Inline("id".into()))
                .with_target_kind(Kind::Remote);
        assert!(matches!(
            descriptor.target_for(&laptop),
            Err(MeshError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn test_render_fills_resource_values() {
        let descriptor = ExecutionDescriptor::new(
            Selector::Name("web1".into()),
            Script::Inline("echo {{name}} {{username}}@{{address}} {{role}} {{labels}}".into()),
        )
        .templated(true);
        let mut registry = template_registry();
        let script = descriptor
            .render(
                &mut registry,
                "echo {{name}} {{username}}@{{address}} {{role}} {{labels}}".into(),
                &web1(),
            )
            .unwrap();
        assert_eq!(script, "echo web1 ubuntu@10.0.0.5 frontend prod");
    }

    #[test]
    fn test_render_is_noop_unless_templated() {
        let descriptor =
            ExecutionDescriptor::new(Selector::Name("web1".into()), Script::Inline("x".into()));
        let mut registry = template_registry();
        let script = descriptor
            .render(&mut registry, "echo {{name}}".into(), &web1())
            .unwrap();
        assert_eq!(script, "echo {{name}}");
    }

    #[tokio::test]
    async fn test_missing_script_file_is_invalid_descriptor() {
        let script = Script::Path(PathBuf::from("/definitely/not/here.sh"));
        assert!(matches!(
            script.load().await,
            Err(MeshError::InvalidDescriptor(_))
        ));
    }
}
