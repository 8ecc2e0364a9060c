// SPDX-License-Identifier: Apache-2.0

//! Plugin templates: parameterised sub-pipelines rendered into ordinary
//! operator descriptors at build time.
//!
//! A template file has a `parameters` block describing named, typed
//! parameters, and a `pipeline` block kept as raw text containing
//! `{{ .name }}` markers. Two parameters are always bound at render time:
//! `input`, the invocation's id (template authors use it as the id of
//! their first operator so upstream references resolve), and `output`, the
//! parent-pipeline outputs the template's tail emits to.
//!
//! Substituted values are escaped as quoted scalars, so a parameter value
//! can never introduce a new operator descriptor or a new marker.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::error::{Error, Result};
use crate::operator::{check_unique_ids, decode_descriptors, OperatorDescriptor};

static MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*\.([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("valid marker regex")
});

const RESERVED_PARAMETERS: [&str; 2] = ["input", "output"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterKind {
    String,
    Int,
    Bool,
    Strings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParameterSpec {
    #[serde(rename = "type")]
    pub kind: ParameterKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct TemplateHead {
    #[serde(default)]
    parameters: BTreeMap<String, ParameterSpec>,
}

/// A parsed plugin template
#[derive(Debug)]
pub struct PluginTemplate {
    name: String,
    parameters: BTreeMap<String, ParameterSpec>,
    /// The raw `pipeline:` block, substituted textually at render time
    body: String,
}

impl PluginTemplate {
    /// Parse a template document. The text above the top-level `pipeline:`
    /// line is parsed as YAML for the parameter declarations; everything
    /// from that line on is kept raw for substitution.
    pub fn parse(name: impl Into<String>, text: &str) -> Result<Self> {
        let name = name.into();

        let Some(split_at) = find_pipeline_block(text) else {
            return Err(Error::Template(format!(
                "template '{}' has no top-level 'pipeline' block",
                name
            )));
        };
        let (head_text, body) = text.split_at(split_at);

        let head: TemplateHead = if head_text.trim().is_empty() {
            TemplateHead::default()
        } else {
            serde_yaml::from_str(head_text).map_err(|e| {
                Error::Template(format!("template '{}' has an invalid header: {}", name, e))
            })?
        };

        for reserved in RESERVED_PARAMETERS {
            if head.parameters.contains_key(reserved) {
                return Err(Error::Template(format!(
                    "template '{}' declares reserved parameter '{}'",
                    name, reserved
                )));
            }
        }

        for (param, spec) in &head.parameters {
            if let Some(default) = &spec.default {
                render_scalar(default, spec.kind).map_err(|_| {
                    Error::Template(format!(
                        "template '{}': default for parameter '{}' does not match its type",
                        name, param
                    ))
                })?;
            }
        }

        Ok(Self {
            name,
            parameters: head.parameters,
            body: body.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Render the template for one invocation, returning the substituted
    /// `pipeline:` document text.
    pub fn render(
        &self,
        invocation_id: &str,
        outputs: &[String],
        params: &Mapping,
    ) -> Result<String> {
        let mut values: HashMap<&str, String> = HashMap::new();

        for key in params.keys() {
            let Some(key) = key.as_str() else {
                return Err(Error::Template(format!(
                    "template '{}': parameter names must be strings",
                    self.name
                )));
            };
            if !self.parameters.contains_key(key) {
                return Err(Error::Template(format!(
                    "template '{}' has no parameter '{}'",
                    self.name, key
                )));
            }
        }

        for (param, spec) in &self.parameters {
            let provided = params.get(&Value::String(param.clone()));
            let rendered = match provided {
                Some(value) => render_scalar(value, spec.kind).map_err(|kind| {
                    Error::Template(format!(
                        "template '{}': parameter '{}' must be a {}",
                        self.name, param, kind
                    ))
                })?,
                None => match &spec.default {
                    Some(default) => render_scalar(default, spec.kind).map_err(|kind| {
                        Error::Template(format!(
                            "template '{}': parameter '{}' must be a {}",
                            self.name, param, kind
                        ))
                    })?,
                    None if spec.required => {
                        return Err(Error::Template(format!(
                            "template '{}' is missing required parameter '{}'",
                            self.name, param
                        )));
                    }
                    None => "null".to_string(),
                },
            };
            values.insert(param.as_str(), rendered);
        }

        values.insert("input", quote(invocation_id));
        let output_list: Vec<String> = outputs.iter().map(|o| quote(o)).collect();
        values.insert("output", format!("[{}]", output_list.join(", ")));

        // Every marker must resolve before substitution starts
        for captures in MARKER.captures_iter(&self.body) {
            let marker = &captures[1];
            if !values.contains_key(marker) {
                return Err(Error::Template(format!(
                    "template '{}' references unknown parameter '{}'",
                    self.name, marker
                )));
            }
        }

        Ok(MARKER
            .replace_all(&self.body, |captures: &regex::Captures<'_>| {
                values[&captures[1]].clone()
            })
            .into_owned())
    }
}

/// Byte offset of the top-level `pipeline:` line
fn find_pipeline_block(text: &str) -> Option<usize> {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_end();
        if trimmed == "pipeline:" || trimmed.starts_with("pipeline: ") {
            return Some(offset);
        }
        offset += line.len();
    }
    None
}

/// Escape a parameter value as a scalar that cannot break out of its
/// position in the rendered document. Returns the expected kind name on a
/// type mismatch.
fn render_scalar(value: &Value, kind: ParameterKind) -> std::result::Result<String, &'static str> {
    match kind {
        ParameterKind::String => match value.as_str() {
            Some(s) => Ok(quote(s)),
            None => Err("string"),
        },
        ParameterKind::Int => match value.as_i64() {
            Some(i) => Ok(i.to_string()),
            None => Err("int"),
        },
        ParameterKind::Bool => match value.as_bool() {
            Some(b) => Ok(b.to_string()),
            None => Err("bool"),
        },
        ParameterKind::Strings => match value.as_sequence() {
            Some(seq) => {
                let mut items = Vec::with_capacity(seq.len());
                for item in seq {
                    match item.as_str() {
                        Some(s) => items.push(quote(s)),
                        None => return Err("list of strings"),
                    }
                }
                Ok(format!("[{}]", items.join(", ")))
            }
            None => Err("list of strings"),
        },
    }
}

/// JSON string quoting doubles as YAML double-quoted scalar escaping
fn quote(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s))
}

/// The set of templates overlaid on the registry for one pipeline build.
/// Template types shadow builtin types during expansion; the global
/// registry is never mutated.
#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    templates: HashMap<String, Arc<PluginTemplate>>,
}

impl TemplateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `.yaml`/`.yml` file in the directory as a template; the
    /// file stem becomes the plugin's type name.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut set = Self::new();

        let entries = std::fs::read_dir(dir).map_err(|e| {
            Error::Template(format!(
                "failed to read plugin directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        for entry in entries.flatten() {
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == "yaml" || e == "yml");
            if !is_yaml {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let text = std::fs::read_to_string(&path).map_err(|e| {
                Error::Template(format!("failed to read template {}: {}", path.display(), e))
            })?;
            let template = PluginTemplate::parse(stem, &text)?;
            debug!(plugin_type = stem, path = %path.display(), "loaded plugin template");
            set.insert(template);
        }

        Ok(set)
    }

    pub fn insert(&mut self, template: PluginTemplate) {
        self.templates
            .insert(template.name.clone(), Arc::new(template));
    }

    pub fn get(&self, name: &str) -> Option<&PluginTemplate> {
        self.templates.get(name).map(|t| t.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// Expand template invocations into ordinary descriptors, recursively and
/// in declaration order. Fails on recursive template references and on id
/// collisions introduced by the expansion.
pub fn expand_descriptors(
    descriptors: Vec<OperatorDescriptor>,
    templates: &TemplateSet,
) -> Result<Vec<OperatorDescriptor>> {
    if templates.is_empty() {
        return Ok(descriptors);
    }
    let mut stack = Vec::new();
    let expanded = expand_list(descriptors, templates, &mut stack)?;
    check_unique_ids(&expanded)?;
    Ok(expanded)
}

fn expand_list(
    descriptors: Vec<OperatorDescriptor>,
    templates: &TemplateSet,
    stack: &mut Vec<String>,
) -> Result<Vec<OperatorDescriptor>> {
    let mut out = Vec::with_capacity(descriptors.len());

    for descriptor in descriptors {
        let Some(template) = templates.get(&descriptor.operator_type) else {
            out.push(descriptor);
            continue;
        };

        if stack.iter().any(|n| n == &descriptor.operator_type) {
            stack.push(descriptor.operator_type.clone());
            return Err(Error::Template(format!(
                "recursive plugin template reference: {}",
                stack.join(" -> ")
            )));
        }
        stack.push(descriptor.operator_type.clone());

        let rendered = template.render(&descriptor.id, &descriptor.outputs, &descriptor.params())?;
        let document: Value = serde_yaml::from_str(&rendered).map_err(|e| {
            Error::Template(format!(
                "template '{}' rendered an invalid document: {}",
                template.name(),
                e
            ))
        })?;
        let pipeline = document
            .as_mapping()
            .and_then(|m| m.get(&Value::String("pipeline".to_string())))
            .ok_or_else(|| {
                Error::Template(format!(
                    "template '{}' rendered without a 'pipeline' block",
                    template.name()
                ))
            })?;

        let mut sub = decode_descriptors(pipeline)?;
        if sub.is_empty() {
            return Err(Error::Template(format!(
                "template '{}' rendered an empty pipeline",
                template.name()
            )));
        }
        if let Some(last) = sub.last_mut() {
            if !last.explicit_output && last.outputs.is_empty() {
                last.outputs = descriptor.outputs.clone();
            }
        }

        out.extend(expand_list(sub, templates, stack)?);
        stack.pop();
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DECORATOR: &str = "\
parameters:
  value:
    type: string
    required: true
pipeline:
  - id: {{ .input }}
    type: metadata
    labels:
      decorated: {{ .value }}
    output: {{ .output }}
";

    fn params(pairs: &[(&str, Value)]) -> Mapping {
        let mut mapping = Mapping::new();
        for (key, value) in pairs {
            mapping.insert(Value::String(key.to_string()), value.clone());
        }
        mapping
    }

    #[test]
    fn test_parse_and_render_decorator() {
        let template = PluginTemplate::parse("decorator", DECORATOR).unwrap();
        let rendered = template
            .render(
                "my_decorator",
                &["sink".to_string()],
                &params(&[("value", Value::String("foo".to_string()))]),
            )
            .unwrap();

        let document: Value = serde_yaml::from_str(&rendered).unwrap();
        let pipeline = document.get("pipeline").unwrap();
        let descs = decode_descriptors(pipeline).unwrap();

        assert_eq!(descs.len(), 1);
        assert_eq!(descs[0].id, "my_decorator");
        assert_eq!(descs[0].operator_type, "metadata");
        assert_eq!(descs[0].outputs, vec!["sink"]);

        let labels = descs[0]
            .params()
            .get(&Value::String("labels".to_string()))
            .cloned()
            .unwrap();
        assert_eq!(
            labels.get("decorated").and_then(|v| v.as_str()),
            Some("foo")
        );
    }

    #[test]
    fn test_missing_required_parameter() {
        let template = PluginTemplate::parse("decorator", DECORATOR).unwrap();
        let err = template
            .render("d", &[], &Mapping::new())
            .unwrap_err();
        assert!(err.to_string().contains("missing required parameter"));
    }

    #[test]
    fn test_unknown_parameter_rejected() {
        let template = PluginTemplate::parse("decorator", DECORATOR).unwrap();
        let err = template
            .render(
                "d",
                &[],
                &params(&[
                    ("value", Value::String("x".to_string())),
                    ("surprise", Value::String("y".to_string())),
                ]),
            )
            .unwrap_err();
        assert!(err.to_string().contains("no parameter 'surprise'"));
    }

    #[test]
    fn test_parameter_type_checked() {
        let template = PluginTemplate::parse("decorator", DECORATOR).unwrap();
        let err = template
            .render("d", &[], &params(&[("value", Value::Bool(true))]))
            .unwrap_err();
        assert!(err.to_string().contains("must be a string"));
    }

    #[test]
    fn test_value_escaping_prevents_injection() {
        let template = PluginTemplate::parse("decorator", DECORATOR).unwrap();
        let hostile = "x\"\n  - id: injected\n    type: noop";
        let rendered = template
            .render(
                "d",
                &[],
                &params(&[("value", Value::String(hostile.to_string()))]),
            )
            .unwrap();

        let document: Value = serde_yaml::from_str(&rendered).unwrap();
        let descs = decode_descriptors(document.get("pipeline").unwrap()).unwrap();
        // Still one operator; the hostile value stayed a label string
        assert_eq!(descs.len(), 1);
        let labels = descs[0]
            .params()
            .get(&Value::String("labels".to_string()))
            .cloned()
            .unwrap();
        assert_eq!(
            labels.get("decorated").and_then(|v| v.as_str()),
            Some(hostile)
        );
    }

    #[test]
    fn test_marker_for_unknown_parameter_fails() {
        let text = "\
pipeline:
  - id: {{ .input }}
    type: noop
    note: {{ .mystery }}
";
        let template = PluginTemplate::parse("bad", text).unwrap();
        let err = template.render("b", &[], &Mapping::new()).unwrap_err();
        assert!(err.to_string().contains("unknown parameter 'mystery'"));
    }

    #[test]
    fn test_reserved_parameter_rejected() {
        let text = "\
parameters:
  input:
    type: string
pipeline:
  - type: noop
";
        let err = PluginTemplate::parse("bad", text).unwrap_err();
        assert!(err.to_string().contains("reserved parameter"));
    }

    #[test]
    fn test_missing_pipeline_block() {
        let err = PluginTemplate::parse("bad", "parameters: {}\n").unwrap_err();
        assert!(err.to_string().contains("no top-level 'pipeline' block"));
    }

    #[test]
    fn test_default_parameter_value() {
        let text = "\
parameters:
  level:
    type: string
    default: info
pipeline:
  - id: {{ .input }}
    type: metadata
    labels:
      level: {{ .level }}
    output: {{ .output }}
";
        let template = PluginTemplate::parse("leveler", text).unwrap();
        let rendered = template.render("l", &[], &Mapping::new()).unwrap();
        assert!(rendered.contains("\"info\""));
    }

    #[test]
    fn test_expansion_recursion_detected() {
        let a = PluginTemplate::parse(
            "tpl_a",
            "pipeline:\n  - id: {{ .input }}\n    type: tpl_b\n    output: {{ .output }}\n",
        )
        .unwrap();
        let b = PluginTemplate::parse(
            "tpl_b",
            "pipeline:\n  - id: {{ .input }}\n    type: tpl_a\n    output: {{ .output }}\n",
        )
        .unwrap();

        let mut templates = TemplateSet::new();
        templates.insert(a);
        templates.insert(b);

        let document: Value = serde_yaml::from_str("- type: tpl_a\n").unwrap();
        let descs = decode_descriptors(&document).unwrap();
        let err = expand_descriptors(descs, &templates).unwrap_err();
        assert!(err.to_string().contains("recursive plugin template"));
    }

    #[test]
    fn test_expansion_splices_in_order() {
        let template = PluginTemplate::parse("decorator", DECORATOR).unwrap();
        let mut templates = TemplateSet::new();
        templates.insert(template);

        let yaml = "\
- type: noop
  id: head
- type: decorator
  value: foo
- type: noop
  id: tail
";
        let document: Value = serde_yaml::from_str(yaml).unwrap();
        let descs = decode_descriptors(&document).unwrap();
        let expanded = expand_descriptors(descs, &templates).unwrap();

        let ids: Vec<&str> = expanded.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["head", "decorator", "tail"]);
        // Default chaining flowed through the template boundary
        assert_eq!(expanded[0].outputs, vec!["decorator"]);
        assert_eq!(expanded[1].outputs, vec!["tail"]);
        assert_eq!(expanded[1].operator_type, "metadata");
    }
}
