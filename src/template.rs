use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::error::Error as _;
use std::path::PathBuf;
use tera::{Context, Tera};

use crate::errors::BurnerError;

/// What to do when a template references a variable that is not defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingKeyPolicy {
    /// Rendering fails with a template error.
    #[default]
    Error,
    /// The variable renders as an empty value.
    Zero,
}

/// Variables injected into every object template render. `input_vars` come
/// from the object's config and win over the reserved names on conflict.
#[derive(Debug, Clone)]
pub struct TemplateVars {
    pub iteration: u32,
    pub replica: u32,
    pub job_name: String,
    pub uuid: String,
    pub input_vars: BTreeMap<String, serde_json::Value>,
}

impl TemplateVars {
    fn into_context(self) -> (Context, BTreeSet<String>) {
        let mut context = Context::new();
        let mut known: BTreeSet<String> = BTreeSet::new();

        for (name, value) in [
            ("Iteration", serde_json::json!(self.iteration)),
            ("Replica", serde_json::json!(self.replica)),
            ("JobName", serde_json::json!(self.job_name)),
            ("UUID", serde_json::json!(self.uuid)),
        ] {
            context.insert(name, &value);
            known.insert(name.to_string());
        }

        // object-provided vars override the reserved ones
        for (name, value) in self.input_vars {
            context.insert(name.as_str(), &value);
            known.insert(name);
        }

        (context, known)
    }
}

static TEMPLATE_VARIABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{-?\s*([A-Za-z_][A-Za-z0-9_]*)").expect("variable regex must compile"));

/// Top-level variable names referenced by a template body. Good enough for
/// the missing-key policy: nested field access resolves through the top-level
/// name, filters and literals never capture.
fn referenced_variables(template: &str) -> BTreeSet<String> {
    TEMPLATE_VARIABLE
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

/// Render a standalone object template with the given variables.
pub fn render_object_template(
    template: &str,
    vars: TemplateVars,
    policy: MissingKeyPolicy,
) -> Result<String, BurnerError> {
    TemplateStore::default().render_source("inline", template, vars, policy)
}

/// Render a template against an already-built context (alert expressions and
/// descriptions go through here).
pub fn render_with_context(template: &str, context: &Context) -> Result<String, BurnerError> {
    let mut tera = Tera::default();
    tera.add_raw_template("inline", template)
        .map_err(|e| BurnerError::Template {
            raw_error_message: describe_tera_error(&e),
        })?;

    tera.render("inline", context).map_err(|e| BurnerError::Template {
        raw_error_message: describe_tera_error(&e),
    })
}

fn describe_tera_error(e: &tera::Error) -> String {
    let detail = match &e.kind {
        tera::ErrorKind::TemplateNotFound(x) => format!("template not found: {x}"),
        tera::ErrorKind::Msg(x) => format!("tera error: {x}"),
        tera::ErrorKind::CircularExtend { tpl, inheritance_chain } => {
            format!("circular extend - template: {tpl}, inheritance chain: {inheritance_chain:?}")
        }
        tera::ErrorKind::MissingParent { current, parent } => {
            format!("missing parent - current: {current}, parent: {parent}")
        }
        tera::ErrorKind::FilterNotFound(x) => format!("filter not found: {x}"),
        tera::ErrorKind::TestNotFound(x) => format!("test not found: {x}"),
        tera::ErrorKind::InvalidMacroDefinition(x) => format!("invalid macro definition: {x}"),
        tera::ErrorKind::FunctionNotFound(x) => format!("function not found: {x}"),
        tera::ErrorKind::Json(x) => format!("json error: {x:?}"),
        tera::ErrorKind::CallFunction(x) => format!("call function: {x}"),
        tera::ErrorKind::CallFilter(x) => format!("call filter: {x}"),
        tera::ErrorKind::CallTest(x) => format!("call test: {x}"),
        tera::ErrorKind::Io(x) => format!("io error {x:?}"),
        tera::ErrorKind::Utf8Conversion { .. } => "utf-8 conversion issue".to_string(),
        _ => "unknown tera error".to_string(),
    };
    match e.source() {
        Some(source) => format!("{detail}: {source}"),
        None => detail,
    }
}

/// Template bodies are looked up by key: the embedded map first (baked-in
/// defaults), the base directory second.
#[derive(Debug, Clone, Default)]
pub struct TemplateStore {
    embedded: HashMap<String, String>,
    base_dir: Option<PathBuf>,
}

impl TemplateStore {
    pub fn new(base_dir: Option<PathBuf>) -> Self {
        TemplateStore {
            embedded: HashMap::new(),
            base_dir,
        }
    }

    pub fn with_embedded<I, K, V>(mut self, templates: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.embedded
            .extend(templates.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Render a template body against the store: every embedded template is
    /// registered alongside it, so `{% include %}` and macro imports over
    /// baked-in partials resolve.
    pub fn render_source(
        &self,
        name: &str,
        body: &str,
        vars: TemplateVars,
        policy: MissingKeyPolicy,
    ) -> Result<String, BurnerError> {
        let (mut context, known) = vars.into_context();

        if policy == MissingKeyPolicy::Zero {
            for variable in referenced_variables(body) {
                if !known.contains(&variable) {
                    context.insert(variable.as_str(), "");
                }
            }
        }

        let mut tera = Tera::default();
        for (key, source) in &self.embedded {
            if key != name {
                tera.add_raw_template(key, source).map_err(|e| BurnerError::Template {
                    raw_error_message: describe_tera_error(&e),
                })?;
            }
        }
        tera.add_raw_template(name, body)
            .map_err(|e| BurnerError::Template {
                raw_error_message: describe_tera_error(&e),
            })?;

        tera.render(name, &context).map_err(|e| BurnerError::Template {
            raw_error_message: describe_tera_error(&e),
        })
    }

    pub fn get(&self, key: &str) -> Result<String, BurnerError> {
        if let Some(body) = self.embedded.get(key) {
            return Ok(body.clone());
        }
        let path = match &self.base_dir {
            Some(dir) => dir.join(key),
            None => PathBuf::from(key),
        };
        std::fs::read_to_string(&path).map_err(|e| BurnerError::Config {
            raw_error_message: format!("cannot read object template {}: {e}", path.display()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> TemplateVars {
        TemplateVars {
            iteration: 3,
            replica: 1,
            job_name: "storm".to_string(),
            uuid: "aaaa-bbbb".to_string(),
            input_vars: BTreeMap::new(),
        }
    }

    #[test]
    fn test_reserved_variables_are_injected() {
        let rendered = render_object_template(
            "name: {{ JobName }}-{{ Iteration }}-{{ Replica }}\nuid: {{ UUID }}",
            vars(),
            MissingKeyPolicy::Error,
        )
        .unwrap();
        assert_eq!(rendered, "name: storm-3-1\nuid: aaaa-bbbb");
    }

    #[test]
    fn test_input_vars_win_over_reserved() {
        let mut v = vars();
        v.input_vars
            .insert("JobName".to_string(), serde_json::json!("override"));
        v.input_vars
            .insert("image".to_string(), serde_json::json!("nginx:1.25"));

        let rendered =
            render_object_template("{{ JobName }} {{ image }}", v, MissingKeyPolicy::Error).unwrap();
        assert_eq!(rendered, "override nginx:1.25");
    }

    #[test]
    fn test_missing_key_policy_error() {
        let err = render_object_template("{{ nope }}", vars(), MissingKeyPolicy::Error).unwrap_err();
        assert!(matches!(err, BurnerError::Template { .. }));
    }

    #[test]
    fn test_missing_key_policy_zero() {
        let rendered =
            render_object_template("image: '{{ nope }}'", vars(), MissingKeyPolicy::Zero).unwrap();
        assert_eq!(rendered, "image: ''");
    }

    #[test]
    fn test_parse_error_is_a_template_error() {
        let err = render_object_template("{{ unclosed", vars(), MissingKeyPolicy::Error).unwrap_err();
        assert!(matches!(err, BurnerError::Template { .. }));
    }

    #[test]
    fn test_referenced_variables_scan() {
        let found = referenced_variables("{{ one }} {{- two }} {{ one | default(value=3) }} {{ 'literal' }}");
        assert!(found.contains("one"));
        assert!(found.contains("two"));
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_embedded_partials_resolve_through_include() {
        let store = TemplateStore::new(None).with_embedded([
            ("labels.yml", "app: {{ JobName }}"),
            ("pod.yml", "metadata:\n  {% include \"labels.yml\" %}"),
        ]);
        let rendered = store
            .render_source("pod.yml", "metadata:\n  {% include \"labels.yml\" %}", vars(), MissingKeyPolicy::Error)
            .unwrap();
        assert_eq!(rendered, "metadata:\n  app: storm");
    }

    #[test]
    fn test_store_prefers_embedded() {
        let store = TemplateStore::new(None).with_embedded([("pod.yml", "kind: Pod")]);
        assert_eq!(store.get("pod.yml").unwrap(), "kind: Pod");
        assert!(matches!(store.get("absent.yml"), Err(BurnerError::Config { .. })));
    }
}
