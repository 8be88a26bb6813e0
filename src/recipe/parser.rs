//! Two-phase recipe parsing.
//!
//! Phase one walks the YAML mapping in document order: it splits out the
//! `config` section, records the source order of the layers, and rejects any
//! key the schema doesn't know. Phase two builds the typed
//! [`LayerDefinition`]s from the same textual form, normalizing the
//! polymorphic scalar-or-list fields into canonical ordered lists.

use crate::error::{Result, StackerError};
use crate::recipe::substitute::substitute;
use crate::recipe::{
    Bind, BuildConfig, DockerishUrl, ImageSource, LayerDefinition, Recipe, RecipeSet,
};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Every key a layer definition may carry.
const LAYER_FIELDS: &[&str] = &[
    "from",
    "import",
    "run",
    "cmd",
    "entrypoint",
    "full_command",
    "build_env_passthrough",
    "build_env",
    "environment",
    "volumes",
    "labels",
    "generate_labels",
    "working_dir",
    "build_only",
    "binds",
    "apply",
    "runtime_user",
];

/// Every key a `from` section may carry.
const SOURCE_FIELDS: &[&str] = &["type", "url", "tag", "insecure"];

fn syntax(path: &str, reason: impl Into<String>) -> StackerError {
    StackerError::RecipeSyntax { path: path.to_string(), reason: reason.into() }
}

/// Parse a recipe from a local path or an HTTP(S) URL, applying the given
/// substitutions in order.
pub fn parse(recipe_path: &str, substitutions: &[String]) -> Result<Recipe> {
    let url = DockerishUrl::parse(recipe_path);

    let (raw, path, reference_directory) = if url.scheme.is_empty() {
        let abs = Path::new(recipe_path)
            .canonicalize()
            .map_err(|e| StackerError::io(recipe_path, e))?;
        let raw = std::fs::read_to_string(&abs).map_err(|e| StackerError::io(&abs, e))?;
        let reference_directory =
            abs.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("/"));
        (raw, abs.to_string_lossy().into_owned(), reference_directory)
    } else {
        let resp = reqwest::blocking::get(recipe_path)
            .and_then(|r| r.error_for_status())
            .map_err(|e| StackerError::NetworkFetch {
                url: recipe_path.to_string(),
                reason: e.to_string(),
            })?;
        let raw = resp.text().map_err(|e| StackerError::NetworkFetch {
            url: recipe_path.to_string(),
            reason: e.to_string(),
        })?;
        // recipes loaded from a URL resolve relative imports against the
        // process working directory
        let cwd = std::env::current_dir().map_err(|e| StackerError::io(".", e))?;
        (raw, recipe_path.to_string(), cwd)
    };

    let content = substitute(&raw, substitutions)?;
    parse_content(&content, &path, reference_directory)
}

fn parse_content(content: &str, path: &str, reference_directory: PathBuf) -> Result<Recipe> {
    let doc: Mapping = serde_yaml::from_str(content)
        .map_err(|e| syntax(path, format!("invalid YAML: {}", e)))?;

    let mut build_config = BuildConfig::default();
    let mut layer_order = Vec::new();
    let mut layer_values: Vec<(String, Mapping)> = Vec::new();

    // phase one: document-order walk, config split, unknown-key rejection
    for (key, value) in &doc {
        let name = key
            .as_str()
            .ok_or_else(|| syntax(path, format!("cannot use {:?} as a layer name", key)))?;

        if name == "config" {
            build_config = serde_yaml::from_value(value.clone()).map_err(|e| {
                syntax(
                    path,
                    format!(
                        "cannot interpret 'config' value (it must not contain a layer definition): {}",
                        e
                    ),
                )
            })?;
            continue;
        }

        let mapping = value
            .as_mapping()
            .ok_or_else(|| syntax(path, format!("layer {} is not a mapping", name)))?;

        for (directive, dvalue) in mapping {
            let directive = directive
                .as_str()
                .ok_or_else(|| syntax(path, format!("{}: non-string directive", name)))?;
            if !LAYER_FIELDS.contains(&directive) {
                return Err(syntax(path, format!("unknown directive {}", directive)));
            }

            if directive == "from" {
                let from = dvalue
                    .as_mapping()
                    .ok_or_else(|| syntax(path, format!("{}: from is not a mapping", name)))?;
                for (sk, _) in from {
                    let sk = sk
                        .as_str()
                        .ok_or_else(|| syntax(path, format!("{}: non-string from key", name)))?;
                    if !SOURCE_FIELDS.contains(&sk) {
                        return Err(syntax(path, format!("unknown image source directive {}", sk)));
                    }
                }
            }
        }

        layer_order.push(name.to_string());
        layer_values.push((name.to_string(), mapping.clone()));
    }

    // phase two: typed extraction with field normalization
    let mut layers = BTreeMap::new();
    for (name, mapping) in layer_values {
        let layer = parse_layer(path, &name, &mapping, &reference_directory)?;
        layers.insert(name, layer);
    }

    Ok(Recipe {
        after_substitutions: content.to_string(),
        layer_order,
        layers,
        build_config,
        path: path.to_string(),
        reference_directory,
    })
}

fn parse_layer(
    path: &str,
    name: &str,
    mapping: &Mapping,
    reference_directory: &Path,
) -> Result<LayerDefinition> {
    let get = |field: &str| mapping.get(field);

    let from_value = get("from")
        .ok_or_else(|| syntax(path, format!("{}: invalid layer: no base (from directive)", name)))?;
    let from: ImageSource = serde_yaml::from_value(from_value.clone())
        .map_err(|e| syntax(path, format!("{}: bad from: {}", name, e)))?;

    if let ImageSource::Built { tag } = &from {
        if tag.is_empty() {
            return Err(syntax(
                path,
                format!("{}: from tag cannot be empty for image type 'built'", name),
            ));
        }
    }

    let imports = string_or_list(path, name, get("import"), &|s| {
        Ok(s.split('\n').filter(|l| !l.trim().is_empty()).map(str::to_string).collect())
    })?
    .into_iter()
    .map(|imp| abs_path(&imp, reference_directory))
    .collect();

    let run = string_or_list(path, name, get("run"), &|s| Ok(vec![s.to_string()]))?;

    let cmd = opt_string_or_list(path, name, get("cmd"), &shell_words)?;
    let entrypoint = opt_string_or_list(path, name, get("entrypoint"), &shell_words)?;
    let full_command = opt_string_or_list(path, name, get("full_command"), &shell_words)?;

    let generate_labels =
        string_or_list(path, name, get("generate_labels"), &|s| Ok(vec![s.to_string()]))?;

    let binds = string_or_list(path, name, get("binds"), &|s| Ok(vec![s.to_string()]))?
        .into_iter()
        .map(|b| parse_bind(path, name, &b, reference_directory))
        .collect::<Result<Vec<_>>>()?;

    let apply = string_or_list(path, name, get("apply"), &|s| Ok(vec![s.to_string()]))?;

    Ok(LayerDefinition {
        from: Some(from),
        imports,
        run,
        cmd,
        entrypoint,
        full_command,
        build_env_passthrough: extract(path, name, get("build_env_passthrough"))?,
        build_env: extract(path, name, get("build_env"))?,
        environment: extract(path, name, get("environment"))?,
        volumes: extract(path, name, get("volumes"))?,
        labels: extract(path, name, get("labels"))?,
        generate_labels,
        working_dir: extract(path, name, get("working_dir"))?,
        runtime_user: extract(path, name, get("runtime_user"))?,
        build_only: extract::<Option<bool>>(path, name, get("build_only"))?.unwrap_or(false),
        binds,
        apply,
    })
}

fn extract<T: serde::de::DeserializeOwned + Default>(
    path: &str,
    name: &str,
    value: Option<&Value>,
) -> Result<T> {
    match value {
        None => Ok(T::default()),
        Some(v) => serde_yaml::from_value(v.clone())
            .map_err(|e| syntax(path, format!("{}: {}", name, e))),
    }
}

/// Normalize a scalar-or-list field. A missing field is the empty list; a
/// list must be a list of strings; a scalar goes through `xform` (newline
/// split, shell lexing, or single-element wrap, per field).
fn string_or_list(
    path: &str,
    name: &str,
    value: Option<&Value>,
    xform: &dyn Fn(&str) -> Result<Vec<String>>,
) -> Result<Vec<String>> {
    match value {
        None | Some(Value::Null) => Ok(vec![]),
        Some(v) => normalize_value(path, name, v, xform),
    }
}

fn opt_string_or_list(
    path: &str,
    name: &str,
    value: Option<&Value>,
    xform: &dyn Fn(&str) -> Result<Vec<String>>,
) -> Result<Option<Vec<String>>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => normalize_value(path, name, v, xform).map(Some),
    }
}

fn normalize_value(
    path: &str,
    name: &str,
    value: &Value,
    xform: &dyn Fn(&str) -> Result<Vec<String>>,
) -> Result<Vec<String>> {
    match value {
        Value::Sequence(seq) => seq
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    syntax(path, format!("{}: unknown list element type {:?}", name, item))
                })
            })
            .collect(),
        Value::String(s) => xform(s),
        other => Err(syntax(path, format!("{}: unknown directive type {:?}", name, other))),
    }
}

fn shell_words(s: &str) -> Result<Vec<String>> {
    shlex::split(s)
        .ok_or_else(|| StackerError::RecipeSyntax {
            path: s.to_string(),
            reason: "unbalanced quoting".to_string(),
        })
}

/// Resolve a possibly-relative import or bind source. URLs and
/// `stacker://` references pass through untouched.
fn abs_path(p: &str, reference_directory: &Path) -> String {
    let parsed = DockerishUrl::parse(p);
    if !parsed.scheme.is_empty() || Path::new(p).is_absolute() {
        p.to_string()
    } else {
        reference_directory.join(p).to_string_lossy().into_owned()
    }
}

fn parse_bind(path: &str, name: &str, bind: &str, reference_directory: &Path) -> Result<Bind> {
    let parts: Vec<&str> = bind.split("->").collect();
    if parts.len() > 2 {
        return Err(syntax(path, format!("{}: invalid bind mount {}", name, bind)));
    }

    let source = parts[0].trim();
    let target = parts.get(1).map(|t| t.trim()).unwrap_or(source);

    Ok(Bind {
        source: PathBuf::from(abs_path(source, reference_directory)),
        target: target.to_string(),
    })
}

/// Read multiple recipes and every recipe they name as a prerequisite,
/// applying the same substitutions throughout. Keys are absolute paths, so
/// a recipe reachable twice is loaded once.
pub fn parse_set(paths: &[String], substitutions: &[String]) -> Result<RecipeSet> {
    let mut set = RecipeSet::default();
    for path in paths {
        load_into(&mut set, path, substitutions)?;
    }
    Ok(set)
}

fn load_into(set: &mut RecipeSet, path: &str, substitutions: &[String]) -> Result<()> {
    info!(path, "initializing stacker recipe");

    let recipe = parse(path, substitutions)?;
    let key = recipe.path.clone();
    let prerequisites = recipe.prerequisites();

    if set.recipes.contains_key(&key) {
        return Ok(());
    }
    set.recipes.insert(key, recipe);

    for prereq in prerequisites {
        load_into(set, &prereq, substitutions)?;
    }

    Ok(())
}
