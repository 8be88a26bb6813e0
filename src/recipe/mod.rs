//! Recipe model for stacker builds.
//!
//! A recipe is a YAML document mapping layer names to layer definitions,
//! plus an optional `config` section naming prerequisite recipes. Source
//! order of the layers is semantically significant and preserved here.
//!
//! Parsing lives in [`parser`], textual substitution in [`substitute`].

pub mod parser;
pub mod substitute;

pub use parser::{parse, parse_set};

use crate::error::{Result, StackerError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A URL of the loose `scheme://host/path` form the image world uses, where
/// `host` may carry a `:tag` suffix that a strict URL parser would reject as
/// a port number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DockerishUrl {
    pub scheme: String,
    pub host: String,
    pub tag: String,
    pub path: String,
}

impl DockerishUrl {
    /// Split `thing` into scheme/host/tag/path. Strings without a `://` are
    /// returned as a bare path with an empty scheme.
    pub fn parse(thing: &str) -> DockerishUrl {
        let Some((scheme, rest)) = thing.split_once("://") else {
            return DockerishUrl { path: thing.to_string(), ..Default::default() };
        };

        let mut url = DockerishUrl { scheme: scheme.to_string(), ..Default::default() };
        match rest.split_once('/') {
            Some((host, path)) => {
                url.host = host.to_string();
                url.path = format!("/{}", path);
            }
            None => url.host = rest.to_string(),
        }

        if let Some((_, tag)) = url.host.split_once(':') {
            url.tag = tag.to_string();
        }

        url
    }
}

/// Where a layer's base filesystem comes from. One variant per source kind,
/// with only the payload that kind actually uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ImageSource {
    /// An image pulled over the docker transport.
    Docker {
        url: String,
        #[serde(default)]
        insecure: bool,
    },
    /// An image in a local OCI layout, `dir:tag`.
    Oci { url: String },
    /// An image served by a zot registry.
    Zot {
        url: String,
        #[serde(default)]
        insecure: bool,
    },
    /// A tarball fetched from a URL or path.
    Tar { url: String },
    /// Another layer of this recipe set, built earlier.
    Built { tag: String },
    /// No base at all.
    Scratch,
}

impl ImageSource {
    /// Parse a transport-prefixed image string (`oci:dir:tag`,
    /// `docker://image:tag`, `zot://host/name:tag`) as used by `apply`.
    pub fn from_image_string(s: &str) -> Result<ImageSource> {
        if let Some(rest) = s.strip_prefix("oci:") {
            return Ok(ImageSource::Oci { url: rest.to_string() });
        }

        let url = DockerishUrl::parse(s);
        match url.scheme.as_str() {
            "docker" => Ok(ImageSource::Docker { url: s.to_string(), insecure: false }),
            "zot" => Ok(ImageSource::Zot { url: s.to_string(), insecure: false }),
            _ => Err(StackerError::RecipeSyntax {
                path: s.to_string(),
                reason: "unknown image source type".to_string(),
            }),
        }
    }

    /// The URL to hand the image-transport copier, when this source is
    /// copier-fetched at all.
    pub fn copier_url(&self) -> Option<String> {
        match self {
            ImageSource::Docker { url, .. } | ImageSource::Zot { url, .. } => Some(url.clone()),
            ImageSource::Oci { url } => Some(format!("oci:{}", url)),
            _ => None,
        }
    }

    /// Whether fetching this source is the external copier's job.
    pub fn is_image_transport(&self) -> bool {
        matches!(
            self,
            ImageSource::Docker { .. } | ImageSource::Oci { .. } | ImageSource::Zot { .. }
        )
    }

    /// The tag this source is stored under in the base-layer cache (or, for
    /// `built`, the name of the sibling layer).
    pub fn parse_tag(&self) -> Result<String> {
        match self {
            ImageSource::Built { tag } => Ok(tag.clone()),
            ImageSource::Docker { url, .. } | ImageSource::Zot { url, .. } => {
                let parsed = DockerishUrl::parse(url);
                if !parsed.path.is_empty() {
                    let base = parsed.path.split(':').next().unwrap_or("");
                    Ok(Path::new(base)
                        .file_name()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_default())
                } else {
                    // docker://centos:latest has no path; use the host part
                    Ok(parsed.host.split(':').next().unwrap_or("").to_string())
                }
            }
            ImageSource::Oci { url } => match url.split_once(':') {
                Some((_, tag)) => Ok(tag.to_string()),
                None => Err(StackerError::RecipeSyntax {
                    path: url.clone(),
                    reason: "bad OCI tag".to_string(),
                }),
            },
            ImageSource::Tar { .. } | ImageSource::Scratch => Err(StackerError::RecipeSyntax {
                path: String::new(),
                reason: "source kind has no tag".to_string(),
            }),
        }
    }

    /// Insecure-transport flag, false for kinds that have none.
    pub fn insecure(&self) -> bool {
        match self {
            ImageSource::Docker { insecure, .. } | ImageSource::Zot { insecure, .. } => *insecure,
            _ => false,
        }
    }
}

/// A bind mount active while the layer's run commands execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bind {
    /// Absolute host path.
    pub source: PathBuf,
    /// Target path inside the container.
    pub target: String,
}

/// A single layer of a recipe, fully normalized: every polymorphic YAML
/// field (scalar vs list vs block literal) has been canonicalized into an
/// ordered list at parse time, and relative paths have been resolved against
/// the recipe's reference directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerDefinition {
    /// Base image for this layer.
    pub from: Option<ImageSource>,
    /// Files/URLs staged under `/stacker` during the build.
    #[serde(default)]
    pub imports: Vec<String>,
    /// Shell command lines run inside the container.
    #[serde(default)]
    pub run: Vec<String>,
    /// Image config `Cmd`. `None` leaves the base's value alone.
    pub cmd: Option<Vec<String>>,
    /// Image config `Entrypoint`. `None` leaves the base's value alone.
    pub entrypoint: Option<Vec<String>>,
    /// Sets `Entrypoint` and clears `Cmd`.
    pub full_command: Option<Vec<String>>,
    /// Regexes selecting host environment variables visible to `run`.
    #[serde(default)]
    pub build_env_passthrough: Vec<String>,
    /// Environment injected into the build container only.
    #[serde(default)]
    pub build_env: BTreeMap<String, String>,
    /// Environment recorded in the output image config.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Volumes merged into the output image config.
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Labels merged into the output image config.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Script whose `/oci-labels` output files become labels.
    #[serde(default)]
    pub generate_labels: Vec<String>,
    /// Image config working directory.
    pub working_dir: Option<String>,
    /// Image config user.
    pub runtime_user: Option<String>,
    /// Intermediate layer: consumed by later layers, never emitted.
    #[serde(default)]
    pub build_only: bool,
    /// Host directories bind-mounted during the build. Layers with binds are
    /// never cached.
    #[serde(default)]
    pub binds: Vec<Bind>,
    /// Foreign images whose layers are merged on top of the base.
    #[serde(default)]
    pub apply: Vec<String>,
}

impl LayerDefinition {
    /// The base source; parse guarantees presence, but keep lookups fallible
    /// for callers holding cache snapshots.
    pub fn from_source(&self) -> Result<&ImageSource> {
        self.from.as_ref().ok_or_else(|| StackerError::RecipeSyntax {
            path: String::new(),
            reason: "invalid layer: no base (from directive)".to_string(),
        })
    }
}

/// Build configuration carried in the recipe's `config` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    #[serde(default)]
    pub prerequisites: Vec<String>,
}

/// A parsed recipe: layer definitions in source order plus build config.
#[derive(Debug, Clone)]
pub struct Recipe {
    /// The recipe text after substitution, i.e. what was actually parsed.
    /// Embedded as an annotation when no VCS version is derivable.
    pub after_substitutions: String,
    /// Layer names in source order.
    pub layer_order: Vec<String>,
    /// Layer definitions by name.
    pub layers: BTreeMap<String, LayerDefinition>,
    /// The `config` section.
    pub build_config: BuildConfig,
    /// Absolute path of the recipe file (or the URL it came from).
    pub path: String,
    /// Directory relative paths in the recipe resolve against.
    pub reference_directory: PathBuf,
}

impl Recipe {
    pub fn get(&self, name: &str) -> Option<&LayerDefinition> {
        self.layers.get(name)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Absolute paths of the recipe's prerequisite recipes.
    pub fn prerequisites(&self) -> Vec<String> {
        self.build_config
            .prerequisites
            .iter()
            .map(|p| {
                let parsed = DockerishUrl::parse(p);
                if !parsed.scheme.is_empty() || Path::new(p).is_absolute() {
                    p.clone()
                } else {
                    self.reference_directory.join(p).to_string_lossy().into_owned()
                }
            })
            .collect()
    }
}

/// A set of recipes loaded together, keyed by absolute path. Prerequisites
/// are members of the set alongside the recipes that named them.
#[derive(Debug, Clone, Default)]
pub struct RecipeSet {
    pub recipes: BTreeMap<String, Recipe>,
}

impl RecipeSet {
    /// Search every member recipe for a layer definition.
    pub fn lookup_layer_definition(&self, name: &str) -> Option<&LayerDefinition> {
        self.recipes.values().find_map(|recipe| recipe.get(name))
    }
}
