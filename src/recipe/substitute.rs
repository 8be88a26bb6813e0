//! Ordered textual substitution over recipe content.
//!
//! Substitutions are applied as a *list*, not a map: a later `KEY=VALUE`
//! may reference the result of an earlier one (`[A=1, B=$A]` makes `B` be
//! `1`), while a reference to a not-yet-defined key stays literal
//! (`[B=$A, A=1]` leaves `$A` in `B`'s value). Values are resolved against
//! the entries before them, then the content is rewritten in one pass so
//! substituted text is never itself re-substituted.
//!
//! After the explicit substitutions, `${{NAME:default}}` placeholders fall
//! back to their defaults; a bare `${{NAME}}` left over is a fatal parse
//! error. An unknown `$NAME` outside braces is left alone.

use crate::error::{Result, StackerError};
use regex::{Captures, Regex};
use std::collections::HashMap;
use tracing::debug;

/// Matches `${{NAME}}`, `${{NAME:default}}`, and `$NAME`.
fn placeholder_re() -> Regex {
    Regex::new(r"\$\{\{([A-Za-z0-9_]+)(?::([^\}]*))?\}\}|\$([A-Za-z0-9_]+)").expect("static regex")
}

/// Rewrite every placeholder in `content` using `values`. Placeholders with
/// no known value are handled by `fallback`, which may keep them, use their
/// default, or error out.
fn rewrite(
    content: &str,
    values: &HashMap<String, String>,
    re: &Regex,
    strict: bool,
) -> Result<String> {
    let mut err = None;
    let out = re.replace_all(content, |caps: &Captures| {
        let (key, braced) = match caps.get(1) {
            Some(k) => (k.as_str(), true),
            None => (caps.get(3).expect("alternation").as_str(), false),
        };

        if let Some(value) = values.get(key) {
            return value.clone();
        }

        if braced {
            if let Some(default) = caps.get(2) {
                return default.as_str().to_string();
            }
            if strict {
                err.get_or_insert_with(|| StackerError::SubstitutionUnresolved {
                    variable: key.to_string(),
                });
            }
        }

        // no value: keep the original text
        caps.get(0).expect("group 0").as_str().to_string()
    });

    match err {
        Some(e) => Err(e),
        None => Ok(out.into_owned()),
    }
}

/// Apply `KEY=VALUE` substitutions to `content`, in order. Both `$KEY` and
/// `${{KEY}}`/`${{KEY:default}}` spellings are replaced.
pub fn substitute(content: &str, substitutions: &[String]) -> Result<String> {
    let re = placeholder_re();
    let mut values: HashMap<String, String> = HashMap::new();

    for subst in substitutions {
        let Some((key, value)) = subst.split_once('=') else {
            return Err(StackerError::RecipeSyntax {
                path: subst.clone(),
                reason: "invalid substitution, expected KEY=VALUE".to_string(),
            });
        };

        // the value may reference keys defined before it
        let resolved = rewrite(value, &values, &re, false)?;
        debug!(key, value = %resolved, "substituting");
        values.insert(key.to_string(), resolved);
    }

    rewrite(content, &values, &re, true)
}
