//! User scripts and `{{NAME}}` placeholder rendering.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::bridge::protocol::BOOTSTRAP_END;
use crate::error::ConfigError;

/// Script text sent to the peer after the framework bootstrap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script {
    text: String,
    path: Option<PathBuf>,
}

impl Script {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            path: None,
        }
    }

    /// Load a script from disk, substituting `{{NAME}}` placeholders from
    /// `vars` when given. Without `vars` the text is used verbatim.
    pub fn from_file(
        path: impl AsRef<Path>,
        vars: Option<&HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadScript {
            path: path.to_path_buf(),
            source,
        })?;

        let text = match vars {
            Some(vars) => render_template(&raw, |name| vars.get(name).cloned())?,
            None => raw,
        };

        tracing::debug!(path = %path.display(), bytes = text.len(), "Loaded script");
        Ok(Self {
            text,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The script must not contain the line that ends the bootstrap.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_no_marker(&self.text)
    }
}

pub(crate) fn check_no_marker(text: &str) -> Result<(), ConfigError> {
    if text
        .lines()
        .any(|line| line.trim_end_matches('\r') == BOOTSTRAP_END)
    {
        return Err(ConfigError::ReservedMarker);
    }
    Ok(())
}

/// Replace every `{{NAME}}` in `text` using `lookup`.
///
/// `NAME` must be `[A-Za-z_][A-Za-z0-9_]*`; anything else between braces is
/// copied through untouched. A name `lookup` does not know is an error.
pub fn render_template<F>(text: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        if let Some(end) = after.find("}}")
            && is_identifier(&after[..end])
        {
            let name = &after[..end];
            let value = lookup(name).ok_or_else(|| ConfigError::UnresolvedPlaceholder {
                name: name.to_string(),
            })?;
            out.push_str(&value);
            rest = &after[end + 2..];
        } else {
            out.push('{');
            rest = &rest[start + 1..];
        }
    }
    out.push_str(rest);
    Ok(out)
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
