//! Named filesystem roots and the attribute-tuple schemas that build
//! paths over them (spec.md §4.3).

use std::collections::HashMap;
use std::fmt;

use regex::Regex;

use crate::error::CompletionError;

/// A named, typed tuple of attribute fields with a deterministic path
/// builder and an optional reverse parser.
pub trait MetadataSchema: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Ordered attribute names recognized by `_path_list`.
    fn fields(&self) -> &[&str];

    /// The path components this schema contributes, in order, skipping
    /// attributes named in `unused`.
    fn path_list(&self, attrs: &HashMap<String, String>, unused: &[String]) -> Vec<String>;

    /// Reverse-parses a path into attribute values, or `None` if it
    /// doesn't match this schema's `path_pattern`.
    fn metadata(&self, _path: &str) -> Option<HashMap<String, String>> {
        None
    }

    /// Joins `_path_list` with `/`, relative to `base_path`.
    fn build_path(&self, base_path: &str, attrs: &HashMap<String, String>, unused: &[String]) -> String {
        let mut parts = vec![base_path.trim_end_matches('/').to_string()];
        parts.extend(self.path_list(attrs, unused));
        parts.join("/")
    }

    /// Either an absolute path (`is_path=true`) or a stringified relative
    /// form, omitting attributes named in `unused`.
    fn build_param(&self, base_path: &str, is_path: bool, attrs: &HashMap<String, String>, unused: &[String]) -> String {
        if is_path {
            self.build_path(base_path, attrs, unused)
        } else {
            self.path_list(attrs, unused).join("_")
        }
    }
}

/// `{path, schema_name}` — the user-facing dataset reference attached
/// to a parameter via field metadata.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub path: String,
    pub schema_name: String,
}

impl Dataset {
    pub fn new(path: impl Into<String>, schema_name: impl Into<String>) -> Self {
        Dataset {
            path: path.into(),
            schema_name: schema_name.into(),
        }
    }

    /// Filesystem entries matching this dataset's schema pattern,
    /// treating attributes absent from `attrs` as glob wildcards.
    pub fn find(
        &self,
        schema: &dyn MetadataSchema,
        attrs: &HashMap<String, String>,
    ) -> Result<Vec<String>, CompletionError> {
        let glob_pattern = self.glob_for(schema, attrs);
        let matcher = glob_to_regex(&glob_pattern);
        let root = std::path::Path::new(&self.path);
        let mut found = Vec::new();
        if let Ok(entries) = walk_dir(root) {
            for entry in entries {
                if matcher.is_match(&entry) {
                    found.push(entry);
                }
            }
        }
        Ok(found)
    }

    fn glob_for(&self, schema: &dyn MetadataSchema, attrs: &HashMap<String, String>) -> String {
        let mut resolved = attrs.clone();
        for field in schema.fields() {
            resolved.entry(field.to_string()).or_insert_with(|| "*".to_string());
        }
        schema.build_path(&self.path, &resolved, &[])
    }
}

fn glob_to_regex(glob: &str) -> Regex {
    let escaped = regex::escape(glob).replace(r"\*", ".*");
    Regex::new(&format!("^{escaped}$")).expect("glob-derived pattern is always valid")
}

fn walk_dir(root: &std::path::Path) -> std::io::Result<Vec<String>> {
    let mut out = Vec::new();
    if root.is_dir() {
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                out.extend(walk_dir(&path)?);
            } else if let Some(s) = path.to_str() {
                out.push(s.to_string());
            }
        }
    }
    Ok(out)
}

/// BIDS layout: `sub-<subject>/ses-<session>/<data_type>/sub-<subject>_ses-<session>[_acq-<acq>]_<suffix>.<ext>`.
#[derive(Debug, Default)]
pub struct BidsSchema;

const BIDS_FIELDS: [&str; 6] = ["folder", "subject", "session", "data_type", "acquisition", "suffix"];

impl BidsSchema {
    pub fn path_pattern() -> Regex {
        Regex::new(r"^(?P<folder>.+)/sub-(?P<subject>[^/]+)/ses-(?P<session>[^/]+)/(?P<data_type>[^/]+)/sub-(?:[^/_]+)_ses-(?:[^/_]+)(?:_acq-(?P<acquisition>[^/_]+))?_(?P<suffix>[^/]+)$")
            .expect("static BIDS pattern is valid")
    }
}

impl MetadataSchema for BidsSchema {
    fn name(&self) -> &str {
        "bids"
    }

    fn fields(&self) -> &[&str] {
        &BIDS_FIELDS
    }

    fn path_list(&self, attrs: &HashMap<String, String>, unused: &[String]) -> Vec<String> {
        let get = |k: &str| attrs.get(k).cloned().unwrap_or_default();
        let mut parts = vec![
            format!("sub-{}", get("subject")),
            format!("ses-{}", get("session")),
            get("data_type"),
        ];
        let mut filename = format!("sub-{}_ses-{}", get("subject"), get("session"));
        if !unused.iter().any(|u| u == "acquisition") {
            if let Some(acq) = attrs.get("acquisition") {
                filename.push_str(&format!("_acq-{acq}"));
            }
        }
        filename.push_str(&format!("_{}", get("suffix")));
        parts.push(filename);
        parts
    }

    fn metadata(&self, path: &str) -> Option<HashMap<String, String>> {
        let captures = Self::path_pattern().captures(path)?;
        let mut attrs = HashMap::new();
        for field in BIDS_FIELDS {
            if let Some(m) = captures.name(field) {
                attrs.insert(field.to_string(), m.as_str().to_string());
            }
        }
        Some(attrs)
    }
}

/// BrainVISA layout: `<center>/<subject>/<modality>[/<session>]/<analysis>/<prefix>_<subject>[_<suffix>].<ext>`.
/// `session` and the filename are optional: they only appear when the
/// corresponding attributes are present, so a caller that only needs a
/// directory (no `prefix` set) still gets one.
#[derive(Debug, Default)]
pub struct BrainvisaSchema;

const BRAINVISA_FIELDS: [&str; 4] = ["center", "subject", "modality", "analysis"];

impl BrainvisaSchema {
    pub fn path_pattern() -> Regex {
        Regex::new(r"^(?P<center>[^/]+)/(?P<subject>[^/]+)/(?P<modality>[^/]+)/(?P<analysis>[^/]+)/(?P<filename>[^/]+)$")
            .expect("static BrainVISA pattern is valid")
    }
}

impl MetadataSchema for BrainvisaSchema {
    fn name(&self) -> &str {
        "brainvisa"
    }

    fn fields(&self) -> &[&str] {
        &BRAINVISA_FIELDS
    }

    fn path_list(&self, attrs: &HashMap<String, String>, unused: &[String]) -> Vec<String> {
        let get = |k: &str| attrs.get(k).cloned().unwrap_or_default();
        let analysis = if unused.iter().any(|u| u == "analysis") {
            "default_analysis".to_string()
        } else {
            attrs
                .get("analysis")
                .cloned()
                .unwrap_or_else(|| "default_analysis".to_string())
        };

        let mut parts = vec![get("center"), get("subject"), get("modality")];
        if let Some(session) = attrs.get("session") {
            if !unused.iter().any(|u| u == "session") {
                parts.push(session.clone());
            }
        }
        parts.push(analysis);

        // `prefix`/`suffix` are carried through `ProcessSchema` modifiers
        // (`MetadataModification::prepend`/`append`) rather than declared
        // path attributes, so the `<prefix><subject>[_<suffix>].<ext>`
        // filename is only produced when a process schema actually set one.
        if let Some(prefix) = attrs.get("prefix") {
            let extension = attrs.get("extension").cloned().unwrap_or_else(|| "nii".to_string());
            let mut filename = format!("{prefix}_{}", get("subject"));
            if let Some(suffix) = attrs.get("suffix") {
                filename.push('_');
                filename.push_str(suffix);
            }
            filename.push('.');
            filename.push_str(&extension);
            parts.push(filename);
        }

        parts
    }

    fn metadata(&self, path: &str) -> Option<HashMap<String, String>> {
        let captures = Self::path_pattern().captures(path)?;
        let mut attrs = HashMap::new();
        for field in BRAINVISA_FIELDS {
            if let Some(m) = captures.name(field) {
                attrs.insert(field.to_string(), m.as_str().to_string());
            }
        }
        Some(attrs)
    }
}

/// A pure function rewriting attributes when crossing dataset boundaries.
pub struct SchemaMapping {
    pub source_schema: String,
    pub dest_schema: String,
    mapper: Box<dyn Fn(&HashMap<String, String>, &mut HashMap<String, String>) + Send + Sync>,
}

impl fmt::Debug for SchemaMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SchemaMapping({} -> {})", self.source_schema, self.dest_schema)
    }
}

impl SchemaMapping {
    pub fn new(
        source_schema: impl Into<String>,
        dest_schema: impl Into<String>,
        mapper: impl Fn(&HashMap<String, String>, &mut HashMap<String, String>) + Send + Sync + 'static,
    ) -> Self {
        SchemaMapping {
            source_schema: source_schema.into(),
            dest_schema: dest_schema.into(),
            mapper: Box::new(mapper),
        }
    }

    pub fn map_schemas(&self, source: &HashMap<String, String>, dest: &mut HashMap<String, String>) {
        (self.mapper)(source, dest)
    }
}
