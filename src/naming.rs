use std::borrow::Cow;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::FlattenConfig;

/// Characters that cannot appear in a field or table name.
static PATH_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\s./\\:-]+").unwrap());

/// Built-in term→abbreviation dictionary, keyed lowercase. Caller overrides
/// are merged on top at [`NameBuilder`] construction.
static BUILTIN_ABBREVIATIONS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("account", "acct"),
        ("address", "addr"),
        ("aggregate", "agg"),
        ("amount", "amt"),
        ("attribute", "attr"),
        ("average", "avg"),
        ("balance", "bal"),
        ("category", "cat"),
        ("configuration", "config"),
        ("customer", "cust"),
        ("department", "dept"),
        ("description", "desc"),
        ("identifier", "id"),
        ("information", "info"),
        ("international", "intl"),
        ("language", "lang"),
        ("location", "loc"),
        ("management", "mgmt"),
        ("maximum", "max"),
        ("message", "msg"),
        ("minimum", "min"),
        ("number", "num"),
        ("organization", "org"),
        ("parameter", "param"),
        ("percentage", "pct"),
        ("quantity", "qty"),
        ("reference", "ref"),
        ("source", "src"),
        ("statistics", "stats"),
        ("transaction", "txn"),
    ])
});

/// Deterministic hash for collapse markers. `DefaultHasher::new()` uses fixed
/// keys, so the same input hashes the same way in every run.
fn stable_hash(value: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Builds field and table names from raw path components: sanitization,
/// deep-nesting collapse, and per-component abbreviation, all deterministic
/// for one configuration.
#[derive(Debug, Clone)]
pub struct NameBuilder {
    separator: String,
    deeply_nested_threshold: usize,
    abbreviation_enabled: bool,
    max_component_length: usize,
    preserve_leaf: bool,
    abbreviations: HashMap<String, String>,
}

impl NameBuilder {
    pub fn from_config(config: &FlattenConfig) -> Self {
        let mut abbreviations: HashMap<String, String> = BUILTIN_ABBREVIATIONS
            .iter()
            .map(|(term, abbr)| (term.to_string(), abbr.to_string()))
            .collect();
        for (term, abbr) in &config.abbreviation.overrides {
            abbreviations.insert(term.to_lowercase(), abbr.clone());
        }
        NameBuilder {
            separator: config.separator.clone(),
            deeply_nested_threshold: config.deeply_nested_threshold,
            abbreviation_enabled: config.abbreviation.enabled,
            max_component_length: config.abbreviation.max_component_length,
            preserve_leaf: config.abbreviation.preserve_leaf,
            abbreviations,
        }
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Cleans one raw key into a usable name component. Whitespace, dots,
    /// slashes, colons and hyphens become the separator; empty keys become
    /// the placeholder `field`.
    pub fn sanitize(&self, key: &str) -> String {
        let cleaned = PATH_CHARS.replace_all(key.trim(), self.separator.as_str());
        let cleaned = cleaned
            .trim_matches(|c: char| self.separator.contains(c))
            .to_string();
        if cleaned.is_empty() {
            String::from("field")
        } else {
            cleaned
        }
    }

    /// Splits a separator-joined name back into components, dropping empties.
    pub fn split_path<'a>(&self, path: &'a str) -> Vec<&'a str> {
        path.split(self.separator.as_str())
            .filter(|component| !component.is_empty())
            .collect()
    }

    /// Joins components with the configured separator.
    pub fn join_path<S: AsRef<str>>(&self, components: &[S]) -> String {
        components
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join(&self.separator)
    }

    /// Shortens one component: unchanged when within the length limit, else
    /// a dictionary hit, else hard truncation.
    pub fn abbreviate_component<'a>(&self, component: &'a str) -> Cow<'a, str> {
        if component.chars().count() <= self.max_component_length {
            return Cow::Borrowed(component);
        }
        if let Some(abbr) = self.abbreviations.get(&component.to_lowercase()) {
            return Cow::Owned(abbr.clone());
        }
        Cow::Owned(component.chars().take(self.max_component_length).collect())
    }

    /// Renders the emitted field name for a component path: over-deep paths
    /// collapse to a marker form when that is shorter than the fully
    /// expanded path, and abbreviation applies when enabled.
    pub fn field_name<S: AsRef<str>>(&self, components: &[S]) -> String {
        let components: Vec<&str> = components.iter().map(AsRef::as_ref).collect();
        self.build(&components)
    }

    /// Renders the table name for a child path under `entity`. The entity
    /// leads the name unless the path already starts with it.
    pub fn table_name<S: AsRef<str>>(&self, entity: &str, components: &[S]) -> String {
        let mut full: Vec<&str> = Vec::with_capacity(components.len() + 1);
        let leads_with_entity = components
            .first()
            .map(|c| c.as_ref() == entity)
            .unwrap_or(false);
        if !leads_with_entity {
            full.push(entity);
        }
        full.extend(components.iter().map(AsRef::as_ref));
        self.build(&full)
    }

    /// Chooses between the collapsed and expanded renderings. A collapsed
    /// name must be strictly shorter than the fully expanded path; when it
    /// is not, the expanded rendering wins and stays trivially collision
    /// free.
    fn build(&self, components: &[&str]) -> String {
        let expanded = self.join_path(components);
        if let Some(collapsed) = self.collapse(components) {
            if collapsed.chars().count() < expanded.chars().count() {
                return collapsed;
            }
        }
        if !self.abbreviation_enabled {
            return expanded;
        }
        self.render(components)
    }

    /// Builds the collapsed rendering of an over-deep path: the first
    /// component, one marker carrying a stable hash of the dropped middle,
    /// and the last component. Distinct middles yield distinct markers; the
    /// marker is exempt from abbreviation so its hash never loses width.
    /// Returns `None` for paths within the threshold.
    fn collapse(&self, components: &[&str]) -> Option<String> {
        if components.len() <= self.deeply_nested_threshold || components.len() < 3 {
            return None;
        }
        let middle = components[1..components.len() - 1].join(&self.separator);
        let marker = format!("n{:06x}", stable_hash(&middle) & 0xff_ffff);
        let first = components[0];
        let last = components[components.len() - 1];
        if !self.abbreviation_enabled {
            return Some(self.join_path(&[first, marker.as_str(), last]));
        }
        let first = self.abbreviate_component(first);
        let last = if self.preserve_leaf {
            Cow::Borrowed(last)
        } else {
            self.abbreviate_component(last)
        };
        Some(self.join_path(&[first, Cow::Owned(marker), last]))
    }

    fn render(&self, components: &[&str]) -> String {
        if !self.abbreviation_enabled {
            return self.join_path(components);
        }
        let last = components.len().saturating_sub(1);
        let shortened: Vec<Cow<'_, str>> = components
            .iter()
            .enumerate()
            .map(|(i, component)| {
                if self.preserve_leaf && i == last {
                    Cow::Borrowed(*component)
                } else {
                    self.abbreviate_component(component)
                }
            })
            .collect();
        self.join_path(&shortened)
    }
}
