//! Static content model and the precomputed class → domain table
//!
//! Every class either declares its owning storage domain or inherits it from
//! the class it extends. The table is built once at startup and never changes,
//! so lookups on the hot path are a single hash lookup.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::{RatingError, Result};

use super::DOMAIN_RATING_REACTION;

/// Built-in content model shipped with the service
const BUILTIN_MODEL: &str = include_str!("../../config/content-model.json");

/// Semantic model version of a workspace
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ModelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ModelVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }
}

impl fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for ModelVersion {
    type Err = RatingError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(RatingError::Config(format!("Invalid model version: {}", s)));
        }
        let parse = |p: &str| {
            p.parse::<u32>()
                .map_err(|_| RatingError::Config(format!("Invalid model version: {}", s)))
        };
        Ok(Self::new(parse(parts[0])?, parse(parts[1])?, parse(parts[2])?))
    }
}

/// One class of the content model
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ClassDef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// Content model: class hierarchy plus domain classification
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ContentModel {
    pub version: ModelVersion,
    pub classes: Vec<ClassDef>,
    /// Domains whose documents count as user activity
    pub rating_domains: Vec<String>,
    /// Domains whose raw records never reach the calculator
    #[serde(default)]
    pub ignored_domains: Vec<String>,
}

impl ContentModel {
    /// Model compiled into the binary
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_MODEL)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| RatingError::Config(format!("Invalid content model: {}", e)))
    }

    /// Load from a file, or the built-in model when no path is given
    pub fn load(path: Option<&str>) -> Result<Self> {
        match path {
            Some(path) => {
                let json = std::fs::read_to_string(path).map_err(|e| {
                    RatingError::Config(format!("Failed to read content model {}: {}", path, e))
                })?;
                Self::from_json(&json)
            }
            None => Self::builtin(),
        }
    }
}

/// Immutable class → domain table with tracked and ignored classification
#[derive(Debug, Clone)]
pub struct DomainIndex {
    version: ModelVersion,
    domains: HashMap<String, String>,
    tracked: HashSet<String>,
    ignored: HashSet<String>,
}

impl DomainIndex {
    /// Resolve the owning domain of every class by walking its ancestor chain
    pub fn build(model: &ContentModel) -> Result<Self> {
        let defs: HashMap<&str, &ClassDef> =
            model.classes.iter().map(|c| (c.id.as_str(), c)).collect();
        let mut domains: HashMap<String, String> = HashMap::new();

        for class in &model.classes {
            if domains.contains_key(&class.id) {
                continue;
            }

            // Walk up until a class with a known or declared domain is found
            let mut chain: Vec<&str> = Vec::new();
            let mut seen: HashSet<&str> = HashSet::new();
            let mut current = Some(class.id.as_str());
            let mut found: Option<String> = None;

            while let Some(id) = current {
                if let Some(domain) = domains.get(id) {
                    found = Some(domain.clone());
                    break;
                }
                if !seen.insert(id) {
                    return Err(RatingError::Config(format!(
                        "Cycle in class hierarchy at {}",
                        id
                    )));
                }
                chain.push(id);

                let def = defs.get(id);
                if let Some(domain) = def.and_then(|d| d.domain.as_ref()) {
                    found = Some(domain.clone());
                    break;
                }
                current = def.and_then(|d| d.extends.as_deref());
            }

            // Classes without any domain up the chain are left out
            if let Some(domain) = found {
                for id in chain {
                    domains.insert(id.to_string(), domain.clone());
                }
            }
        }

        Ok(Self {
            version: model.version,
            domains,
            tracked: model.rating_domains.iter().cloned().collect(),
            ignored: model.ignored_domains.iter().cloned().collect(),
        })
    }

    pub fn version(&self) -> ModelVersion {
        self.version
    }

    pub fn domain_of(&self, class: &str) -> Option<&str> {
        self.domains.get(class).map(|d| d.as_str())
    }

    /// Class belongs to a rating domain or is a reaction
    pub fn is_tracked(&self, class: &str) -> bool {
        match self.domain_of(class) {
            Some(domain) => self.tracked.contains(domain) || domain == DOMAIN_RATING_REACTION,
            None => false,
        }
    }

    pub fn is_reaction(&self, class: &str) -> bool {
        self.domain_of(class) == Some(DOMAIN_RATING_REACTION)
    }

    /// Class belongs to a domain whose records are dropped at ingestion
    pub fn is_ignored(&self, class: &str) -> bool {
        self.domain_of(class)
            .map(|d| self.ignored.contains(d))
            .unwrap_or(false)
    }

    pub fn class_count(&self) -> usize {
        self.domains.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(json: &str) -> ContentModel {
        ContentModel::from_json(json).unwrap()
    }

    #[test]
    fn test_builtin_model_loads() {
        let model = ContentModel::builtin().unwrap();
        let index = DomainIndex::build(&model).unwrap();

        assert!(index.is_tracked("tracker:class:Issue"));
        assert_eq!(index.domain_of("tracker:class:Issue"), Some("task"));
        assert!(index.is_reaction("rating:class:DocReaction"));
        assert!(index.is_tracked("rating:class:DocReaction"));
        assert!(!index.is_tracked("contact:class:Person"));
        assert!(index.is_ignored("core:class:Tx"));
        assert!(!index.is_ignored("tracker:class:Issue"));
    }

    #[test]
    fn test_inherited_domain() {
        let index = DomainIndex::build(&model(
            r#"{
                "version": {"major": 1, "minor": 0, "patch": 0},
                "classes": [
                    {"id": "c", "extends": "b"},
                    {"id": "b", "extends": "a"},
                    {"id": "a", "domain": "task"},
                    {"id": "orphan"}
                ],
                "ratingDomains": ["task"]
            }"#,
        ))
        .unwrap();

        assert_eq!(index.domain_of("c"), Some("task"));
        assert_eq!(index.domain_of("b"), Some("task"));
        assert_eq!(index.domain_of("orphan"), None);
        assert!(!index.is_tracked("orphan"));
        assert!(!index.is_tracked("unknown"));
    }

    #[test]
    fn test_cycle_rejected() {
        let result = DomainIndex::build(&model(
            r#"{
                "version": {"major": 1, "minor": 0, "patch": 0},
                "classes": [
                    {"id": "a", "extends": "b"},
                    {"id": "b", "extends": "a"}
                ],
                "ratingDomains": []
            }"#,
        ));
        assert!(matches!(result, Err(RatingError::Config(_))));
    }

    #[test]
    fn test_version_parse() {
        let v: ModelVersion = "0.7.12".parse().unwrap();
        assert_eq!(v, ModelVersion::new(0, 7, 12));
        assert_eq!(v.to_string(), "0.7.12");
        assert!("0.7".parse::<ModelVersion>().is_err());
        assert!("a.b.c".parse::<ModelVersion>().is_err());
    }
}
