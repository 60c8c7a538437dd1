// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Intent descriptors (`Want`) and declared matching rules (`Skill`)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests for action, entity, uri, path regex and type matching
//!
//! A skill admits a want when the action, the entities and the uri/type pair all
//! match. Launcher resolution only looks at action and entities.

use regex::Regex;
use serde::{Deserialize, Serialize};

const SCHEME_SEPARATOR: &str = "://";
const PORT_SEPARATOR: &str = ":";
const PATH_SEPARATOR: &str = "/";
const WILDCARD: &str = "*";
const WILDCARD_TYPE: &str = "*/*";

/// Action of the want that launches a bundle's main ability.
pub const ACTION_HOME: &str = "action.system.home";
/// Entity of the want that launches a bundle's main ability.
pub const ENTITY_HOME: &str = "entity.system.home";

/// Explicit target of a want.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementName {
    /// Target bundle, empty for implicit queries.
    pub bundle_name: String,
    /// Optional module filter.
    pub module_name: String,
    /// Target ability, empty for implicit queries.
    pub ability_name: String,
}

/// Intent-like descriptor resolved against declared skills.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Want {
    /// Requested action, empty matches any declared action.
    pub action: String,
    /// Entities the target must declare.
    pub entities: Vec<String>,
    /// Target uri.
    pub uri: String,
    /// MIME type of the payload.
    pub mime_type: String,
    /// Explicit element, if any.
    pub element: ElementName,
}

impl Want {
    /// Creates an empty want.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the action.
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    /// Adds one entity.
    pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
        self.entities.push(entity.into());
        self
    }

    /// Sets the uri.
    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self
    }

    /// Sets the MIME type.
    pub fn with_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    /// Sets the explicit element.
    pub fn with_element(
        mut self,
        bundle_name: impl Into<String>,
        module_name: impl Into<String>,
        ability_name: impl Into<String>,
    ) -> Self {
        self.element = ElementName {
            bundle_name: bundle_name.into(),
            module_name: module_name.into(),
            ability_name: ability_name.into(),
        };
        self
    }

    /// True when both bundle and ability are named.
    pub fn is_explicit(&self) -> bool {
        !self.element.bundle_name.is_empty() && !self.element.ability_name.is_empty()
    }

    /// True when there is nothing to match on.
    pub fn is_blank(&self) -> bool {
        self.action.is_empty()
            && self.entities.is_empty()
            && self.uri.is_empty()
            && self.mime_type.is_empty()
    }
}

/// One uri pattern declared by a skill.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkillUri {
    /// Uri scheme, e.g. `https`.
    pub scheme: String,
    /// Host part.
    pub host: String,
    /// Port part.
    pub port: String,
    /// Exact path.
    pub path: String,
    /// Path prefix.
    pub path_start_with: String,
    /// Path pattern (`.` any char, `.*` any run).
    pub path_regex: String,
    /// MIME type pattern.
    #[serde(rename = "type")]
    pub mime_type: String,
}

/// Capability-matching rule attached to an ability or extension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Skill {
    /// Accepted actions.
    pub actions: Vec<String>,
    /// Declared entities.
    pub entities: Vec<String>,
    /// Accepted uri/type patterns.
    pub uris: Vec<SkillUri>,
}

impl Skill {
    /// Full match used by implicit queries.
    pub fn matches(&self, want: &Want) -> bool {
        if !self.match_action(&want.action) {
            log::debug!("bundlemgr: action {} does not match", want.action);
            return false;
        }
        if !self.match_entities(&want.entities) {
            log::debug!("bundlemgr: entities do not match");
            return false;
        }
        self.match_uri_and_type(&want.uri, &want.mime_type)
    }

    /// Action and entity match used by launcher queries.
    pub fn matches_launcher(&self, want: &Want) -> bool {
        self.match_action(&want.action) && self.match_entities(&want.entities)
    }

    fn match_action(&self, action: &str) -> bool {
        if self.actions.is_empty() {
            return false;
        }
        if action.is_empty() {
            return true;
        }
        self.actions.iter().any(|declared| declared == action || declared == WILDCARD)
    }

    fn match_entities(&self, wanted: &[String]) -> bool {
        wanted.iter().all(|entity| self.entities.contains(entity))
    }

    fn match_uri_and_type(&self, uri: &str, mime_type: &str) -> bool {
        if uri.is_empty() && mime_type.is_empty() {
            return self.uris.is_empty()
                || self.uris.iter().any(|u| u.scheme.is_empty() && u.mime_type.is_empty());
        }
        match (uri.is_empty(), mime_type.is_empty()) {
            (false, true) => self.uris.iter().any(|u| u.mime_type.is_empty() && match_uri(uri, u)),
            (true, false) => {
                self.uris.iter().any(|u| u.scheme.is_empty() && match_type(mime_type, &u.mime_type))
            }
            _ => self.uris.iter().any(|u| match_uri(uri, u) && match_type(mime_type, &u.mime_type)),
        }
    }
}

fn match_uri(uri: &str, pattern: &SkillUri) -> bool {
    if pattern.scheme.is_empty() {
        return uri.is_empty();
    }
    if pattern.host.is_empty() {
        return uri == pattern.scheme;
    }
    let mut base = format!("{}{}{}", pattern.scheme, SCHEME_SEPARATOR, pattern.host);
    if !pattern.port.is_empty() {
        base.push_str(PORT_SEPARATOR);
        base.push_str(&pattern.port);
    }
    if pattern.path.is_empty()
        && pattern.path_start_with.is_empty()
        && pattern.path_regex.is_empty()
    {
        return uri == base;
    }
    base.push_str(PATH_SEPARATOR);
    if !pattern.path.is_empty() && uri == format!("{base}{}", pattern.path) {
        return true;
    }
    if !pattern.path_start_with.is_empty()
        && uri.starts_with(&format!("{base}{}", pattern.path_start_with))
    {
        return true;
    }
    !pattern.path_regex.is_empty() && match_path_regex(uri, &base, &pattern.path_regex)
}

/// Matches the whole `uri` against `base` followed by the declared path expression.
fn match_path_regex(uri: &str, base: &str, path_regex: &str) -> bool {
    let anchored = format!("^{}(?:{path_regex})$", regex::escape(base));
    match Regex::new(&anchored) {
        Ok(regex) => regex.is_match(uri),
        Err(err) => {
            log::error!("bundlemgr: invalid path regex {path_regex:?}: {err}");
            false
        }
    }
}

fn match_type(wanted: &str, declared: &str) -> bool {
    if declared.is_empty() {
        return false;
    }
    if wanted == WILDCARD_TYPE || declared == WILDCARD_TYPE || wanted == declared {
        return true;
    }
    match (wanted.split_once('/'), declared.split_once('/')) {
        (Some((wanted_main, wanted_sub)), Some((declared_main, declared_sub))) => {
            wanted_main == declared_main && (declared_sub == WILDCARD || wanted_sub == WILDCARD)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view_skill() -> Skill {
        Skill {
            actions: vec!["action.view".into()],
            entities: vec!["entity.browsable".into(), "entity.default".into()],
            uris: vec![SkillUri {
                scheme: "https".into(),
                host: "example.com".into(),
                path_start_with: "docs".into(),
                ..SkillUri::default()
            }],
        }
    }

    #[test]
    fn action_rules() {
        let skill = view_skill();
        let uri = "https://example.com/docs/a";
        assert!(skill.matches(&Want::new().with_uri(uri)));
        assert!(skill.matches(&Want::new().with_action("action.view").with_uri(uri)));
        assert!(!skill.matches(&Want::new().with_action("action.edit").with_uri(uri)));

        let silent = Skill { actions: vec![], ..view_skill() };
        assert!(!silent.matches(&Want::new().with_uri(uri)));

        let wildcard = Skill { actions: vec!["*".into()], ..view_skill() };
        assert!(wildcard.matches(&Want::new().with_action("anything").with_uri(uri)));
    }

    #[test]
    fn entities_must_be_subset() {
        let skill = view_skill();
        let want = Want::new().with_action("action.view").with_uri("https://example.com/docs/x");
        assert!(skill.matches(&want.clone().with_entity("entity.default")));
        assert!(!skill.matches(&want.with_entity("entity.home")));
    }

    #[test]
    fn uri_forms() {
        let exact = SkillUri { scheme: "tel".into(), ..SkillUri::default() };
        assert!(match_uri("tel", &exact));
        assert!(!match_uri("tel:123", &exact));

        let host_only = SkillUri {
            scheme: "https".into(),
            host: "h".into(),
            port: "8080".into(),
            ..SkillUri::default()
        };
        assert!(match_uri("https://h:8080", &host_only));
        assert!(!match_uri("https://h", &host_only));

        let with_path = SkillUri {
            scheme: "https".into(),
            host: "h".into(),
            path: "a/b".into(),
            ..SkillUri::default()
        };
        assert!(match_uri("https://h/a/b", &with_path));
        assert!(!match_uri("https://h/a/bc", &with_path));

        let with_regex = SkillUri {
            scheme: "https".into(),
            host: "h".into(),
            path_regex: "img/.*.png".into(),
            ..SkillUri::default()
        };
        assert!(match_uri("https://h/img/cat.png", &with_regex));
        assert!(match_uri("https://h/img/catxpng", &with_regex));
        assert!(!match_uri("https://h/doc/cat.png", &with_regex));
        assert!(!match_uri("https://h/img/cat.png.bak", &with_regex));
    }

    #[test]
    fn path_regex_classes_and_bad_patterns() {
        let numbered = SkillUri {
            scheme: "https".into(),
            host: "h".into(),
            path_regex: "item[0-9]+".into(),
            ..SkillUri::default()
        };
        assert!(match_uri("https://h/item42", &numbered));
        assert!(!match_uri("https://h/item", &numbered));
        assert!(!match_uri("https://h/item42x", &numbered));
        assert!(!match_uri("https://hx/item42", &numbered));

        let alternation = SkillUri { path_regex: "a|b".into(), ..numbered.clone() };
        assert!(match_uri("https://h/b", &alternation));
        assert!(!match_uri("b", &alternation));

        let broken = SkillUri { path_regex: "item[".into(), ..numbered };
        assert!(!match_uri("https://h/item[", &broken));
    }

    #[test]
    fn type_wildcards() {
        assert!(match_type("image/png", "image/*"));
        assert!(match_type("image/png", "*/*"));
        assert!(match_type("*/*", "video/mp4"));
        assert!(match_type("image/*", "image/jpeg"));
        assert!(!match_type("image/png", "video/*"));
        assert!(!match_type("image/png", ""));
    }

    #[test]
    fn uri_and_type_cases() {
        let skill = Skill {
            actions: vec!["send".into()],
            entities: vec![],
            uris: vec![
                SkillUri { mime_type: "text/*".into(), ..SkillUri::default() },
                SkillUri {
                    scheme: "file".into(),
                    host: "local".into(),
                    path_start_with: "share".into(),
                    ..SkillUri::default()
                },
            ],
        };
        // type only: entry with empty scheme and matching type
        assert!(skill.matches(&Want::new().with_type("text/plain")));
        assert!(!skill.matches(&Want::new().with_type("image/png")));
        // uri only: entry with empty type and matching uri
        assert!(skill.matches(&Want::new().with_uri("file://local/share/x")));
        // both on one entry: none declares both
        let both = Want::new().with_uri("file://local/share/x").with_type("text/plain");
        assert!(!skill.matches(&both));
        // neither: needs an entry with empty scheme and type
        assert!(!skill.matches(&Want::new().with_action("send")));
        let bare = Skill { actions: vec!["send".into()], ..Skill::default() };
        assert!(bare.matches(&Want::new().with_action("send")));
        assert!(!bare.matches(&Want::new().with_action("send").with_type("text/plain")));
    }

    #[test]
    fn launcher_ignores_uri() {
        let skill = view_skill();
        let want = Want::new().with_action("action.view").with_uri("ftp://elsewhere");
        assert!(!skill.matches(&want));
        assert!(skill.matches_launcher(&want));
    }

    #[test]
    fn blank_and_explicit() {
        assert!(Want::new().is_blank());
        assert!(!Want::new().with_entity("e").is_blank());
        assert!(Want::new().with_element("b", "", "a").is_explicit());
        assert!(!Want::new().with_element("b", "m", "").is_explicit());
    }
}
