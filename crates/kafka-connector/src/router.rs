//! Topic subscription filtering and topic-to-function routing.

use regex::Regex;
use std::sync::Arc;

use crate::config::{ConnectorConfig, RoutingMode};
use crate::error::{ConnectorError, ConnectorResult};
use crate::registry::{FunctionDescriptor, RegistrySnapshot};

/// Subscription whitelist, e.g. `faas-topics.*`.
///
/// The pattern is a regular expression anchored at the start of the topic
/// name, the same way the broker client treats a `^`-prefixed subscription.
#[derive(Debug, Clone)]
pub struct TopicWhitelist {
    pattern: String,
    regex: Regex,
}

impl TopicWhitelist {
    pub fn new(pattern: &str) -> ConnectorResult<Self> {
        let pattern = pattern.trim().trim_start_matches('^').to_owned();
        let regex = Regex::new(&format!("^(?:{pattern})")).map_err(|e| {
            ConnectorError::config(format!("invalid topic pattern {pattern:?}: {e}"))
        })?;
        Ok(Self { pattern, regex })
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.regex.is_match(topic)
    }

    /// Subscription string understood by the broker client as a regex.
    ///
    /// The pattern is grouped so the anchor covers every alternative, the
    /// same as [`Self::matches`].
    pub fn subscription(&self) -> String {
        format!("^({})", self.pattern)
    }
}

/// Resolves a topic to the functions that should receive its messages.
pub trait TopicRouter: Send + Sync + std::fmt::Debug {
    /// Returns matching functions sorted by name.
    fn route(&self, topic: &str, snapshot: &RegistrySnapshot) -> Vec<Arc<FunctionDescriptor>>;

    fn name(&self) -> &'static str;
}

/// Every known function receives every message on a whitelisted topic.
#[derive(Debug, Default, Clone, Copy)]
pub struct MatchAll;

impl TopicRouter for MatchAll {
    fn route(&self, _topic: &str, snapshot: &RegistrySnapshot) -> Vec<Arc<FunctionDescriptor>> {
        sorted(snapshot.functions().cloned().collect())
    }

    fn name(&self) -> &'static str {
        "match_all"
    }
}

/// Functions declare their topics in an annotation, e.g.
/// `topic: "faas-topics.orders,faas-topics.audit*"`.
///
/// Entries are split on the delimiter and trimmed. An entry ending in `*`
/// matches by prefix, anything else must match exactly.
#[derive(Debug, Clone)]
pub struct DeclaredTopics {
    annotation: String,
    delimiter: String,
}

impl DeclaredTopics {
    pub fn new(annotation: impl Into<String>, delimiter: impl Into<String>) -> Self {
        Self {
            annotation: annotation.into(),
            delimiter: delimiter.into(),
        }
    }

    /// Whether `function` declares a subscription covering `topic`.
    pub fn subscribes(&self, function: &FunctionDescriptor, topic: &str) -> bool {
        let Some(declared) = function.annotation(&self.annotation) else {
            return false;
        };

        declared
            .split(self.delimiter.as_str())
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .any(|entry| match entry.strip_suffix('*') {
                Some(prefix) => topic.starts_with(prefix),
                None => entry == topic,
            })
    }
}

impl TopicRouter for DeclaredTopics {
    fn route(&self, topic: &str, snapshot: &RegistrySnapshot) -> Vec<Arc<FunctionDescriptor>> {
        sorted(
            snapshot
                .functions()
                .filter(|f| self.subscribes(f, topic))
                .cloned()
                .collect(),
        )
    }

    fn name(&self) -> &'static str {
        "declared"
    }
}

fn sorted(mut functions: Vec<Arc<FunctionDescriptor>>) -> Vec<Arc<FunctionDescriptor>> {
    functions.sort_by(|a, b| a.name.cmp(&b.name));
    functions
}

/// Builds the router selected by configuration.
pub fn from_config(config: &ConnectorConfig) -> Arc<dyn TopicRouter> {
    match config.routing {
        RoutingMode::Declared => Arc::new(DeclaredTopics::new(
            config.topic_annotation.clone(),
            config.topic_delimiter.clone(),
        )),
        RoutingMode::MatchAll => Arc::new(MatchAll),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FunctionRegistry;
    use std::collections::BTreeMap;

    fn function(name: &str, topics: Option<&str>) -> FunctionDescriptor {
        let mut annotations = BTreeMap::new();
        if let Some(t) = topics {
            annotations.insert("topic".to_owned(), t.to_owned());
        }
        FunctionDescriptor::new(name, "http://gateway:8080", annotations)
    }

    fn names(functions: &[Arc<FunctionDescriptor>]) -> Vec<&str> {
        functions.iter().map(|f| f.name.as_str()).collect()
    }

    #[test]
    fn whitelist_matches_prefix_pattern() {
        let whitelist = TopicWhitelist::new("faas-topics.*").unwrap();
        assert!(whitelist.matches("faas-topics.orders"));
        assert!(whitelist.matches("faas-topics"));
        assert!(!whitelist.matches("other.topic"));
        assert!(!whitelist.matches("x-faas-topics.orders"));
        assert_eq!(whitelist.subscription(), "^(faas-topics.*)");
    }

    #[test]
    fn whitelist_accepts_anchored_pattern() {
        let whitelist = TopicWhitelist::new("^orders|payments").unwrap();
        assert!(whitelist.matches("orders.eu"));
        assert!(whitelist.matches("payments"));
        assert!(!whitelist.matches("refunds"));
        assert_eq!(whitelist.subscription(), "^(orders|payments)");
    }

    #[test]
    fn subscription_agrees_with_matcher() {
        let whitelist = TopicWhitelist::new("orders|payments").unwrap();
        let subscription = Regex::new(&whitelist.subscription()).unwrap();

        for topic in ["orders", "orders.eu", "payments", "refunds-payments", "refunds"] {
            assert_eq!(
                whitelist.matches(topic),
                subscription.is_match(topic),
                "whitelist and subscription disagree on {topic}"
            );
        }
        assert!(!whitelist.matches("refunds-payments"));
    }

    #[test]
    fn whitelist_rejects_invalid_regex() {
        assert!(TopicWhitelist::new("faas-(").is_err());
    }

    #[test]
    fn declared_topics_exact_and_prefix() {
        let router = DeclaredTopics::new("topic", ",");
        let exact = function("f1", Some("faas-topics.orders"));
        let list = function("f2", Some(" faas-topics.audit , faas-topics.orders ,"));
        let prefix = function("f3", Some("faas-topics.ord*"));
        let none = function("f4", None);

        assert!(router.subscribes(&exact, "faas-topics.orders"));
        assert!(!router.subscribes(&exact, "faas-topics.orders.v2"));
        assert!(router.subscribes(&list, "faas-topics.orders"));
        assert!(router.subscribes(&list, "faas-topics.audit"));
        assert!(router.subscribes(&prefix, "faas-topics.orders.v2"));
        assert!(!router.subscribes(&none, "faas-topics.orders"));
    }

    #[test]
    fn declared_topics_custom_delimiter() {
        let router = DeclaredTopics::new("topic", ";");
        let f = function("f1", Some("a;b"));
        assert!(router.subscribes(&f, "b"));
        assert!(!DeclaredTopics::new("topic", ",").subscribes(&f, "b"));
    }

    #[test]
    fn declared_router_filters_snapshot() {
        let registry = FunctionRegistry::new();
        let snapshot = registry.install(vec![
            function("zeta", Some("faas-topics.orders")),
            function("alpha", Some("faas-topics.orders,faas-topics.audit")),
            function("beta", Some("faas-topics.audit")),
        ]);

        let router = DeclaredTopics::new("topic", ",");
        assert_eq!(names(&router.route("faas-topics.orders", &snapshot)), vec!["alpha", "zeta"]);
        assert!(router.route("faas-topics.unknown", &snapshot).is_empty());
    }

    #[test]
    fn match_all_returns_every_function() {
        let registry = FunctionRegistry::new();
        let snapshot = registry.install(vec![function("b", None), function("a", Some("x"))]);

        assert_eq!(names(&MatchAll.route("anything", &snapshot)), vec!["a", "b"]);
    }

    #[test]
    fn router_from_config() {
        let mut config = ConnectorConfig::default();
        assert_eq!(from_config(&config).name(), "declared");
        config.routing = RoutingMode::MatchAll;
        assert_eq!(from_config(&config).name(), "match_all");
    }
}
