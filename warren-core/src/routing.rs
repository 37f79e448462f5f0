//! Environment-prefixed routing keys.
//!
//! Published keys are `"{prefix}.{key}"` so several environments can share
//! one exchange. Binding keys in configuration may reference the prefix with
//! the `%{routing_key_prefix}` placeholder.

pub const PREFIX_PLACEHOLDER: &str = "%{routing_key_prefix}";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingKeyTemplate {
    prefix: Option<String>,
}

impl RoutingKeyTemplate {
    /// An empty prefix behaves as no prefix.
    pub fn new(prefix: Option<&str>) -> Self {
        Self {
            prefix: prefix.filter(|p| !p.is_empty()).map(str::to_string),
        }
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// The key a message with routing key `key` is published under.
    pub fn key_for(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}.{key}"),
            None => key.to_string(),
        }
    }

    /// Substitutes the prefix into a binding pattern. Without a prefix the
    /// placeholder expands to an empty string.
    pub fn expand(&self, pattern: &str) -> String {
        pattern.replace(PREFIX_PLACEHOLDER, self.prefix().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_keys() {
        let template = RoutingKeyTemplate::new(Some("test"));
        assert_eq!(template.key_for("k"), "test.k");
    }

    #[test]
    fn unprefixed_keys_are_untouched() {
        assert_eq!(RoutingKeyTemplate::new(None).key_for("k"), "k");
        assert_eq!(RoutingKeyTemplate::new(Some("")).key_for("k"), "k");
    }

    #[test]
    fn expands_binding_placeholders() {
        let template = RoutingKeyTemplate::new(Some("production"));
        assert_eq!(template.expand("%{routing_key_prefix}.c"), "production.c");
        assert_eq!(template.expand("plain.#"), "plain.#");
        assert_eq!(RoutingKeyTemplate::default().expand("%{routing_key_prefix}.c"), ".c");
    }
}
