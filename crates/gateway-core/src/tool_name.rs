//! Three-segment namespaced tool names.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Separator between the backend, instance and tool segments.
pub const SEPARATOR: &str = "__";

/// Why a tool name was rejected.
///
/// Messages are stable: clients match on them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolNameError {
    /// The input was the empty string.
    #[error("tool name is empty")]
    Empty,

    /// No separator at all.
    #[error("tool name '{0}' has no namespace: expected {{backendId}}__{{instanceName}}__{{toolName}}")]
    SingleSegment(String),

    /// Exactly one separator.
    #[error("tool name '{0}' is missing a segment: expected 3 segments, found 2")]
    TwoSegments(String),

    /// More than two separators.
    #[error("tool name '{name}' has too many segments: expected 3, found {found}")]
    TooManySegments {
        /// The rejected name.
        name: String,
        /// Number of segments found.
        found: usize,
    },

    /// One of the three segments is empty.
    #[error("tool name '{name}' has an empty {segment} segment")]
    EmptySegment {
        /// The rejected name.
        name: String,
        /// Which segment (`backend`, `instance` or `tool`).
        segment: &'static str,
    },

    /// A segment would not survive a format/parse round trip.
    #[error("{segment} segment '{value}' cannot be namespaced: it contains '__' or ends with '_'")]
    AmbiguousSegment {
        /// Which segment.
        segment: &'static str,
        /// The offending value.
        value: String,
    },
}

const SEGMENT_NAMES: [&str; 3] = ["backend", "instance", "tool"];

/// A validated `{backendId}__{instanceName}__{toolName}` identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NamespacedToolName {
    backend_id: String,
    instance_name: String,
    tool_name: String,
}

impl NamespacedToolName {
    /// Build a name from its parts.
    ///
    /// Rejects empty segments, segments containing the separator, and backend
    /// or instance segments ending in `_` (those would re-parse differently).
    pub fn new(
        backend_id: impl Into<String>,
        instance_name: impl Into<String>,
        tool_name: impl Into<String>,
    ) -> Result<Self, ToolNameError> {
        let parts = [backend_id.into(), instance_name.into(), tool_name.into()];

        for (idx, part) in parts.iter().enumerate() {
            let segment = SEGMENT_NAMES[idx];
            if part.is_empty() {
                return Err(ToolNameError::EmptySegment {
                    name: parts.join(SEPARATOR),
                    segment,
                });
            }
            let trailing_underscore = idx < 2 && part.ends_with('_');
            if part.contains(SEPARATOR) || trailing_underscore {
                return Err(ToolNameError::AmbiguousSegment {
                    segment,
                    value: part.clone(),
                });
            }
        }

        let [backend_id, instance_name, tool_name] = parts;
        Ok(Self {
            backend_id,
            instance_name,
            tool_name,
        })
    }

    /// Parse a namespaced tool name. Strict: exactly three non-empty segments.
    pub fn parse(name: &str) -> Result<Self, ToolNameError> {
        if name.is_empty() {
            return Err(ToolNameError::Empty);
        }

        let parts: Vec<&str> = name.split(SEPARATOR).collect();
        match parts.len() {
            1 => return Err(ToolNameError::SingleSegment(name.to_string())),
            2 => return Err(ToolNameError::TwoSegments(name.to_string())),
            3 => {}
            found => {
                return Err(ToolNameError::TooManySegments {
                    name: name.to_string(),
                    found,
                });
            }
        }

        if let Some(idx) = parts.iter().position(|p| p.is_empty()) {
            return Err(ToolNameError::EmptySegment {
                name: name.to_string(),
                segment: SEGMENT_NAMES[idx],
            });
        }

        Ok(Self {
            backend_id: parts[0].to_string(),
            instance_name: parts[1].to_string(),
            tool_name: parts[2].to_string(),
        })
    }

    /// Backend server id.
    #[must_use]
    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    /// Server instance name.
    #[must_use]
    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// Raw tool name as known by the backend.
    #[must_use]
    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    /// Same backend and instance, different tool.
    pub fn with_tool(&self, tool_name: impl Into<String>) -> Result<Self, ToolNameError> {
        Self::new(
            self.backend_id.clone(),
            self.instance_name.clone(),
            tool_name,
        )
    }
}

impl fmt::Display for NamespacedToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            self.backend_id, self.instance_name, self.tool_name
        )
    }
}

impl FromStr for NamespacedToolName {
    type Err = ToolNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for NamespacedToolName {
    type Error = ToolNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<NamespacedToolName> for String {
    fn from(value: NamespacedToolName) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_three_segments() {
        let name = NamespacedToolName::parse("srv1__inst1__echo").unwrap();
        assert_eq!(name.backend_id(), "srv1");
        assert_eq!(name.instance_name(), "inst1");
        assert_eq!(name.tool_name(), "echo");
    }

    #[test]
    fn format_of_parse_is_identity() {
        for raw in [
            "srv1__inst1__echo",
            "a__b__c",
            "github__work__create_issue",
            "x__y___leading_underscore_tool",
            "uuid-1234__default__tool.with.dots",
        ] {
            let parsed = NamespacedToolName::parse(raw).unwrap();
            assert_eq!(parsed.to_string(), raw);
        }
    }

    #[test]
    fn parse_of_format_is_identity() {
        let triples = [
            ("srv", "inst", "tool"),
            ("b-1", "i.2", "t_3"),
            ("backend", "instance", "_hidden"),
            ("backend", "instance", "ends_with_"),
        ];
        for (b, i, t) in triples {
            let name = NamespacedToolName::new(b, i, t).unwrap();
            let reparsed = NamespacedToolName::parse(&name.to_string()).unwrap();
            assert_eq!(reparsed, name);
        }
    }

    #[test]
    fn rejects_empty_string() {
        let err = NamespacedToolName::parse("").unwrap_err();
        assert_eq!(err, ToolNameError::Empty);
        assert_eq!(err.to_string(), "tool name is empty");
    }

    #[test]
    fn rejects_single_segment() {
        let err = NamespacedToolName::parse("echo").unwrap_err();
        assert_eq!(err, ToolNameError::SingleSegment("echo".to_string()));
        assert!(err.to_string().contains("has no namespace"));
    }

    #[test]
    fn rejects_two_segments() {
        let err = NamespacedToolName::parse("srv1__echo").unwrap_err();
        assert!(matches!(err, ToolNameError::TwoSegments(_)));
        assert!(err.to_string().contains("missing a segment"));
    }

    #[test]
    fn rejects_four_or_more_segments() {
        let err = NamespacedToolName::parse("a__b__c__d").unwrap_err();
        assert_eq!(
            err,
            ToolNameError::TooManySegments {
                name: "a__b__c__d".to_string(),
                found: 4
            }
        );

        let err = NamespacedToolName::parse("a__b__c__d__e").unwrap_err();
        assert!(err.to_string().contains("found 5"));
    }

    #[test]
    fn rejects_each_empty_segment_with_its_position() {
        let cases = [
            ("__inst__tool", "backend"),
            ("srv____tool", "instance"),
            ("srv__inst__", "tool"),
        ];
        for (raw, segment) in cases {
            let err = NamespacedToolName::parse(raw).unwrap_err();
            assert_eq!(
                err,
                ToolNameError::EmptySegment {
                    name: raw.to_string(),
                    segment
                },
                "input {raw}"
            );
        }
    }

    #[test]
    fn error_messages_are_distinct() {
        let inputs = ["", "a", "a__b", "a__b__c__d", "__b__c"];
        let messages: std::collections::HashSet<String> = inputs
            .iter()
            .map(|i| {
                let msg = NamespacedToolName::parse(i).unwrap_err().to_string();
                // Strip the echoed input so only the message kind is compared
                msg.replace(&format!("'{i}'"), "")
            })
            .collect();
        assert_eq!(messages.len(), inputs.len());
    }

    #[test]
    fn new_rejects_ambiguous_segments() {
        assert!(matches!(
            NamespacedToolName::new("a__b", "inst", "tool"),
            Err(ToolNameError::AmbiguousSegment { segment: "backend", .. })
        ));
        assert!(matches!(
            NamespacedToolName::new("srv", "inst_", "tool"),
            Err(ToolNameError::AmbiguousSegment { segment: "instance", .. })
        ));
        assert!(matches!(
            NamespacedToolName::new("srv", "", "tool"),
            Err(ToolNameError::EmptySegment { segment: "instance", .. })
        ));
    }

    #[test]
    fn with_tool_keeps_namespace() {
        let name = NamespacedToolName::parse("srv__inst__search_tools").unwrap();
        let real = name.with_tool("create_issue").unwrap();
        assert_eq!(real.to_string(), "srv__inst__create_issue");
    }

    #[test]
    fn serde_uses_string_form() {
        let name = NamespacedToolName::parse("srv__inst__echo").unwrap();
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"srv__inst__echo\"");

        let back: NamespacedToolName = serde_json::from_str(&json).unwrap();
        assert_eq!(back, name);

        assert!(serde_json::from_str::<NamespacedToolName>("\"srv__echo\"").is_err());
    }
}
