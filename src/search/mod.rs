//! Dynamic tool search: three meta-tools standing in for a large catalog

mod ranker;

pub use ranker::{HttpRanker, KeywordRanker, RankedTool, Ranker, expand_synonyms};

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

use crate::config::ToolSearchConfig;
use crate::error::rpc_codes;
use crate::protocol::{Tool, ToolsCallResult};
use crate::{Error, Result};

/// `search_tools`
pub const SEARCH_TOOLS: &str = "search_tools";
/// `describe_tools`
pub const DESCRIBE_TOOLS: &str = "describe_tools";
/// `execute_tool`
pub const EXECUTE_TOOL: &str = "execute_tool";

/// The meta-tools a search-enabled instance exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaTool {
    /// Rank the catalog against a query
    Search,
    /// Full descriptors by name
    Describe,
    /// Call a real tool
    Execute,
}

impl MetaTool {
    /// Recognize a raw tool name
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            SEARCH_TOOLS => Some(Self::Search),
            DESCRIBE_TOOLS => Some(Self::Describe),
            EXECUTE_TOOL => Some(Self::Execute),
            _ => None,
        }
    }
}

/// One `search_tools` hit
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    /// Raw tool name
    pub tool_name: String,
    /// Absent when the tool has none or the ranked name is no longer in
    /// the catalog
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ranking score
    pub relevance_score: f64,
}

/// `describe_tools` answer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeResult {
    /// Descriptors found
    pub tools: Vec<Tool>,
    /// Requested names not in the catalog
    pub not_found: Vec<String>,
}

#[derive(Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeArgs {
    tool_names: Vec<String>,
}

/// `execute_tool` arguments
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecuteRequest {
    /// Real tool name
    pub name: String,
    /// Arguments for the real tool
    #[serde(default)]
    pub arguments: Value,
}

fn parse_args<T: for<'de> Deserialize<'de>>(tool: &str, args: Value) -> Result<T> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args).map_err(|e| {
        Error::json_rpc(
            rpc_codes::INVALID_PARAMS,
            format!("Invalid arguments for {tool}: {e}"),
        )
    })
}

impl ExecuteRequest {
    /// Parse `execute_tool` arguments
    pub fn from_args(args: Value) -> Result<Self> {
        parse_args(EXECUTE_TOOL, args)
    }
}

/// Search over one backend's catalog
pub struct ToolSearch {
    ranker: Arc<dyn Ranker>,
    fallback: KeywordRanker,
    default_limit: usize,
    max_limit: usize,
}

impl ToolSearch {
    /// Search with the configured model, or keyword ranking without one
    pub fn from_config(config: &ToolSearchConfig) -> Result<Self> {
        let ranker: Arc<dyn Ranker> = match HttpRanker::from_config(&config.ranker)? {
            Some(http) => Arc::new(http),
            None => Arc::new(KeywordRanker),
        };
        Ok(Self::new(ranker, config.default_limit, config.max_limit))
    }

    /// Search with an explicit ranker
    #[must_use]
    pub fn new(ranker: Arc<dyn Ranker>, default_limit: usize, max_limit: usize) -> Self {
        Self {
            ranker,
            fallback: KeywordRanker,
            default_limit,
            max_limit,
        }
    }

    /// Descriptors of the three meta-tools
    #[must_use]
    pub fn meta_tools(&self) -> Vec<Tool> {
        vec![
            Tool::new(
                SEARCH_TOOLS,
                "Find tools relevant to a task. Returns tool names with descriptions and relevance scores.",
                json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string", "description": "What you want to do, in natural language"},
                        "limit": {
                            "type": "integer",
                            "minimum": 1,
                            "maximum": self.max_limit,
                            "default": self.default_limit
                        }
                    },
                    "required": ["query"]
                }),
            ),
            Tool::new(
                DESCRIBE_TOOLS,
                "Get full descriptions and input schemas for tools by name.",
                json!({
                    "type": "object",
                    "properties": {
                        "toolNames": {"type": "array", "items": {"type": "string"}}
                    },
                    "required": ["toolNames"]
                }),
            ),
            Tool::new(
                EXECUTE_TOOL,
                "Call a tool by name with its arguments.",
                json!({
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "arguments": {"type": "object"}
                    },
                    "required": ["name"]
                }),
            ),
        ]
    }

    /// Rank `catalog` against the query in `args`
    pub async fn search_tools(&self, args: Value, catalog: &[Tool]) -> Result<Vec<SearchHit>> {
        let args: SearchArgs = parse_args(SEARCH_TOOLS, args)?;
        let limit = args
            .limit
            .unwrap_or(self.default_limit)
            .clamp(1, self.max_limit);

        let ranked = match self.ranker.rank(&args.query, catalog, limit).await {
            Ok(ranked) => ranked,
            Err(e) => {
                warn!(error = %e, "Ranking model failed, using keyword ranking");
                self.fallback.rank(&args.query, catalog, limit).await?
            }
        };

        let descriptions: HashMap<&str, &str> = catalog
            .iter()
            .filter_map(|t| Some((t.name.as_str(), t.description.as_deref()?)))
            .collect();

        Ok(ranked
            .into_iter()
            .take(limit)
            .map(|r| SearchHit {
                description: descriptions.get(r.name.as_str()).map(ToString::to_string),
                tool_name: r.name,
                relevance_score: r.score,
            })
            .collect())
    }

    /// Full descriptors for the names in `args`
    pub fn describe_tools(&self, args: Value, catalog: &[Tool]) -> Result<DescribeResult> {
        let args: DescribeArgs = parse_args(DESCRIBE_TOOLS, args)?;
        let mut result = DescribeResult {
            tools: Vec::new(),
            not_found: Vec::new(),
        };
        for name in args.tool_names {
            match catalog.iter().find(|t| t.name == name) {
                Some(tool) => result.tools.push(tool.clone()),
                None => result.not_found.push(name),
            }
        }
        Ok(result)
    }
}

/// Wrap a meta-tool answer as a `tools/call` result
pub fn call_result<T: Serialize>(payload: &T) -> Result<Value> {
    let text = serde_json::to_string(payload)?;
    Ok(serde_json::to_value(ToolsCallResult::text(text))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    struct StaleModel;

    #[async_trait]
    impl Ranker for StaleModel {
        async fn rank(&self, _: &str, _: &[Tool], _: usize) -> Result<Vec<RankedTool>> {
            Ok(vec![
                RankedTool { name: "removed_tool".into(), score: 0.9 },
                RankedTool { name: "create_issue".into(), score: 0.7 },
            ])
        }
    }

    struct BrokenModel;

    #[async_trait]
    impl Ranker for BrokenModel {
        async fn rank(&self, _: &str, _: &[Tool], _: usize) -> Result<Vec<RankedTool>> {
            Err(Error::backend_protocol("ranking-model", "model down"))
        }
    }

    fn catalog() -> Vec<Tool> {
        vec![
            Tool::new("create_issue", "Open an issue", json!({"type": "object"})),
            Tool::new("list_issues", "List issues", json!({"type": "object"})),
        ]
    }

    #[test]
    fn exactly_three_meta_tools() {
        let search = ToolSearch::new(Arc::new(KeywordRanker), 10, 50);
        let names: Vec<_> = search.meta_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec![SEARCH_TOOLS, DESCRIBE_TOOLS, EXECUTE_TOOL]);
    }

    #[tokio::test]
    async fn stale_ranked_name_has_no_description() {
        let search = ToolSearch::new(Arc::new(StaleModel), 10, 50);
        let hits = search
            .search_tools(json!({"query": "issue"}), &catalog())
            .await
            .unwrap();
        assert_eq!(hits[0].tool_name, "removed_tool");
        assert_eq!(hits[0].description, None);
        assert_eq!(hits[1].description.as_deref(), Some("Open an issue"));

        let v = serde_json::to_value(&hits[0]).unwrap();
        assert_eq!(v["toolName"], "removed_tool");
        assert!(v.get("description").is_none());
        assert!(v.get("relevanceScore").is_some());
    }

    #[tokio::test]
    async fn undescribed_tool_omits_description() {
        let mut catalog = catalog();
        catalog[0].description = None;
        let search = ToolSearch::new(Arc::new(StaleModel), 10, 50);
        let hits = search
            .search_tools(json!({"query": "issue"}), &catalog)
            .await
            .unwrap();
        assert_eq!(hits[1].tool_name, "create_issue");
        assert_eq!(hits[1].description, None);

        let v = serde_json::to_value(&hits[1]).unwrap();
        assert_eq!(v, json!({"toolName": "create_issue", "relevanceScore": 0.7}));

        let described = search
            .describe_tools(json!({"toolNames": ["create_issue"]}), &catalog)
            .unwrap();
        let v = serde_json::to_value(&described).unwrap();
        assert!(v["tools"][0].get("description").is_none());
    }

    #[tokio::test]
    async fn limit_is_capped() {
        let search = ToolSearch::new(Arc::new(StaleModel), 10, 1);
        let hits = search
            .search_tools(json!({"query": "issue", "limit": 500}), &catalog())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn model_failure_falls_back_to_keywords() {
        let search = ToolSearch::new(Arc::new(BrokenModel), 10, 50);
        let hits = search
            .search_tools(json!({"query": "list"}), &catalog())
            .await
            .unwrap();
        assert_eq!(hits[0].tool_name, "list_issues");
    }

    #[tokio::test]
    async fn missing_query_is_invalid_params() {
        let search = ToolSearch::new(Arc::new(KeywordRanker), 10, 50);
        let err = search.search_tools(json!({}), &catalog()).await.unwrap_err();
        assert_eq!(err.to_rpc_code(), rpc_codes::INVALID_PARAMS);
    }

    #[test]
    fn describe_reports_unknown_names() {
        let search = ToolSearch::new(Arc::new(KeywordRanker), 10, 50);
        let result = search
            .describe_tools(json!({"toolNames": ["list_issues", "nope"]}), &catalog())
            .unwrap();
        assert_eq!(result.tools.len(), 1);
        assert_eq!(result.not_found, vec!["nope".to_string()]);
        let v = serde_json::to_value(&result).unwrap();
        assert_eq!(v["notFound"][0], "nope");
    }

    #[test]
    fn execute_request_parsing() {
        let req = ExecuteRequest::from_args(json!({"name": "create_issue", "arguments": {"title": "x"}})).unwrap();
        assert_eq!(req.name, "create_issue");
        assert_eq!(req.arguments["title"], "x");
        assert!(ExecuteRequest::from_args(json!({})).is_err());
    }
}
