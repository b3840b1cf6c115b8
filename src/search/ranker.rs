//! Relevance ranking of catalog entries against a natural-language query.
//!
//! [`HttpRanker`] asks a ranking model; [`KeywordRanker`] scores locally with
//! name/description/schema matching and synonym expansion. Synonym matches
//! score at 0.8x of a literal match.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::RankerConfig;
use crate::protocol::Tool;
use crate::{Error, Result};

/// A name with its relevance score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedTool {
    /// Raw tool name
    pub name: String,
    /// Higher is more relevant
    pub score: f64,
}

/// Orders a catalog by relevance to a query
#[async_trait]
pub trait Ranker: Send + Sync {
    /// At most `limit` names, most relevant first.
    ///
    /// Names need not exist in `catalog`: a model may return stale names.
    async fn rank(&self, query: &str, catalog: &[Tool], limit: usize) -> Result<Vec<RankedTool>>;
}

#[derive(Serialize)]
struct RankRequest<'a> {
    model: &'a str,
    query: &'a str,
    top_n: usize,
    tools: Vec<RankDocument<'a>>,
}

#[derive(Serialize)]
struct RankDocument<'a> {
    name: &'a str,
    description: &'a str,
}

#[derive(Deserialize)]
struct RankResponse {
    results: Vec<RankedTool>,
}

/// Ranking model over HTTP
pub struct HttpRanker {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpRanker {
    /// Ranker from config, `None` when no endpoint is configured
    pub fn from_config(config: &RankerConfig) -> Result<Option<Self>> {
        let Some(endpoint) = config.endpoint.clone() else {
            return Ok(None);
        };
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {e}")))?;
        Ok(Some(Self {
            http,
            endpoint,
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        }))
    }
}

#[async_trait]
impl Ranker for HttpRanker {
    async fn rank(&self, query: &str, catalog: &[Tool], limit: usize) -> Result<Vec<RankedTool>> {
        let body = RankRequest {
            model: &self.model,
            query,
            top_n: limit,
            tools: catalog
                .iter()
                .map(|t| RankDocument {
                    name: &t.name,
                    description: t.description.as_deref().unwrap_or_default(),
                })
                .collect(),
        };

        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::backend_protocol(
                "ranking-model",
                format!("Ranking model returned HTTP {}", response.status()),
            ));
        }

        let mut results = response.json::<RankResponse>().await?.results;
        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        results.truncate(limit);
        debug!(query, returned = results.len(), "Ranking model answered");
        Ok(results)
    }
}

/// Local keyword ranker
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordRanker;

const SYNONYM_MULTIPLIER: f64 = 0.8;

/// Other members of a word's synonym group (empty when none)
#[must_use]
pub fn expand_synonyms(word: &str) -> &'static [&'static str] {
    match word {
        "search" | "find" | "discover" | "locate" | "lookup" | "query" => {
            &["search", "find", "discover", "locate", "lookup", "query"]
        }
        "create" | "generate" | "make" | "build" | "add" | "new" => {
            &["create", "generate", "make", "build", "add", "new"]
        }
        "delete" | "remove" | "purge" | "clear" | "destroy" => {
            &["delete", "remove", "purge", "clear", "destroy"]
        }
        "list" | "enumerate" | "browse" | "catalog" | "index" => {
            &["list", "enumerate", "browse", "catalog", "index"]
        }
        "get" | "fetch" | "read" | "retrieve" | "load" | "pull" => {
            &["get", "fetch", "read", "retrieve", "load", "pull"]
        }
        "update" | "edit" | "modify" | "change" | "patch" => {
            &["update", "edit", "modify", "change", "patch"]
        }
        "send" | "deliver" | "publish" | "post" | "notify" => {
            &["send", "deliver", "publish", "post", "notify"]
        }
        "convert" | "transform" | "translate" | "format" | "encode" => {
            &["convert", "transform", "translate", "format", "encode"]
        }
        _ => &[],
    }
}

fn contains_with_synonyms(text: &str, word: &str) -> Option<bool> {
    if text.contains(word) {
        return Some(false);
    }
    expand_synonyms(word)
        .iter()
        .any(|syn| *syn != word && text.contains(syn))
        .then_some(true)
}

/// Lowercased property names of a tool's input schema
fn schema_fields(schema: &Value) -> Vec<String> {
    schema
        .get("properties")
        .and_then(Value::as_object)
        .map(|props| props.keys().map(|k| k.to_lowercase()).collect())
        .unwrap_or_default()
}

/// Text relevance of one tool for a lowercased query
#[allow(clippy::cast_precision_loss)]
fn score_tool(tool: &Tool, query: &str, words: &[&str]) -> f64 {
    let name = tool.name.to_lowercase();
    let desc = tool.description.as_deref().unwrap_or_default().to_lowercase();
    let name_words = name.replace(['_', '-', '.'], " ");

    if name == query || name_words == query {
        return 20.0;
    }

    if words.len() > 1 && words.iter().all(|w| name_words.contains(w)) {
        return 15.0;
    }

    let combined = format!("{name_words} {desc}");
    let mut matched = 0usize;
    let mut via_synonym = false;
    for word in words {
        if let Some(syn) = contains_with_synonyms(&combined, word) {
            matched += 1;
            via_synonym |= syn;
        }
    }

    let fields = schema_fields(&tool.input_schema);
    let field_hits = words.iter().filter(|w| fields.iter().any(|f| f == *w)).count();

    let coverage = if matched == words.len() && matched > 0 {
        10.0 + matched as f64 * 2.0
    } else if matched > 0 {
        3.0 + matched as f64 * 2.0
    } else {
        0.0
    };
    let coverage = if via_synonym {
        coverage * SYNONYM_MULTIPLIER
    } else {
        coverage
    };
    let schema = if field_hits > 0 {
        4.0 + field_hits as f64 * 2.0
    } else {
        0.0
    };

    coverage.max(schema)
}

#[async_trait]
impl Ranker for KeywordRanker {
    async fn rank(&self, query: &str, catalog: &[Tool], limit: usize) -> Result<Vec<RankedTool>> {
        let query = query.trim().to_lowercase();
        let words: Vec<&str> = query.split_whitespace().collect();
        if words.is_empty() {
            return Ok(Vec::new());
        }

        let mut ranked: Vec<RankedTool> = catalog
            .iter()
            .map(|tool| RankedTool {
                name: tool.name.clone(),
                score: score_tool(tool, &query, &words),
            })
            .filter(|r| r.score > 0.0)
            .collect();
        // Stable: equal scores keep catalog order
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked.truncate(limit);
        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn catalog() -> Vec<Tool> {
        vec![
            Tool::new("create_issue", "Open a new issue in a repository", json!({
                "type": "object",
                "properties": {"repo": {}, "title": {}}
            })),
            Tool::new("search_code", "Search source code across repositories", json!({"type": "object"})),
            Tool::new("delete_branch", "Remove a git branch", json!({"type": "object"})),
            Tool::new("get_weather", "Current conditions for a city", json!({
                "type": "object",
                "properties": {"city": {}}
            })),
        ]
    }

    async fn rank(query: &str, limit: usize) -> Vec<String> {
        KeywordRanker
            .rank(query, &catalog(), limit)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect()
    }

    #[tokio::test]
    async fn exact_name_ranks_first() {
        assert_eq!(rank("create issue", 10).await[0], "create_issue");
        assert_eq!(rank("search_code", 10).await[0], "search_code");
    }

    #[tokio::test]
    async fn synonyms_match_with_discount() {
        let ranked = KeywordRanker.rank("find code", &catalog(), 10).await.unwrap();
        assert_eq!(ranked[0].name, "search_code");

        let exact = KeywordRanker.rank("search code", &catalog(), 10).await.unwrap();
        assert!(exact[0].score > ranked[0].score);
    }

    #[tokio::test]
    async fn schema_fields_are_matched() {
        assert_eq!(rank("city", 10).await, vec!["get_weather"]);
    }

    #[tokio::test]
    async fn limit_and_empty_query() {
        assert!(rank("   ", 10).await.is_empty());
        assert_eq!(rank("a", 2).await.len(), 2);
        assert!(rank("zzzz", 10).await.is_empty());
    }
}
