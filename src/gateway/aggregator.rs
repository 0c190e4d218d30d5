//! Tool aggregation across connectors
//!
//! Every connector's listing is fetched concurrently; each listing is
//! namespaced as `<connector id>__<tool>`. A connector that fails or times
//! out contributes nothing but a warning.

use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, warn};

use crate::backend::Connector;
use crate::protocol::Tool;

/// Joins a connector id and a tool name
pub const SEPARATOR: &str = "__";

/// A backend tool under its gateway-wide name
#[derive(Debug, Clone, PartialEq)]
pub struct NamespacedTool {
    /// Name the backend knows the tool by
    pub name: String,
    /// Connector that serves it
    pub connector_id: String,
    /// `connector_id + SEPARATOR + name`
    pub namespaced_name: String,
    /// Definition as the backend advertised it
    pub definition: Tool,
}

impl NamespacedTool {
    /// Wrap a backend tool
    #[must_use]
    pub fn new(connector_id: &str, definition: Tool) -> Self {
        Self {
            name: definition.name.clone(),
            connector_id: connector_id.to_string(),
            namespaced_name: namespaced(connector_id, &definition.name),
            definition,
        }
    }

    /// Input schema
    #[must_use]
    pub fn schema(&self) -> &Value {
        &self.definition.input_schema
    }

    /// The definition as clients see it, under the namespaced name
    #[must_use]
    pub fn advertised(&self) -> Tool {
        Tool {
            name: self.namespaced_name.clone(),
            ..self.definition.clone()
        }
    }
}

/// `connector_id + SEPARATOR + tool`
#[must_use]
pub fn namespaced(connector_id: &str, tool: &str) -> String {
    format!("{connector_id}{SEPARATOR}{tool}")
}

/// Split a namespaced name at the first separator.
///
/// `None` when there is no separator or either half is empty.
#[must_use]
pub fn parse_namespace(name: &str) -> Option<(&str, &str)> {
    let (connector_id, tool) = name.split_once(SEPARATOR)?;
    if connector_id.is_empty() || tool.is_empty() {
        return None;
    }
    Some((connector_id, tool))
}

/// A connector left out of the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationWarning {
    /// Connector id
    pub connector_id: String,
    /// What went wrong
    pub message: String,
}

/// Merged catalog plus per-connector failures
#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    /// Tools in connector order, then backend order
    pub tools: Vec<NamespacedTool>,
    /// One entry per connector that contributed nothing
    pub warnings: Vec<AggregationWarning>,
}

impl Aggregation {
    /// Namespaced names, in catalog order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(|t| t.namespaced_name.as_str())
    }
}

/// Query every connector's tool listing concurrently.
///
/// Never fails: an unreachable or slow connector only adds a warning.
///
/// ```
/// # tokio_test::block_on(async {
/// use std::time::Duration;
/// use mcp_hub::gateway::get_aggregated_tools;
///
/// let aggregation = get_aggregated_tools(&[], Duration::from_secs(1)).await;
/// assert!(aggregation.tools.is_empty());
/// assert!(aggregation.warnings.is_empty());
/// # });
/// ```
pub async fn get_aggregated_tools(connectors: &[Connector], timeout: Duration) -> Aggregation {
    let listings = join_all(connectors.iter().map(|connector| async move {
        let listing =
            tokio::time::timeout(timeout, connector.backend.list_tools(timeout)).await;
        (connector, listing)
    }))
    .await;

    let mut aggregation = Aggregation::default();
    for (connector, listing) in listings {
        let message = match listing {
            Ok(Ok(listing)) => {
                debug!(connector = %connector.id, count = listing.tools.len(), "Listed tools");
                aggregation.tools.extend(
                    listing
                        .tools
                        .into_iter()
                        .map(|tool| NamespacedTool::new(&connector.id, tool)),
                );
                continue;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("tools/list timed out after {timeout:?}"),
        };
        warn!(connector = %connector.id, error = %message, "Connector left out of catalog");
        aggregation.warnings.push(AggregationWarning {
            connector_id: connector.id.clone(),
            message,
        });
    }

    aggregation
}

/// Linear lookup by id
#[must_use]
pub fn find_connector<'a>(connectors: &'a [Connector], id: &str) -> Option<&'a Connector> {
    connectors.iter().find(|c| c.id == id)
}
