//! External work-management board: the GraphQL contract the gateway consumes
//! and a reqwest implementation of it.
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::columns::{BoardSchema, ColumnSpec, ColumnType};
use crate::config::Config;
use crate::board::model::{BoardNode, GraphQlResponse, IdNode, ItemNode};

pub mod model;

/// Failure of one API call, classified for the retry policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("request timed out")]
    Timeout,
    #[error("throttled by the board API: {message}")]
    Throttled {
        retry_after: Option<Duration>,
        message: String,
    },
    #[error("board API server error {status}: {message}")]
    Server { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rejected ({code}): {message}")]
    Rejected { code: String, message: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {message}")]
    AlreadyExists {
        existing_id: Option<String>,
        message: String,
    },
    #[error("cancelled before the call was issued")]
    Cancelled,
}

impl ApiError {
    /// Transient failures are retried with backoff; everything else fails
    /// the record immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ApiError::Timeout
                | ApiError::Throttled { .. }
                | ApiError::Server { .. }
                | ApiError::Transport(_)
        )
    }

    /// Server-suggested wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::Throttled { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Result of a successful item/subitem mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationAck {
    pub id: String,
    /// Board holding the entity; subitems report their own board.
    pub board_id: Option<String>,
    /// Column values echoed back by the platform, as display text.
    pub values: BTreeMap<String, Option<String>>,
}

pub type ColumnValues = Map<String, Value>;

#[async_trait]
pub trait BoardApi: Send + Sync {
    async fn create_group(&self, board_id: &str, title: &str) -> Result<String, ApiError>;

    async fn create_item(
        &self,
        board_id: &str,
        group_id: Option<&str>,
        name: &str,
        values: &ColumnValues,
    ) -> Result<MutationAck, ApiError>;

    async fn update_item(
        &self,
        board_id: &str,
        item_id: &str,
        values: &ColumnValues,
    ) -> Result<MutationAck, ApiError>;

    async fn create_subitem(
        &self,
        parent_item_id: &str,
        name: &str,
        values: &ColumnValues,
    ) -> Result<MutationAck, ApiError>;

    async fn delete_item(&self, item_id: &str) -> Result<(), ApiError>;

    async fn move_item_to_group(&self, item_id: &str, group_id: &str) -> Result<(), ApiError>;

    async fn board_schema(&self, board_id: &str) -> Result<BoardSchema, ApiError>;
}

const CREATE_GROUP: &str = "mutation ($board: ID!, $name: String!) { \
    create_group(board_id: $board, group_name: $name) { id } }";

const CREATE_ITEM: &str = "mutation ($board: ID!, $group: String, $name: String!, $values: JSON) { \
    create_item(board_id: $board, group_id: $group, item_name: $name, column_values: $values) { \
    id board { id } column_values { id text } } }";

const UPDATE_ITEM: &str = "mutation ($board: ID!, $item: ID!, $values: JSON!) { \
    change_multiple_column_values(board_id: $board, item_id: $item, column_values: $values) { \
    id board { id } column_values { id text } } }";

const CREATE_SUBITEM: &str = "mutation ($parent: ID!, $name: String!, $values: JSON) { \
    create_subitem(parent_item_id: $parent, item_name: $name, column_values: $values) { \
    id board { id } column_values { id text } } }";

const DELETE_ITEM: &str = "mutation ($item: ID!) { delete_item(item_id: $item) { id } }";

const MOVE_ITEM: &str = "mutation ($item: ID!, $group: String!) { \
    move_item_to_group(item_id: $item, group_id: $group) { id } }";

const BOARD_COLUMNS: &str = "query ($board: [ID!]) { \
    boards(ids: $board) { id columns { id title type settings_str } } }";

const TRANSIENT_CODES: &[&str] = &[
    "ComplexityException",
    "COMPLEXITY_BUDGET_EXHAUSTED",
    "RATE_LIMIT_EXCEEDED",
    "maxConcurrencyExceeded",
    "INTERNAL_SERVER_ERROR",
];

const NOT_FOUND_CODES: &[&str] = &[
    "ResourceNotFoundException",
    "InvalidItemIdException",
    "InvalidBoardIdException",
    "InvalidGroupIdException",
    "ItemNotFoundInBoard",
];

/// GraphQL implementation of [`BoardApi`].
#[derive(Clone)]
pub struct GraphQlBoardClient {
    http: Client,
    endpoint: Url,
    token: String,
    api_version: String,
}

impl fmt::Debug for GraphQlBoardClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphQlBoardClient")
            .field("endpoint", &self.endpoint)
            .field("api_version", &self.api_version)
            .finish_non_exhaustive()
    }
}

impl GraphQlBoardClient {
    pub fn new(endpoint: &str, token: String, api_version: String) -> anyhow::Result<Self> {
        let endpoint = Url::parse(endpoint).context("invalid board API URL")?;
        let http = Client::builder()
            .user_agent("board-sync/0.1")
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            endpoint,
            token,
            api_version,
        })
    }

    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        Self::new(
            &cfg.board.api_url,
            cfg.board.token.clone(),
            cfg.board.api_version.clone(),
        )
    }

    pub fn build_request(&self, query: &str, variables: Value) -> anyhow::Result<reqwest::Request> {
        self.http
            .post(self.endpoint.clone())
            .header("Authorization", &self.token)
            .header("API-Version", &self.api_version)
            .header("Content-Type", "application/json")
            .json(&json!({ "query": query, "variables": variables }))
            .build()
            .context("failed to build board API request")
    }

    async fn execute(&self, query: &str, variables: Value) -> Result<Value, ApiError> {
        let request = self
            .build_request(query, variables)
            .map_err(|e| ApiError::Rejected {
                code: "RequestBuild".into(),
                message: e.to_string(),
            })?;
        debug!(url = %request.url(), "board API request");
        let res = self.http.execute(request).await.map_err(|e| {
            if e.is_timeout() {
                ApiError::Timeout
            } else {
                ApiError::Transport(e.to_string())
            }
        })?;
        let status = res.status();
        let retry_after = res
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = res
            .text()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        debug!(%status, "board API response");
        classify_response(status, &body, retry_after)
    }
}

/// Turn an HTTP status and body into either the `data` object or a
/// classified [`ApiError`].
pub fn classify_response(
    status: StatusCode,
    body: &str,
    retry_after: Option<Duration>,
) -> Result<Value, ApiError> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        warn!("rate limited by board API: {}", body);
        return Err(ApiError::Throttled {
            retry_after,
            message: body.to_string(),
        });
    }
    if status.is_server_error() {
        return Err(ApiError::Server {
            status: status.as_u16(),
            message: body.to_string(),
        });
    }
    let parsed: GraphQlResponse = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(_) if !status.is_success() => {
            return Err(ApiError::Rejected {
                code: status.as_u16().to_string(),
                message: body.to_string(),
            })
        }
        Err(e) => return Err(ApiError::Transport(format!("invalid response JSON: {e}"))),
    };

    let first_error = parsed
        .errors
        .as_ref()
        .and_then(|errs| errs.first())
        .map(|e| {
            let ext = e.extensions.as_ref();
            (
                ext.and_then(|x| x.code.clone()).unwrap_or_default(),
                e.message.clone(),
                ext.and_then(|x| x.retry_in_seconds),
                ext.and_then(|x| x.existing_id.as_ref()).and_then(id_text),
            )
        })
        .or_else(|| {
            parsed.error_code.clone().map(|code| {
                (
                    code,
                    parsed.error_message.clone().unwrap_or_default(),
                    None,
                    None,
                )
            })
        });

    if let Some((code, message, retry_in, existing_id)) = first_error {
        let err = if TRANSIENT_CODES.contains(&code.as_str()) {
            ApiError::Throttled {
                retry_after: retry_in.map(Duration::from_secs).or(retry_after),
                message,
            }
        } else if NOT_FOUND_CODES.contains(&code.as_str()) {
            ApiError::NotFound(message)
        } else if message.to_ascii_lowercase().contains("already exists") {
            ApiError::AlreadyExists {
                existing_id,
                message,
            }
        } else {
            ApiError::Rejected { code, message }
        };
        return Err(err);
    }

    if !status.is_success() {
        return Err(ApiError::Rejected {
            code: status.as_u16().to_string(),
            message: body.to_string(),
        });
    }
    parsed
        .data
        .ok_or_else(|| ApiError::Transport("response carried no data".into()))
}

fn id_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn field<'a>(data: &'a Value, name: &str) -> Result<&'a Value, ApiError> {
    data.get(name)
        .filter(|v| !v.is_null())
        .ok_or_else(|| ApiError::Transport(format!("response missing '{name}'")))
}

fn parse_ack(data: &Value, name: &str) -> Result<MutationAck, ApiError> {
    let node: ItemNode = serde_json::from_value(field(data, name)?.clone())
        .map_err(|e| ApiError::Transport(format!("invalid '{name}' payload: {e}")))?;
    Ok(MutationAck {
        id: node.id,
        board_id: node.board.map(|b| b.id),
        values: node
            .column_values
            .into_iter()
            .map(|c| (c.id, c.text))
            .collect(),
    })
}

fn encode_values(values: &ColumnValues) -> Result<String, ApiError> {
    serde_json::to_string(values).map_err(|e| ApiError::Rejected {
        code: "Encoding".into(),
        message: e.to_string(),
    })
}

/// Convert the `boards.columns` listing into a [`BoardSchema`].
pub fn schema_from_board(board: BoardNode) -> BoardSchema {
    let columns = board
        .columns
        .into_iter()
        .map(|c| {
            let settings = c
                .settings_str
                .as_deref()
                .and_then(|s| serde_json::from_str::<Value>(s).ok());
            ColumnSpec {
                ty: ColumnType::from_api(&c.typ, settings.as_ref()),
                id: c.id,
                title: c.title,
            }
        })
        .collect();
    BoardSchema::new(board.id, columns)
}

#[async_trait]
impl BoardApi for GraphQlBoardClient {
    async fn create_group(&self, board_id: &str, title: &str) -> Result<String, ApiError> {
        let data = self
            .execute(CREATE_GROUP, json!({ "board": board_id, "name": title }))
            .await?;
        let node: IdNode = serde_json::from_value(field(&data, "create_group")?.clone())
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        Ok(node.id)
    }

    async fn create_item(
        &self,
        board_id: &str,
        group_id: Option<&str>,
        name: &str,
        values: &ColumnValues,
    ) -> Result<MutationAck, ApiError> {
        let vars = json!({
            "board": board_id,
            "group": group_id,
            "name": name,
            "values": encode_values(values)?,
        });
        let data = self.execute(CREATE_ITEM, vars).await?;
        parse_ack(&data, "create_item")
    }

    async fn update_item(
        &self,
        board_id: &str,
        item_id: &str,
        values: &ColumnValues,
    ) -> Result<MutationAck, ApiError> {
        let vars = json!({
            "board": board_id,
            "item": item_id,
            "values": encode_values(values)?,
        });
        let data = self.execute(UPDATE_ITEM, vars).await?;
        parse_ack(&data, "change_multiple_column_values")
    }

    async fn create_subitem(
        &self,
        parent_item_id: &str,
        name: &str,
        values: &ColumnValues,
    ) -> Result<MutationAck, ApiError> {
        let vars = json!({
            "parent": parent_item_id,
            "name": name,
            "values": encode_values(values)?,
        });
        let data = self.execute(CREATE_SUBITEM, vars).await?;
        parse_ack(&data, "create_subitem")
    }

    async fn delete_item(&self, item_id: &str) -> Result<(), ApiError> {
        self.execute(DELETE_ITEM, json!({ "item": item_id }))
            .await
            .map(|_| ())
    }

    async fn move_item_to_group(&self, item_id: &str, group_id: &str) -> Result<(), ApiError> {
        self.execute(MOVE_ITEM, json!({ "item": item_id, "group": group_id }))
            .await
            .map(|_| ())
    }

    async fn board_schema(&self, board_id: &str) -> Result<BoardSchema, ApiError> {
        let data = self
            .execute(BOARD_COLUMNS, json!({ "board": [board_id] }))
            .await?;
        let boards: Vec<BoardNode> = serde_json::from_value(field(&data, "boards")?.clone())
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        boards
            .into_iter()
            .next()
            .map(schema_from_board)
            .ok_or_else(|| ApiError::NotFound(format!("board {board_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_request_sets_headers_and_body() {
        let client = GraphQlBoardClient::new(
            "https://api.example.com/v2",
            "token".into(),
            "2024-10".into(),
        )
        .unwrap();
        let request = client
            .build_request(CREATE_GROUP, json!({ "board": "1", "name": "FALL-2025" }))
            .unwrap();
        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(request.url().path(), "/v2");
        let headers = request.headers();
        assert_eq!(
            headers.get("Authorization").and_then(|h| h.to_str().ok()),
            Some("token")
        );
        assert_eq!(
            headers.get("API-Version").and_then(|h| h.to_str().ok()),
            Some("2024-10")
        );
        let body: Value =
            serde_json::from_slice(request.body().and_then(|b| b.as_bytes()).unwrap()).unwrap();
        assert_eq!(body["variables"]["name"], "FALL-2025");
        assert!(body["query"].as_str().unwrap().contains("create_group"));
    }

    #[test]
    fn debug_hides_token() {
        let client =
            GraphQlBoardClient::new("https://api.example.com/v2", "secret".into(), "v".into())
                .unwrap();
        assert!(!format!("{client:?}").contains("secret"));
    }

    #[test]
    fn classify_http_throttling_and_server_errors() {
        let err = classify_response(
            StatusCode::TOO_MANY_REQUESTS,
            "slow down",
            Some(Duration::from_secs(7)),
        )
        .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));

        let err = classify_response(StatusCode::BAD_GATEWAY, "oops", None).unwrap_err();
        assert!(matches!(err, ApiError::Server { status: 502, .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn classify_graphql_error_codes() {
        let body = r#"{"errors":[{"message":"Complexity budget exhausted","extensions":{"code":"COMPLEXITY_BUDGET_EXHAUSTED","retry_in_seconds":12}}]}"#;
        let err = classify_response(StatusCode::OK, body, None).unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(12)));
        assert!(err.is_transient());

        let body = r#"{"error_code":"ResourceNotFoundException","error_message":"Item not found"}"#;
        let err = classify_response(StatusCode::OK, body, None).unwrap_err();
        assert_eq!(err, ApiError::NotFound("Item not found".into()));
        assert!(!err.is_transient());

        let body = r#"{"errors":[{"message":"Group with this name already exists"}]}"#;
        assert!(matches!(
            classify_response(StatusCode::OK, body, None),
            Err(ApiError::AlreadyExists { .. })
        ));

        let body = r#"{"errors":[{"message":"Item already exists","extensions":{"code":"ItemAlreadyExists","item_id":4411}}]}"#;
        assert_eq!(
            classify_response(StatusCode::OK, body, None).unwrap_err(),
            ApiError::AlreadyExists {
                existing_id: Some("4411".into()),
                message: "Item already exists".into(),
            }
        );

        let body = r#"{"errors":[{"message":"invalid value","extensions":{"code":"ColumnValueException"}}]}"#;
        let err = classify_response(StatusCode::OK, body, None).unwrap_err();
        assert!(matches!(err, ApiError::Rejected { ref code, .. } if code == "ColumnValueException"));
    }

    #[test]
    fn classify_success_returns_data() {
        let body = r#"{"data":{"create_item":{"id":"77","board":{"id":"1"},"column_values":[{"id":"qty","text":"3"}]}}}"#;
        let data = classify_response(StatusCode::OK, body, None).unwrap();
        let ack = parse_ack(&data, "create_item").unwrap();
        assert_eq!(ack.id, "77");
        assert_eq!(ack.board_id.as_deref(), Some("1"));
        assert_eq!(ack.values["qty"].as_deref(), Some("3"));
    }

    #[test]
    fn schema_from_board_parses_settings() {
        let board: BoardNode = serde_json::from_value(json!({
            "id": "1",
            "columns": [
                { "id": "name", "title": "Name", "type": "name", "settings_str": "{}" },
                { "id": "status", "title": "Status", "type": "status",
                  "settings_str": "{\"labels\":{\"0\":\"Open\",\"1\":\"Shipped\"}}" },
                { "id": "formula", "title": "Total", "type": "formula" }
            ]
        }))
        .unwrap();
        let schema = schema_from_board(board);
        assert_eq!(schema.columns.len(), 3);
        assert_eq!(
            schema.column("status").unwrap().ty,
            ColumnType::Status {
                labels: vec!["Open".into(), "Shipped".into()]
            }
        );
        assert!(matches!(
            schema.column("formula").unwrap().ty,
            ColumnType::ReadOnly { .. }
        ));
    }
}
