use serde::Deserialize;
use serde_json::Value;

/// Envelope every GraphQL response shares. Platform-level failures come back
/// either as `errors` or as the flat `error_code`/`error_message` pair.
#[derive(Deserialize, Debug, Default)]
pub struct GraphQlResponse {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub errors: Option<Vec<GraphQlError>>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct GraphQlError {
    pub message: String,
    #[serde(default)]
    pub extensions: Option<ErrorExtensions>,
}

#[derive(Deserialize, Debug)]
pub struct ErrorExtensions {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub retry_in_seconds: Option<u64>,
    /// Id of the entity a duplicate-create collided with. Numeric or string.
    #[serde(default, alias = "item_id")]
    pub existing_id: Option<Value>,
}

#[derive(Deserialize, Debug)]
pub struct ItemNode {
    pub id: String,
    #[serde(default)]
    pub board: Option<IdNode>,
    #[serde(default)]
    pub column_values: Vec<ColumnValueNode>,
}

#[derive(Deserialize, Debug)]
pub struct IdNode {
    pub id: String,
}

#[derive(Deserialize, Debug)]
pub struct ColumnValueNode {
    pub id: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct BoardNode {
    pub id: String,
    #[serde(default)]
    pub columns: Vec<ColumnNode>,
}

#[derive(Deserialize, Debug)]
pub struct ColumnNode {
    pub id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default)]
    pub settings_str: Option<String>,
}
