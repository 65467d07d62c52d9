//! Apollo config service wire models

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Entry of the `/notifications/v2` request and response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApolloConfigNotification {
    pub namespace_name: String,
    /// Monotonically increasing per namespace; `-1` asks for the current id
    pub notification_id: i64,
}

impl ApolloConfigNotification {
    pub fn new(namespace_name: impl Into<String>, notification_id: i64) -> Self {
        Self {
            namespace_name: namespace_name.into(),
            notification_id,
        }
    }
}

/// Response of `/configs/{appId}/{cluster}/{namespace}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApolloConfig {
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub namespace_name: String,
    #[serde(default)]
    pub configurations: HashMap<String, String>,
    #[serde(default)]
    pub release_key: String,
}
