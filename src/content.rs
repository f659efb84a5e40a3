//! Catalog and content management
//!
//! Whole-catalog export in the server's flat layout, as a channel tree, or
//! as CSV, plus removal of every channel with its content.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::api::ApiRequest;
use crate::client::MediaServerClient;
use crate::error::{ClientError, Result};

const CATALOG_URI: &str = "catalog/get-all/";
const DEFAULT_CATALOG_TIMEOUT: Duration = Duration::from_secs(120);

/// Layout of an exported catalog
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CatalogFormat {
    /// One list per object type, as returned by the server
    #[default]
    Flat,
    /// Root channels with their children nested under them
    Tree,
    /// CSV text
    Csv,
}

impl CatalogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            CatalogFormat::Flat => "flat",
            CatalogFormat::Tree => "tree",
            CatalogFormat::Csv => "csv",
        }
    }
}

impl fmt::Display for CatalogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CatalogFormat {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "flat" => Ok(CatalogFormat::Flat),
            "tree" => Ok(CatalogFormat::Tree),
            "csv" => Ok(CatalogFormat::Csv),
            other => Err(ClientError::validation_error_with_field(
                format!("Unknown catalog format \"{}\", expected flat, tree or csv", other),
                "format",
            )),
        }
    }
}

/// An exported catalog
#[derive(Debug, Clone, PartialEq)]
pub enum Catalog {
    Json(Value),
    Csv(String),
}

impl Catalog {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Catalog::Json(value) => Some(value),
            Catalog::Csv(_) => None,
        }
    }
}

/// Nest a flat catalog under its root channels
///
/// Channels without a parent become roots in `{"channels": [...]}`. Every
/// other object is appended to the list named after its type in its parent
/// channel, so sub-channels end up under `channels` of their parent.
pub fn build_catalog_tree(catalog: Value) -> Result<Value> {
    let Value::Object(catalog) = catalog else {
        return Err(ClientError::invalid_response("The catalog is not an object", CATALOG_URI));
    };

    let mut roots = Vec::new();
    let mut children: HashMap<String, Vec<(String, Value)>> = HashMap::new();
    for (model_type, objects) in catalog {
        let Value::Array(objects) = objects else {
            return Err(ClientError::invalid_response(
                format!("The catalog entry \"{}\" is not a list", model_type),
                CATALOG_URI,
            ));
        };
        for object in objects {
            match object.get("parent_oid").and_then(Value::as_str) {
                Some(parent) => children
                    .entry(parent.to_string())
                    .or_default()
                    .push((model_type.clone(), object)),
                None if model_type == "channels" => roots.push(object),
                None => {
                    return Err(ClientError::invalid_response(
                        format!("An object of type \"{}\" has no parent channel", model_type),
                        CATALOG_URI,
                    ))
                }
            }
        }
    }

    let roots = roots
        .into_iter()
        .map(|channel| attach_children(channel, &mut children))
        .collect::<Vec<_>>();

    if let Some(parent) = children.keys().next() {
        return Err(ClientError::invalid_response(
            format!("The catalog references an unknown parent channel \"{}\"", parent),
            CATALOG_URI,
        ));
    }

    let mut tree = Map::new();
    tree.insert("channels".to_string(), Value::Array(roots));
    Ok(Value::Object(tree))
}

fn attach_children(mut channel: Value, children: &mut HashMap<String, Vec<(String, Value)>>) -> Value {
    let Some(oid) = channel.get("oid").and_then(Value::as_str).map(str::to_string) else {
        return channel;
    };
    let Some(entries) = children.remove(&oid) else {
        return channel;
    };
    if let Value::Object(fields) = &mut channel {
        for (model_type, child) in entries {
            let child = if model_type == "channels" {
                attach_children(child, children)
            } else {
                child
            };
            if let Value::Array(list) = fields.entry(model_type).or_insert_with(|| Value::Array(Vec::new())) {
                list.push(child);
            }
        }
    }
    channel
}

fn channel_oids(tree: &Value) -> Vec<String> {
    tree.get("channels")
        .and_then(Value::as_array)
        .map(|channels| {
            channels
                .iter()
                .filter_map(|c| c.get("oid").and_then(Value::as_str).map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

impl MediaServerClient {
    /// Export the whole catalog
    ///
    /// `timeout` defaults to two minutes.
    pub async fn get_catalog(&self, format: CatalogFormat, timeout: Option<Duration>) -> Result<Catalog> {
        let json_catalog = self.capabilities().await?.json_catalog;
        let api_format = match format {
            CatalogFormat::Csv => "csv",
            _ if json_catalog => "json",
            other => other.as_str(),
        };

        let mut req = ApiRequest::get(CATALOG_URI)
            .param("format", api_format)
            .timeout(timeout.unwrap_or(DEFAULT_CATALOG_TIMEOUT));
        if format == CatalogFormat::Csv {
            req = req.text();
        }
        let response = self.api(req).await?;

        match format {
            CatalogFormat::Csv => Ok(Catalog::Csv(response.into_text()?)),
            CatalogFormat::Tree if json_catalog => Ok(Catalog::Json(build_catalog_tree(response.into_json()?)?)),
            _ => Ok(Catalog::Json(response.into_json()?)),
        }
    }

    /// Delete every root channel with its content
    ///
    /// Returns the number of channel deletions. Fails if a pass leaves the
    /// same channels in place.
    pub async fn remove_all_content(&self, timeout: Option<Duration>, max_retry: Option<u32>) -> Result<usize> {
        info!("Remove all content");
        let mut removed = 0;
        let mut previous: Option<Vec<String>> = None;
        loop {
            let tree = self.api_json(ApiRequest::get("channels/tree/")).await?;
            let oids = channel_oids(&tree);
            if oids.is_empty() {
                debug!("No channel left");
                return Ok(removed);
            }
            if previous.as_ref() == Some(&oids) {
                return Err(ClientError::api(
                    format!("{} channel(s) are still present after being deleted", oids.len()),
                    self.full_url("channels/delete/"),
                ));
            }

            for oid in &oids {
                let mut req = ApiRequest::post("channels/delete/")
                    .field("oid", oid.clone())
                    .field("delete_content", "yes");
                if let Some(timeout) = timeout {
                    req = req.timeout(timeout);
                }
                if let Some(max_retry) = max_retry {
                    req = req.max_retry(max_retry);
                }
                self.api_json(req).await?;
                removed += 1;
                info!("Emptied channel {}", oid);
            }
            previous = Some(oids);
        }
    }
}
