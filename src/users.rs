//! Users import
//!
//! Creates one user per line of a semicolon-separated file and gathers
//! them in a new group.

use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use time::OffsetDateTime;
use tracing::{error, info};

use crate::api::ApiRequest;
use crate::client::MediaServerClient;
use crate::error::{ClientError, Result};

/// One line of a users file: `first_name;last_name;email;company`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub company: String,
}

/// Result of a users import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserImport {
    pub group_id: String,
    pub group_name: String,
    /// Users created and added to the group
    pub imported: usize,
    /// Emails for which a step failed
    pub failed: Vec<String>,
}

/// Parse a users file
///
/// The first line is a header. Empty lines are skipped; extra fields are
/// ignored.
pub fn parse_users_csv(content: &str) -> Result<Vec<UserRecord>> {
    let mut users = Vec::new();
    for (index, line) in content.lines().enumerate().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(';').map(str::trim).collect();
        let [first_name, last_name, email, company, ..] = fields.as_slice() else {
            return Err(ClientError::validation_error(format!(
                "Line {} has {} field(s), expected first_name;last_name;email;company",
                index + 1,
                fields.len()
            )));
        };
        if email.is_empty() {
            return Err(ClientError::validation_error(format!("Line {} has no email", index + 1)));
        }
        users.push(UserRecord {
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            email: email.to_string(),
            company: company.to_string(),
        });
    }
    Ok(users)
}

/// Timestamp in the `Sat Oct 17 09:05:03 2026` form, in UTC
fn ctime(now: OffsetDateTime) -> String {
    let weekday = now.weekday().to_string();
    let month = now.month().to_string();
    format!(
        "{} {} {:>2} {:02}:{:02}:{:02} {}",
        &weekday[..3],
        &month[..3],
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
        now.year()
    )
}

impl MediaServerClient {
    /// Create the users listed in a file and add them to a new group
    ///
    /// The whole file is checked before anything is sent. Failures on one
    /// user are logged and do not stop the import.
    pub async fn import_users_csv(
        &self,
        path: &Path,
        timeout: Option<Duration>,
        max_retry: Option<u32>,
    ) -> Result<UserImport> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| ClientError::io(e, path))?;
        let users = parse_users_csv(&content)?;

        let group_name = format!("Users imported from csv on {}", ctime(OffsetDateTime::now_utc()));
        let response = self
            .api_json(ApiRequest::post("groups/add/").field("name", group_name.clone()))
            .await?;
        let group_id = match response.get("id") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => {
                return Err(ClientError::invalid_response(
                    "The group was created without an id",
                    self.full_url("groups/add/"),
                ))
            }
        };
        info!("Created group {} with id {}", group_name, group_id);

        let mut summary = UserImport {
            group_id,
            group_name,
            imported: 0,
            failed: Vec::new(),
        };
        for user in &users {
            let added = self.add_user(user, timeout, max_retry).await;
            let joined = self.add_group_member(&summary, user, timeout, max_retry).await;
            if added && joined {
                summary.imported += 1;
            } else {
                summary.failed.push(user.email.clone());
            }
        }
        info!(
            "{} user(s) imported in group \"{}\", {} failure(s)",
            summary.imported,
            summary.group_name,
            summary.failed.len()
        );
        Ok(summary)
    }

    async fn add_user(&self, user: &UserRecord, timeout: Option<Duration>, max_retry: Option<u32>) -> bool {
        info!("Adding user \"{}\"", user.email);
        let req = ApiRequest::post("users/add/")
            .field("email", user.email.clone())
            .field("first_name", user.first_name.clone())
            .field("last_name", user.last_name.clone())
            .field("company", user.company.clone())
            .field("username", user.email.clone())
            .field("is_active", "true");
        self.send_logged(with_limits(req, timeout, max_retry)).await
    }

    async fn add_group_member(
        &self,
        group: &UserImport,
        user: &UserRecord,
        timeout: Option<Duration>,
        max_retry: Option<u32>,
    ) -> bool {
        info!("Adding user \"{}\" to group \"{}\"", user.email, group.group_name);
        let req = ApiRequest::post("groups/members/add/")
            .field("id", group.group_id.clone())
            .field("user_email", user.email.clone());
        self.send_logged(with_limits(req, timeout, max_retry)).await
    }

    async fn send_logged(&self, req: ApiRequest) -> bool {
        match self.api_json(req).await {
            Ok(response) => {
                info!("Success: {}", response);
                true
            }
            Err(e) => {
                error!("Error: {}", e);
                false
            }
        }
    }
}

fn with_limits(mut req: ApiRequest, timeout: Option<Duration>, max_retry: Option<u32>) -> ApiRequest {
    if let Some(timeout) = timeout {
        req = req.timeout(timeout);
    }
    if let Some(max_retry) = max_retry {
        req = req.max_retry(max_retry);
    }
    req
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::{is_version_probe, json_response, test_client, test_config, version_response, MockTransport};
    use crate::api::Method;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;

    const USERS: &str = "first;last;email;company\n\
        Ada ; Lovelace ; ada@example.com ; Engines\n\
        \n\
        Alan;Turing;alan@example.com;Bletchley;extra\n";

    #[test]
    fn test_parse_users_csv() {
        let users = parse_users_csv(USERS).unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(
            users[0],
            UserRecord {
                first_name: "Ada".to_string(),
                last_name: "Lovelace".to_string(),
                email: "ada@example.com".to_string(),
                company: "Engines".to_string(),
            }
        );
        assert_eq!(users[1].company, "Bletchley");
        assert!(parse_users_csv("header only").unwrap().is_empty());
    }

    #[test]
    fn test_short_line_is_rejected() {
        let err = parse_users_csv("h\nAda;Lovelace;ada@example.com;X\nBob;Smith\n").unwrap_err();
        assert!(matches!(err, ClientError::Validation { .. }));
        assert!(err.to_string().contains("Line 3"));
    }

    #[test]
    fn test_ctime() {
        assert_eq!(ctime(OffsetDateTime::from_unix_timestamp(1_792_227_903).unwrap()), "Sat Oct 17 09:05:03 2026");
        assert_eq!(ctime(OffsetDateTime::from_unix_timestamp(1_772_406_000).unwrap()), "Sun Mar  1 23:00:00 2026");
    }

    #[tokio::test]
    async fn test_import_users_csv() {
        let transport = Arc::new(MockTransport::new(|req| {
            if is_version_probe(req) {
                return Ok(version_response("13.0.0"));
            }
            if req.url.ends_with("/groups/add/") {
                return Ok(json_response(200, json!({"success": true, "id": 42})));
            }
            if req.url.ends_with("/users/add/") && req.form_value("email") == Some("alan@example.com") {
                return Ok(json_response(200, json!({"success": false, "error": "User already exists"})));
            }
            Ok(json_response(200, json!({"success": true})))
        }));
        let dir = tempdir().unwrap();
        let path = dir.path().join("users.csv");
        std::fs::write(&path, USERS).unwrap();

        let client = test_client(test_config(), transport.clone());
        let summary = client.import_users_csv(&path, None, Some(0)).await.unwrap();

        assert_eq!(summary.group_id, "42");
        assert!(summary.group_name.starts_with("Users imported from csv on "));
        assert_eq!(summary.imported, 1);
        assert_eq!(summary.failed, vec!["alan@example.com".to_string()]);

        let sent = transport.requests();
        let user = sent.iter().find(|r| r.url.ends_with("/users/add/")).unwrap();
        assert_eq!(user.form_value("username"), Some("ada@example.com"));
        assert_eq!(user.form_value("first_name"), Some("Ada"));
        assert_eq!(user.form_value("is_active"), Some("true"));
        // Membership is still requested for a user that could not be created.
        assert_eq!(transport.count(Method::Post, "groups/members/add/"), 2);
        let member = sent.iter().find(|r| r.url.ends_with("/groups/members/add/")).unwrap();
        assert_eq!(member.form_value("id"), Some("42"));
        assert_eq!(member.form_value("user_email"), Some("ada@example.com"));
    }

    #[tokio::test]
    async fn test_invalid_file_sends_nothing() {
        let transport = Arc::new(MockTransport::new(|_| Ok(json_response(200, json!({"success": true})))));
        let dir = tempdir().unwrap();
        let path = dir.path().join("users.csv");
        std::fs::write(&path, "h\nAda;Lovelace\n").unwrap();

        let client = test_client(test_config(), transport.clone());
        let err = client.import_users_csv(&path, None, None).await.unwrap_err();
        assert!(matches!(err, ClientError::Validation { .. }));
        assert!(transport.requests().is_empty());

        let err = client.import_users_csv(&dir.path().join("missing.csv"), None, None).await.unwrap_err();
        assert!(matches!(err, ClientError::Storage { .. }));
    }
}
