use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::model::{GroupId, UserId};

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("request to {url} failed: {source}")]
    Request { url: String, source: reqwest::Error },
    #[error("{url} answered {status}")]
    Status { url: String, status: u16 },
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSnapshot {
    #[serde(rename = "fitGroupId")]
    pub id: GroupId,
    #[serde(rename = "fitLeaderUserId")]
    pub leader_user_id: UserId,
    #[serde(rename = "fitGroupName")]
    pub name: String,
    #[serde(default)]
    pub category: i64,
    #[serde(default)]
    pub cycle: i64,
    #[serde(default)]
    pub frequency: i64,
    #[serde(rename = "presentFitMateCount", default)]
    pub member_count_hint: i64,
    #[serde(rename = "maxFitMate", default)]
    pub max_members: i64,
    /// `true` once the group is retired upstream.
    #[serde(rename = "state", default)]
    pub retired: bool,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderSnapshot {
    #[serde(rename = "fitLeaderUserId")]
    pub user_id: UserId,
    #[serde(rename = "fitLeaderUserNickname", default)]
    pub nickname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MateSnapshot {
    #[serde(rename = "fitMateId")]
    pub id: i64,
    #[serde(rename = "fitMateUserId")]
    pub user_id: UserId,
    #[serde(rename = "fitMateUserNickname", default)]
    pub nickname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MateList {
    #[serde(rename = "fitGroupId")]
    pub group_id: GroupId,
    #[serde(rename = "fitLeaderDetail")]
    pub leader: LeaderSnapshot,
    #[serde(rename = "fitMateDetails", default)]
    pub mates: Vec<MateSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSnapshot {
    pub user_id: UserId,
    pub nickname: String,
    #[serde(default)]
    pub state: bool,
    #[serde(default)]
    pub image_url: String,
}

/// Fetch-by-id access to the upstream system of record.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn fetch_group_detail(&self, id: GroupId) -> Result<GroupSnapshot, UpstreamError>;
    async fn fetch_mate_list(&self, id: GroupId) -> Result<MateList, UpstreamError>;
    async fn fetch_user_info(&self, id: UserId) -> Result<UserSnapshot, UpstreamError>;
}

#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    group_service_url: String,
    user_service_url: String,
}

impl HttpUpstream {
    pub fn new(
        group_service_url: impl Into<String>,
        user_service_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::ClientBuilder::new().timeout(timeout).build()?,
            group_service_url: group_service_url.into().trim_end_matches('/').to_owned(),
            user_service_url: user_service_url.into().trim_end_matches('/').to_owned(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<T, UpstreamError> {
        tracing::debug!(%url, "fetching upstream snapshot");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| UpstreamError::Request { url: url.clone(), source })?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status { url, status: status.as_u16() });
        }

        response
            .json()
            .await
            .map_err(|source| UpstreamError::Request { url, source })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn fetch_group_detail(&self, id: GroupId) -> Result<GroupSnapshot, UpstreamError> {
        self.get_json(format!("{}/groups/{id}", self.group_service_url)).await
    }

    async fn fetch_mate_list(&self, id: GroupId) -> Result<MateList, UpstreamError> {
        self.get_json(format!("{}/mates/{id}", self.group_service_url)).await
    }

    async fn fetch_user_info(&self, id: UserId) -> Result<UserSnapshot, UpstreamError> {
        self.get_json(format!("{}/users/{id}", self.user_service_url)).await
    }
}

/// Upstream timestamps are advisory; anything unparsable becomes "now".
pub(crate) fn upstream_time_or_now(raw: Option<&str>) -> OffsetDateTime {
    raw.and_then(|raw| OffsetDateTime::parse(raw, &Rfc3339).ok())
        .unwrap_or_else(OffsetDateTime::now_utc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_group_detail_response() {
        let snapshot: GroupSnapshot = serde_json::from_str(
            r#"{
                "presentFitMateCount": 3,
                "multiMediaEndPoints": [],
                "fitGroupId": 42,
                "fitLeaderUserId": 7,
                "fitGroupLeaderUserNickname": "lead",
                "fitGroupName": "morning run",
                "penaltyAmount": 1000,
                "category": 2,
                "introduction": "",
                "cycle": 1,
                "frequency": 3,
                "createdAt": "2024-05-01T00:00:00Z",
                "maxFitMate": 10,
                "state": false
            }"#,
        )
        .unwrap();
        assert_eq!(snapshot.id, 42);
        assert_eq!(snapshot.leader_user_id, 7);
        assert_eq!(snapshot.member_count_hint, 3);
        assert!(!snapshot.retired);
        assert_eq!(
            upstream_time_or_now(snapshot.created_at.as_deref()),
            time::macros::datetime!(2024-05-01 00:00:00 UTC)
        );
    }

    #[test]
    fn decodes_mate_list_response() {
        let list: MateList = serde_json::from_str(
            r#"{
                "fitGroupId": 42,
                "fitLeaderDetail": {"fitLeaderUserId": 7, "fitLeaderUserNickname": "lead", "createdAt": ""},
                "fitMateDetails": [
                    {"fitMateId": 1, "fitMateUserId": 11, "fitMateUserNickname": "a", "createdAt": ""},
                    {"fitMateId": 2, "fitMateUserId": 12, "fitMateUserNickname": "b", "createdAt": ""}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(list.leader.user_id, 7);
        assert_eq!(list.mates.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 2]);
    }
}
