//! Extension repositories through the GitHub REST API.

use async_trait::async_trait;
use ecat_core::{Identifier, Record, Schema};
use ecat_storage::{HttpFetcher, JsonResponse};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::{ApiError, MetadataApi};

pub const DEFAULT_GITHUB_API: &str = "https://api.github.com";

#[derive(Debug, Clone)]
pub struct GithubRepoApi {
    http: HttpFetcher,
    api_base: String,
    authorization: Option<String>,
    schema: Schema,
}

impl GithubRepoApi {
    pub fn new(http: HttpFetcher, api_base: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            authorization: token.filter(|t| !t.is_empty()).map(|t| format!("Bearer {t}")),
            schema: Schema::extensions(),
        }
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<JsonResponse, ApiError> {
        let url = format!("{}{}", self.api_base, path);
        Ok(self
            .http
            .get_json(&url, query, self.authorization.as_deref())
            .await?)
    }

    /// Item count of a paginated listing requested with `per_page=1`.
    async fn count_pages(&self, path: &str, extra: &[(&str, String)]) -> Result<(i64, Option<JsonValue>), ApiError> {
        let mut query = vec![("per_page", "1".to_string())];
        query.extend_from_slice(extra);
        let resp = self.get(path, &query).await?;
        // empty repositories answer contributor listings with 204
        if resp.body.is_null() {
            return Ok((0, None));
        }
        let items = resp
            .body
            .as_array()
            .ok_or_else(|| ApiError::Permanent(format!("{path} did not return an array")))?;
        let link = resp.headers.get("link").and_then(|v| v.to_str().ok());
        let total = last_page(link)
            .map(|n| n as i64)
            .unwrap_or(items.len() as i64);
        Ok((total, items.first().cloned()))
    }
}

#[async_trait]
impl MetadataApi for GithubRepoApi {
    fn name(&self) -> &'static str {
        "github"
    }

    async fn get_metadata(&self, identifier: &Identifier) -> Result<Record, ApiError> {
        let (owner, repo) = parse_repo_slug(identifier.as_str())
            .ok_or_else(|| ApiError::Permanent(format!("{identifier} is not a GitHub repository")))?;
        let base = format!("/repos/{owner}/{repo}");

        let repo_body = self.get(&base, &[]).await?.body;
        let mut raw = JsonMap::new();
        for (field, key) in [
            ("repository_name", "full_name"),
            ("stars", "stargazers_count"),
            ("forks_count", "forks_count"),
            ("open_issues", "open_issues_count"),
            ("discussions", "has_discussions"),
            ("last_update", "pushed_at"),
        ] {
            if let Some(value) = repo_body.get(key) {
                raw.insert(field.to_string(), value.clone());
            }
        }

        let (total_releases, latest) = self.count_pages(&format!("{base}/releases"), &[]).await?;
        raw.insert("total_releases".into(), total_releases.into());
        if let Some(latest) = latest {
            if let Some(tag) = latest.get("tag_name") {
                raw.insert("latest_release".into(), tag.clone());
            }
            if let Some(created) = latest.get("created_at").and_then(JsonValue::as_str) {
                raw.insert("release_date".into(), created.get(..10).unwrap_or(created).into());
            }
        }

        let (contributors, _) = self
            .count_pages(&format!("{base}/contributors"), &[("anon", "1".to_string())])
            .await?;
        raw.insert("contributors_count".into(), contributors.into());

        Ok(self.schema.record_from_json(&raw)?)
    }
}

/// Accepts `owner/repo`, `https://github.com/owner/repo(.git)` and trailing slashes.
pub fn parse_repo_slug(input: &str) -> Option<(String, String)> {
    let trimmed = input.trim().trim_end_matches('/');
    let path = trimmed
        .strip_prefix("https://github.com/")
        .or_else(|| trimmed.strip_prefix("http://github.com/"))
        .or_else(|| trimmed.strip_prefix("github.com/"))
        .unwrap_or(trimmed);
    let mut parts = path.split('/').filter(|p| !p.is_empty());
    let owner = parts.next()?;
    let repo = parts.next()?.trim_end_matches(".git");
    if parts.next().is_some() || owner.contains(':') || repo.is_empty() {
        return None;
    }
    Some((owner.to_string(), repo.to_string()))
}

/// Page number of the `rel="last"` entry of a `Link` header.
pub fn last_page(link: Option<&str>) -> Option<u64> {
    link?
        .split(',')
        .find(|part| part.contains("rel=\"last\""))
        .and_then(|part| {
            let url = part.split_once('<')?.1.split_once('>')?.0;
            let query = url.split_once('?')?.1;
            query
                .split('&')
                .filter_map(|kv| kv.split_once('='))
                .find(|(k, _)| *k == "page")
                .and_then(|(_, v)| v.parse().ok())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecat_core::FieldValue;
    use ecat_storage::HttpClientConfig;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn repo_slugs_are_parsed_from_urls() {
        assert_eq!(
            parse_repo_slug("https://github.com/ckan/ckanext-spatial/"),
            Some(("ckan".into(), "ckanext-spatial".into()))
        );
        assert_eq!(
            parse_repo_slug("ckan/ckanext-dcat.git"),
            Some(("ckan".into(), "ckanext-dcat".into()))
        );
        assert_eq!(parse_repo_slug("https://gitlab.com/a/b/c"), None);
        assert_eq!(parse_repo_slug("just-a-name"), None);
    }

    #[test]
    fn link_header_last_page_is_extracted() {
        let link = r#"<https://api.github.com/repositories/1/releases?per_page=1&page=2>; rel="next", <https://api.github.com/repositories/1/releases?per_page=1&page=14>; rel="last""#;
        assert_eq!(last_page(Some(link)), Some(14));
        assert_eq!(last_page(Some(r#"<https://x/y?page=2>; rel="next""#)), None);
        assert_eq!(last_page(None), None);
    }

    #[tokio::test]
    async fn repository_metadata_is_normalized_into_a_record() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/ckan/ckanext-dcat"))
            .and(header("authorization", "Bearer t0ken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "full_name": "ckan/ckanext-dcat",
                "stargazers_count": 160,
                "forks_count": 140,
                "open_issues_count": 30,
                "has_discussions": false,
                "pushed_at": "2026-01-05T08:00:00Z",
                "license": {"key": "agpl-3.0"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/ckan/ckanext-dcat/releases"))
            .and(query_param("per_page", "1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(
                        "link",
                        r#"<https://api.github.com/repositories/9/releases?per_page=1&page=23>; rel="last""#,
                    )
                    .set_body_json(json!([{"tag_name": "v2.1.0", "created_at": "2025-11-20T10:00:00Z"}])),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/ckan/ckanext-dcat/contributors"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"login": "amercader"}])))
            .mount(&server)
            .await;

        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let api = GithubRepoApi::new(http, server.uri(), Some("t0ken".into()));
        let record = api
            .get_metadata(&Identifier::from("https://github.com/ckan/ckanext-dcat"))
            .await
            .unwrap();

        assert_eq!(record.get("stars"), &FieldValue::Int(160));
        assert_eq!(record.get("discussions"), &FieldValue::Bool(false));
        assert_eq!(record.get("total_releases"), &FieldValue::Int(23));
        assert_eq!(record.get("latest_release"), &FieldValue::text("v2.1.0"));
        assert_eq!(record.get("release_date"), &FieldValue::text("2025-11-20"));
        assert_eq!(record.get("contributors_count"), &FieldValue::Int(1));
        assert_eq!(record.get("last_update"), &FieldValue::text("2026-01-05T08:00:00Z"));
        assert_eq!(record.get("license"), &FieldValue::Null);
    }

    async fn mount_repo_and_releases(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/repos/ckan/ckanext-harvest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "full_name": "ckan/ckanext-harvest",
                "stargazers_count": 80
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/ckan/ckanext-harvest/releases"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn contributor_outage_fails_the_whole_fetch() {
        let server = MockServer::start().await;
        mount_repo_and_releases(&server).await;
        Mock::given(method("GET"))
            .and(path("/repos/ckan/ckanext-harvest/contributors"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let api = GithubRepoApi::new(http, server.uri(), None);
        let err = api
            .get_metadata(&Identifier::from("ckan/ckanext-harvest"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Transient(_)), "{err:?}");
    }

    #[tokio::test]
    async fn empty_repository_has_zero_contributors() {
        let server = MockServer::start().await;
        mount_repo_and_releases(&server).await;
        Mock::given(method("GET"))
            .and(path("/repos/ckan/ckanext-harvest/contributors"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let api = GithubRepoApi::new(http, server.uri(), None);
        let record = api
            .get_metadata(&Identifier::from("ckan/ckanext-harvest"))
            .await
            .unwrap();
        assert_eq!(record.get("contributors_count"), &FieldValue::Int(0));
        assert_eq!(record.get("total_releases"), &FieldValue::Int(0));
    }

    #[tokio::test]
    async fn missing_repository_maps_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/ckan/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let api = GithubRepoApi::new(http, server.uri(), None);
        let err = api.get_metadata(&Identifier::from("ckan/gone")).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }
}
