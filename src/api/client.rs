use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use tracing::debug;
use url::Url;

use crate::api::api_types::{
  ApiBible, ApiBibleIndex, ApiHighlightWrite, ApiHighlightsResponse, ApiPassage,
};
use crate::api::{ChapterSource, HighlightsRemote, PermissionsSource, VersionSource};
use crate::bible::types::{BibleVersion, ChapterKey, ChapterText, Highlight, VersionId};
use crate::config::Config;
use crate::error::FetchError;

const USER_AGENT: &str = concat!("lectern/", env!("CARGO_PKG_VERSION"));

/// Bible API client
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  base_url: Url,
  access_token: Option<String>,
}

impl ApiClient {
  pub fn new(config: &Config) -> Result<Self> {
    Self::with_token(config, Config::access_token())
  }

  pub fn with_token(config: &Config, access_token: Option<String>) -> Result<Self> {
    let base_url = Url::parse(&config.api.base_url)
      .map_err(|e| eyre!("Invalid api.base_url {}: {}", config.api.base_url, e))?;
    if base_url.cannot_be_a_base() {
      return Err(eyre!("Invalid api.base_url {}: not a base URL", base_url));
    }

    let mut headers = HeaderMap::new();
    let app_key = HeaderValue::from_str(&config.api.app_key)
      .map_err(|e| eyre!("Invalid api.app_key: {}", e))?;
    headers.insert("X-App-Key", app_key);

    let http = reqwest::Client::builder()
      .user_agent(USER_AGENT)
      .default_headers(headers)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base_url,
      access_token,
    })
  }

  pub fn is_signed_in(&self) -> bool {
    self.access_token.is_some()
  }

  /// `base_url` with `segments` appended, each percent-encoded.
  fn endpoint(&self, segments: &[&str]) -> Url {
    let mut url = self.base_url.clone();
    if let Ok(mut path) = url.path_segments_mut() {
      path.pop_if_empty().extend(segments);
    }
    url
  }

  async fn send(&self, request: RequestBuilder) -> Result<Response, FetchError> {
    let request = match &self.access_token {
      Some(token) => request.bearer_auth(token),
      None => request,
    };
    request
      .send()
      .await
      .map_err(|e| FetchError::Unavailable(e.to_string()))
  }

  async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, FetchError> {
    debug!(%url, "GET");
    let response = self.send(self.http.get(url.clone())).await?;
    let status = response.status();
    if !status.is_success() {
      return Err(status_error(status, &url));
    }
    response.json::<T>().await.map_err(|e| {
      if e.is_decode() {
        FetchError::Malformed(format!("{url}: {e}"))
      } else {
        FetchError::Unavailable(format!("{url}: {e}"))
      }
    })
  }

  /// Send a highlight write. `tolerated` is a non-2xx status that still means
  /// the server is in the requested state.
  async fn write(
    &self,
    method: Method,
    url: Url,
    body: Option<&ApiHighlightWrite<'_>>,
    tolerated: Option<StatusCode>,
  ) -> Result<bool, FetchError> {
    debug!(%url, %method, "write");
    let mut request = self.http.request(method, url.clone());
    if let Some(body) = body {
      request = request.json(body);
    }
    let status = self.send(request).await?.status();
    match status {
      s if s.is_success() || Some(s) == tolerated => Ok(true),
      StatusCode::UNPROCESSABLE_ENTITY => Ok(false),
      s => Err(status_error(s, &url)),
    }
  }
}

/// Map a non-success HTTP status onto the fetch error taxonomy.
fn status_error(status: StatusCode, url: &Url) -> FetchError {
  let message = format!("{url} returned {status}");
  match status {
    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchError::Unauthorized(message),
    _ => FetchError::Unavailable(message),
  }
}

#[async_trait]
impl VersionSource for ApiClient {
  async fn fetch_version(&self, id: VersionId) -> Result<BibleVersion, FetchError> {
    let url = self.endpoint(&["v1", "bibles", &id.to_string()]);
    let bible: ApiBible = self.get_json(url).await?;
    bible.into_version(id)
  }
}

#[async_trait]
impl ChapterSource for ApiClient {
  async fn fetch_chapter(&self, key: &ChapterKey) -> Result<ChapterText, FetchError> {
    let url = self.endpoint(&[
      "v1",
      "bibles",
      &key.version_id.to_string(),
      "passages",
      &key.passage_id(),
    ]);
    let passage: ApiPassage = self.get_json(url).await?;
    passage.into_chapter(key)
  }
}

#[async_trait]
impl HighlightsRemote for ApiClient {
  async fn create_highlight(
    &self,
    bible_id: VersionId,
    passage_id: &str,
    color: &str,
  ) -> Result<bool, FetchError> {
    let body = ApiHighlightWrite {
      bible_id: bible_id.0,
      passage_id,
      color,
    };
    let url = self.endpoint(&["v1", "highlights"]);
    // Already highlighted there
    self
      .write(Method::POST, url, Some(&body), Some(StatusCode::CONFLICT))
      .await
  }

  async fn update_highlight(
    &self,
    bible_id: VersionId,
    passage_id: &str,
    color: &str,
  ) -> Result<bool, FetchError> {
    let body = ApiHighlightWrite {
      bible_id: bible_id.0,
      passage_id,
      color,
    };
    let url = self.endpoint(&["v1", "highlights"]);
    self
      .write(Method::PUT, url, Some(&body), None)
      .await
  }

  async fn delete_highlight(&self, bible_id: VersionId, passage_id: &str) -> Result<bool, FetchError> {
    let mut url = self.endpoint(&["v1", "highlights"]);
    url
      .query_pairs_mut()
      .append_pair("bible_id", &bible_id.to_string())
      .append_pair("passage_id", passage_id);
    // Nothing to delete is as good as deleted
    self
      .write(Method::DELETE, url, None, Some(StatusCode::NOT_FOUND))
      .await
  }

  async fn list_highlights(
    &self,
    bible_id: VersionId,
    passage_id: &str,
  ) -> Result<Vec<Highlight>, FetchError> {
    let mut url = self.endpoint(&["v1", "highlights"]);
    url
      .query_pairs_mut()
      .append_pair("bible_id", &bible_id.to_string())
      .append_pair("passage_id", passage_id);
    let response: ApiHighlightsResponse = self.get_json(url).await?;
    Ok(response.into_highlights())
  }
}

#[async_trait]
impl PermissionsSource for ApiClient {
  async fn permitted_version_ids(&self) -> Result<HashSet<VersionId>, FetchError> {
    let mut ids = HashSet::new();
    let mut page_token: Option<String> = None;

    loop {
      let mut url = self.endpoint(&["v1", "bibles"]);
      url.query_pairs_mut().append_pair("fields", "id");
      if let Some(token) = &page_token {
        url.query_pairs_mut().append_pair("page_token", token);
      }

      let page: ApiBibleIndex = self.get_json(url).await?;
      ids.extend(page.data.into_iter().map(|b| VersionId(b.id)));

      // Check if we've fetched every page
      match page.next_page_token {
        Some(token) if !token.is_empty() => page_token = Some(token),
        _ => break,
      }
    }

    Ok(ids)
  }
}
