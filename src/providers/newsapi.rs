use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::http::get_json;
use super::{
    build_incoming, check_base_url, FetchRequest, NewsProvider, ProviderArticle, ProviderError,
    RawItem, RetryPolicy,
};
use crate::storage::SourceRef;

#[derive(Debug, Deserialize)]
struct NewsApiResponse {
    status: String,
    #[serde(default)]
    articles: Vec<NewsApiArticle>,
    code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewsApiArticle {
    source: Option<NewsApiSource>,
    author: Option<String>,
    title: Option<String>,
    description: Option<String>,
    url: Option<String>,
    published_at: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NewsApiSource {
    id: Option<String>,
    name: Option<String>,
}

/// newsapi.org client. Articles are attributed to the outlet NewsAPI
/// reports, keyed `newsapi:<outlet>`.
pub struct NewsApiClient {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    country: String,
    retry: RetryPolicy,
}

impl NewsApiClient {
    pub fn new(
        client: reqwest::Client,
        api_key: SecretString,
        base_url: &str,
        country: &str,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client,
            api_key,
            base_url: check_base_url(base_url)?,
            country: country.to_string(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn request_url(&self, request: &FetchRequest) -> Result<url::Url, ProviderError> {
        let endpoint = match request.query {
            Some(_) => "/v2/everything",
            None => "/v2/top-headlines",
        };
        let mut url = url::Url::parse(&format!("{}{endpoint}", self.base_url))
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        {
            let mut pairs = url.query_pairs_mut();
            match &request.query {
                Some(q) => {
                    pairs.append_pair("q", q);
                    pairs.append_pair("sortBy", "publishedAt");
                }
                None => {
                    pairs.append_pair("country", &self.country);
                }
            }
            pairs.append_pair("pageSize", &request.page_size.clamp(1, 100).to_string());
        }
        Ok(url)
    }
}

fn outlet_source(source: Option<&NewsApiSource>) -> SourceRef {
    let name = source
        .and_then(|s| s.name.as_deref())
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or("NewsAPI");
    let slug = source
        .and_then(|s| s.id.as_deref())
        .map(str::to_string)
        .unwrap_or_else(|| {
            name.to_lowercase()
                .split(|c: char| !c.is_alphanumeric())
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join("-")
        });
    SourceRef {
        key: format!("newsapi:{slug}"),
        name: name.to_string(),
        provider: "newsapi".to_string(),
        url: None,
    }
}

#[async_trait]
impl NewsProvider for NewsApiClient {
    fn name(&self) -> &'static str {
        "newsapi"
    }

    fn display_name(&self) -> &'static str {
        "NewsAPI"
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<ProviderArticle>, ProviderError> {
        let url = self.request_url(request)?;
        let response: NewsApiResponse = get_json(
            &self.client,
            &url,
            &[("X-Api-Key", self.api_key.expose_secret())],
            &self.retry,
            self.name(),
        )
        .await?;

        if response.status != "ok" {
            return Err(ProviderError::Api(format!(
                "{}: {}",
                response.code.unwrap_or_else(|| "unknown".to_string()),
                response.message.unwrap_or_default()
            )));
        }

        let total = response.articles.len();
        let articles: Vec<ProviderArticle> = response
            .articles
            .iter()
            .filter_map(|item| {
                let article = build_incoming(RawItem {
                    title: item.title.as_deref(),
                    url: item.url.as_deref(),
                    description: item.description.as_deref(),
                    content: item.content.as_deref(),
                    author: item.author.as_deref(),
                    category: None,
                    published: item.published_at.as_deref(),
                })?;
                Some(ProviderArticle {
                    source: outlet_source(item.source.as_ref()),
                    article,
                })
            })
            .collect();

        if articles.len() < total {
            tracing::warn!(
                provider = self.name(),
                skipped = total - articles.len(),
                "Items without a usable title or URL skipped"
            );
        }
        Ok(articles)
    }
}
