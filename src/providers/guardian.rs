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
struct GuardianEnvelope {
    response: GuardianResponse,
}

#[derive(Debug, Deserialize)]
struct GuardianResponse {
    status: String,
    message: Option<String>,
    #[serde(default)]
    results: Vec<GuardianItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GuardianItem {
    section_name: Option<String>,
    web_publication_date: Option<String>,
    web_title: Option<String>,
    web_url: Option<String>,
    #[serde(default)]
    fields: GuardianFields,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GuardianFields {
    body_text: Option<String>,
    byline: Option<String>,
    trail_text: Option<String>,
}

/// Guardian Open Platform content search.
pub struct GuardianClient {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    retry: RetryPolicy,
}

impl GuardianClient {
    pub fn new(
        client: reqwest::Client,
        api_key: SecretString,
        base_url: &str,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client,
            api_key,
            base_url: check_base_url(base_url)?,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn request_url(&self, request: &FetchRequest) -> Result<url::Url, ProviderError> {
        let mut url = url::Url::parse(&format!("{}/search", self.base_url))
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(q) = &request.query {
                pairs.append_pair("q", q);
            }
            pairs
                .append_pair("page-size", &request.page_size.clamp(1, 50).to_string())
                .append_pair("order-by", "newest")
                .append_pair("show-fields", "bodyText,byline,trailText")
                .append_pair("api-key", self.api_key.expose_secret());
        }
        Ok(url)
    }
}

fn guardian_source() -> SourceRef {
    SourceRef {
        key: "guardian".to_string(),
        name: "The Guardian".to_string(),
        provider: "guardian".to_string(),
        url: Some("https://www.theguardian.com".to_string()),
    }
}

#[async_trait]
impl NewsProvider for GuardianClient {
    fn name(&self) -> &'static str {
        "guardian"
    }

    fn display_name(&self) -> &'static str {
        "The Guardian"
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<ProviderArticle>, ProviderError> {
        let url = self.request_url(request)?;
        let envelope: GuardianEnvelope =
            get_json(&self.client, &url, &[], &self.retry, self.name()).await?;
        let response = envelope.response;

        if response.status != "ok" {
            return Err(ProviderError::Api(
                response.message.unwrap_or_else(|| response.status.clone()),
            ));
        }

        let source = guardian_source();
        let total = response.results.len();
        let articles: Vec<ProviderArticle> = response
            .results
            .iter()
            .filter_map(|item| {
                let article = build_incoming(RawItem {
                    title: item.web_title.as_deref(),
                    url: item.web_url.as_deref(),
                    description: item.fields.trail_text.as_deref(),
                    content: item.fields.body_text.as_deref(),
                    author: item.fields.byline.as_deref(),
                    category: item.section_name.as_deref(),
                    published: item.web_publication_date.as_deref(),
                })?;
                Some(ProviderArticle {
                    source: source.clone(),
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
