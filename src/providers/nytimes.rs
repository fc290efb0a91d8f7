use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::http::get_json;
use super::{
    build_incoming, check_base_url, FetchRequest, NewsProvider, ProviderArticle, ProviderError,
    RawItem, RetryPolicy,
};
use crate::storage::SourceRef;

// Top Stories
#[derive(Debug, Deserialize)]
struct TopStoriesResponse {
    status: String,
    #[serde(default)]
    results: Vec<TopStory>,
}

#[derive(Debug, Deserialize)]
struct TopStory {
    section: Option<String>,
    title: Option<String>,
    #[serde(rename = "abstract")]
    summary: Option<String>,
    url: Option<String>,
    byline: Option<String>,
    published_date: Option<String>,
}

// Article Search
#[derive(Debug, Deserialize)]
struct SearchResponse {
    status: String,
    response: Option<SearchDocs>,
}

#[derive(Debug, Deserialize)]
struct SearchDocs {
    #[serde(default)]
    docs: Vec<SearchDoc>,
}

#[derive(Debug, Deserialize)]
struct SearchDoc {
    web_url: Option<String>,
    headline: Option<Headline>,
    #[serde(rename = "abstract")]
    summary: Option<String>,
    lead_paragraph: Option<String>,
    byline: Option<Byline>,
    pub_date: Option<String>,
    section_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Headline {
    main: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Byline {
    original: Option<String>,
}

/// New York Times Top Stories, or Article Search when a query is given.
pub struct NyTimesClient {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    section: String,
    retry: RetryPolicy,
}

impl NyTimesClient {
    pub fn new(
        client: reqwest::Client,
        api_key: SecretString,
        base_url: &str,
        section: &str,
    ) -> Result<Self, ProviderError> {
        let section = section.trim();
        if section.is_empty() || !section.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(ProviderError::Parse(format!("invalid section: {section}")));
        }
        Ok(Self {
            client,
            api_key,
            base_url: check_base_url(base_url)?,
            section: section.to_string(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn url(&self, path: &str, query: Option<&str>) -> Result<url::Url, ProviderError> {
        let mut url = url::Url::parse(&format!("{}{path}", self.base_url))
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(q) = query {
                pairs.append_pair("q", q).append_pair("sort", "newest");
            }
            pairs.append_pair("api-key", self.api_key.expose_secret());
        }
        Ok(url)
    }

    fn source() -> SourceRef {
        SourceRef {
            key: "nytimes".to_string(),
            name: "The New York Times".to_string(),
            provider: "nytimes".to_string(),
            url: Some("https://www.nytimes.com".to_string()),
        }
    }

    async fn top_stories(&self) -> Result<Vec<RawOwned>, ProviderError> {
        let url = self.url(&format!("/svc/topstories/v2/{}.json", self.section), None)?;
        let response: TopStoriesResponse =
            get_json(&self.client, &url, &[], &self.retry, self.name()).await?;
        if response.status != "OK" {
            return Err(ProviderError::Api(response.status));
        }
        Ok(response
            .results
            .into_iter()
            .map(|s| RawOwned {
                title: s.title,
                url: s.url,
                description: s.summary,
                content: None,
                author: s.byline,
                category: s.section,
                published: s.published_date,
            })
            .collect())
    }

    async fn search(&self, query: &str) -> Result<Vec<RawOwned>, ProviderError> {
        let url = self.url("/svc/search/v2/articlesearch.json", Some(query))?;
        let response: SearchResponse =
            get_json(&self.client, &url, &[], &self.retry, self.name()).await?;
        if response.status != "OK" {
            return Err(ProviderError::Api(response.status));
        }
        Ok(response
            .response
            .map(|r| r.docs)
            .unwrap_or_default()
            .into_iter()
            .map(|d| RawOwned {
                title: d.headline.and_then(|h| h.main),
                url: d.web_url,
                description: d.summary,
                content: d.lead_paragraph,
                author: d.byline.and_then(|b| b.original),
                category: d.section_name,
                published: d.pub_date,
            })
            .collect())
    }
}

/// Owned counterpart of [`RawItem`], since the two endpoints differ in shape.
struct RawOwned {
    title: Option<String>,
    url: Option<String>,
    description: Option<String>,
    content: Option<String>,
    author: Option<String>,
    category: Option<String>,
    published: Option<String>,
}

#[async_trait]
impl NewsProvider for NyTimesClient {
    fn name(&self) -> &'static str {
        "nytimes"
    }

    fn display_name(&self) -> &'static str {
        "The New York Times"
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<ProviderArticle>, ProviderError> {
        let items = match &request.query {
            Some(q) => self.search(q).await?,
            None => self.top_stories().await?,
        };

        let source = Self::source();
        let total = items.len();
        let articles: Vec<ProviderArticle> = items
            .iter()
            .take(request.page_size.max(1) as usize)
            .filter_map(|item| {
                let article = build_incoming(RawItem {
                    title: item.title.as_deref(),
                    url: item.url.as_deref(),
                    description: item.description.as_deref(),
                    content: item.content.as_deref(),
                    author: item.author.as_deref(),
                    category: item.category.as_deref(),
                    published: item.published.as_deref(),
                })?;
                Some(ProviderArticle {
                    source: source.clone(),
                    article,
                })
            })
            .collect();

        tracing::debug!(
            provider = self.name(),
            received = total,
            kept = articles.len(),
            "NYTimes items mapped"
        );
        Ok(articles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TOP_STORIES: &str = r#"{
        "status": "OK",
        "results": [
            {
                "section": "business",
                "title": "Markets slide",
                "abstract": "Stocks fell sharply.",
                "url": "https://www.nytimes.com/2024/03/01/business/markets.html",
                "byline": "By John Smith",
                "published_date": "2024-03-01T07:00:00-05:00"
            },
            {
                "section": "admin",
                "title": "",
                "url": "https://www.nytimes.com/empty"
            }
        ]
    }"#;

    fn client(server: &MockServer) -> NyTimesClient {
        NyTimesClient::new(reqwest::Client::new(), SecretString::from("nyt"), &server.uri(), "home")
            .unwrap()
    }

    #[tokio::test]
    async fn test_top_stories() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/svc/topstories/v2/home.json"))
            .and(query_param("api-key", "nyt"))
            .respond_with(ResponseTemplate::new(200).set_body_string(TOP_STORIES))
            .mount(&server)
            .await;

        let articles = client(&server).fetch(&FetchRequest::default()).await.unwrap();
        assert_eq!(articles.len(), 1);
        let a = &articles[0].article;
        assert_eq!(a.title, "Markets slide");
        assert_eq!(a.author.as_deref(), Some("John Smith"));
        assert_eq!(a.category.as_deref(), Some("business"));
        assert_eq!(a.published_at, Some(1_709_294_400));
    }

    #[tokio::test]
    async fn test_article_search() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/svc/search/v2/articlesearch.json"))
            .and(query_param("q", "election"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"status":"OK","response":{"docs":[{
                    "web_url":"https://www.nytimes.com/2024/03/01/us/politics/vote.html",
                    "headline":{"main":"Voters head to polls"},
                    "abstract":"Turnout is high.",
                    "lead_paragraph":"Lines formed early.",
                    "byline":{"original":"By A Reporter"},
                    "pub_date":"2024-03-01T12:00:00+0000",
                    "section_name":"U.S."
                }]}}"#,
            ))
            .mount(&server)
            .await;

        let articles = client(&server)
            .fetch(&FetchRequest {
                query: Some("election".into()),
                page_size: 10,
            })
            .await
            .unwrap();
        assert_eq!(articles.len(), 1);
        assert_eq!(articles[0].article.title, "Voters head to polls");
        assert_eq!(articles[0].article.content.as_deref(), Some("Lines formed early."));
        assert_eq!(articles[0].article.published_at, Some(1_709_294_400));
    }

    #[test]
    fn test_rejects_bad_section() {
        let result = NyTimesClient::new(
            reqwest::Client::new(),
            SecretString::from("k"),
            "https://api.nytimes.com",
            "../etc",
        );
        assert!(result.is_err());
    }
}
