//! URL-context gathering: pages referenced in the user's request are fetched
//! in parallel before the first agent turn, each with its own deadline. A
//! slow or failing fetch degrades to "no context" and never stalls the run.

use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use regex::Regex;
use tracing::warn;

/// Characters kept per fetched page; anything past this is noise for the
/// agent and burns prompt budget.
const MAX_PAGE_CHARS: usize = 4000;

static URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s<>"')\]]+"#).expect("valid url pattern")
});

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub content: String,
}

#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage>;
}

/// URLs mentioned in free text, with trailing sentence punctuation stripped.
pub fn extract_urls(text: &str) -> Vec<String> {
    URL_PATTERN
        .find_iter(text)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';', ':']).to_string())
        .collect()
}

/// Fetch every URL concurrently. Each fetch races its own deadline; failures
/// and timeouts drop that page rather than failing the batch.
pub async fn gather_context(
    fetcher: &dyn ContentFetcher,
    urls: &[String],
    deadline: Duration,
) -> Vec<FetchedPage> {
    let fetches = urls.iter().map(|url| async move {
        match tokio::time::timeout(deadline, fetcher.fetch(url)).await {
            Ok(Ok(page)) => Some(page),
            Ok(Err(e)) => {
                warn!(%url, "context fetch failed: {e}");
                None
            }
            Err(_) => {
                warn!(%url, "context fetch timed out");
                None
            }
        }
    });
    join_all(fetches).await.into_iter().flatten().collect()
}

/// Render fetched pages into a prompt section, or nothing when every fetch
/// degraded.
pub fn render_context(pages: &[FetchedPage]) -> Option<String> {
    if pages.is_empty() {
        return None;
    }
    let sections: Vec<String> = pages
        .iter()
        .map(|page| format!("## {}\n{}", page.url, page.content.trim()))
        .collect();
    Some(format!(
        "Reference content fetched from URLs in the request:\n\n{}",
        sections.join("\n\n")
    ))
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContentFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", url))?
            .error_for_status()
            .with_context(|| format!("Fetch of {} returned an error status", url))?;
        let text = response
            .text()
            .await
            .with_context(|| format!("Failed to read body of {}", url))?;
        Ok(FetchedPage {
            url: url.to_string(),
            content: text.chars().take(MAX_PAGE_CHARS).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct StaticFetcher {
        pages: HashMap<String, String>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl ContentFetcher for StaticFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedPage> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match self.pages.get(url) {
                Some(content) => Ok(FetchedPage {
                    url: url.to_string(),
                    content: content.clone(),
                }),
                None => anyhow::bail!("no such page: {}", url),
            }
        }
    }

    #[test]
    fn test_extract_urls() {
        let text = "Clone https://example.com/app, style it like \
                    https://other.dev/theme. Nothing else.";
        assert_eq!(
            extract_urls(text),
            vec!["https://example.com/app", "https://other.dev/theme"]
        );
        assert!(extract_urls("no links here").is_empty());
    }

    #[tokio::test]
    async fn test_gather_context_collects_pages() {
        let mut pages = HashMap::new();
        pages.insert("https://a.test".to_string(), "alpha".to_string());
        let fetcher = StaticFetcher { pages, delay: None };
        let urls = vec!["https://a.test".to_string()];
        let fetched = gather_context(&fetcher, &urls, Duration::from_secs(1)).await;
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].content, "alpha");
    }

    #[tokio::test]
    async fn test_gather_context_drops_failures() {
        let mut pages = HashMap::new();
        pages.insert("https://a.test".to_string(), "alpha".to_string());
        let fetcher = StaticFetcher { pages, delay: None };
        let urls = vec!["https://a.test".to_string(), "https://missing.test".to_string()];
        let fetched = gather_context(&fetcher, &urls, Duration::from_secs(1)).await;
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].url, "https://a.test");
    }

    #[tokio::test]
    async fn test_gather_context_drops_slow_fetches() {
        let mut pages = HashMap::new();
        pages.insert("https://slow.test".to_string(), "late".to_string());
        let fetcher = StaticFetcher {
            pages,
            delay: Some(Duration::from_millis(200)),
        };
        let urls = vec!["https://slow.test".to_string()];
        let fetched = gather_context(&fetcher, &urls, Duration::from_millis(20)).await;
        assert!(fetched.is_empty());
    }

    #[test]
    fn test_render_context() {
        assert!(render_context(&[]).is_none());
        let rendered = render_context(&[FetchedPage {
            url: "https://a.test".into(),
            content: "alpha\n".into(),
        }])
        .unwrap();
        assert!(rendered.contains("## https://a.test"));
        assert!(rendered.contains("alpha"));
    }
}
