use async_trait::async_trait;
use chrono::{DateTime, Utc};
use signal_core::{NewsItem, NewsSource, SignalError};
use std::collections::BTreeSet;

use crate::{PolygonArticle, PolygonClient};

/// Polygon `/v2/reference/news` as a pull-based news source
#[derive(Clone)]
pub struct PolygonNewsSource {
    client: PolygonClient,
}

impl PolygonNewsSource {
    pub fn new(client: PolygonClient) -> Self {
        Self { client }
    }
}

/// Convert a Polygon article into a source-qualified `NewsItem`.
pub fn to_news_item(article: PolygonArticle) -> Result<NewsItem, SignalError> {
    let published_at = DateTime::parse_from_rfc3339(&article.published_utc)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            SignalError::InvalidData(format!(
                "article {} has bad published_utc '{}': {}",
                article.id, article.published_utc, e
            ))
        })?;

    let tickers: BTreeSet<String> = article
        .tickers
        .into_iter()
        .map(|t| t.trim().to_uppercase())
        .filter(|t| !t.is_empty())
        .collect();

    Ok(NewsItem {
        id: format!("polygon:{}", article.id),
        title: article.title,
        body: article.description.unwrap_or_default(),
        source: article
            .publisher
            .map(|p| p.name)
            .unwrap_or_else(|| "polygon".to_string()),
        published_at,
        tickers,
    })
}

#[async_trait]
impl NewsSource for PolygonNewsSource {
    async fn fetch_since(
        &self,
        cursor: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<NewsItem>, SignalError> {
        let articles = self.client.get_news_since(cursor, limit).await?;

        let mut items = Vec::with_capacity(articles.len());
        for article in articles {
            match to_news_item(article) {
                Ok(item) => items.push(item),
                Err(e) => tracing::warn!("Dropping unusable Polygon article: {}", e),
            }
        }

        // Polygon sorts server-side; keep the contract even if it doesn't
        items.sort_by(|a, b| a.published_at.cmp(&b.published_at));
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Publisher;

    fn article(published: &str) -> PolygonArticle {
        PolygonArticle {
            id: "abc".to_string(),
            title: "Oil jumps after OPEC cut".to_string(),
            author: Some("Jane Doe".to_string()),
            published_utc: published.to_string(),
            article_url: None,
            description: None,
            tickers: vec![" xom ".to_string(), "".to_string(), "CVX".to_string()],
            publisher: Some(Publisher { name: "Bloomberg".to_string() }),
        }
    }

    #[test]
    fn test_article_mapping() {
        let item = to_news_item(article("2024-06-03T12:00:00Z")).unwrap();
        assert_eq!(item.id, "polygon:abc");
        assert_eq!(item.source, "Bloomberg");
        assert_eq!(item.body, "");
        assert_eq!(item.text(), "Oil jumps after OPEC cut");
        assert_eq!(
            item.tickers.into_iter().collect::<Vec<_>>(),
            vec!["CVX".to_string(), "XOM".to_string()]
        );
    }

    #[test]
    fn test_bad_timestamp_rejected() {
        assert!(matches!(
            to_news_item(article("yesterday")),
            Err(SignalError::InvalidData(_))
        ));
    }
}
