//! Demo data: an in-memory article table and a word-count computation
//! cached per author.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use compute_cache::{ChangeBus, ChangeKind, Computation, Parameters, Source, Version};

/// Simulated cost of scanning the table.
const SCAN_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct Article {
    pub author: String,
    pub body: String,
}

/// Article table that reports its writes on a change bus.
pub struct ArticleTable {
    rows: RwLock<Vec<Article>>,
    revision: AtomicU64,
    bus: ChangeBus,
}

impl ArticleTable {
    pub fn source() -> Source {
        Source::model("blog", "article")
    }

    pub fn seeded(bus: ChangeBus) -> Self {
        let rows = vec![
            Article {
                author: "ana".into(),
                body: "caching turns slow reports into fast ones".into(),
            },
            Article {
                author: "ana".into(),
                body: "versions make invalidation cheap".into(),
            },
            Article {
                author: "bruno".into(),
                body: "single flight keeps the database calm".into(),
            },
        ];

        Self {
            rows: RwLock::new(rows),
            revision: AtomicU64::new(1),
            bus,
        }
    }

    pub fn insert(&self, article: Article) {
        self.rows.write().push(article);
        self.revision.fetch_add(1, Ordering::SeqCst);
        self.bus.notify(&Self::source(), ChangeKind::Saved);
    }

    pub fn delete_by(&self, author: &str) {
        self.rows.write().retain(|a| a.author != author);
        self.revision.fetch_add(1, Ordering::SeqCst);
        self.bus.notify(&Self::source(), ChangeKind::Deleted);
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordCount {
    pub articles: usize,
    pub words: usize,
}

/// Counts an author's articles and words.
///
/// Parameters: the author as first positional argument, optionally
/// `min_words` to skip short articles.
pub struct AuthorWordCount {
    table: Arc<ArticleTable>,
}

impl AuthorWordCount {
    pub fn new(table: Arc<ArticleTable>) -> Self {
        Self { table }
    }
}

impl Computation for AuthorWordCount {
    const KIND: &'static str = "author_word_count";
    type Params = Parameters;
    type Output = WordCount;

    async fn run(&self, params: &Parameters) -> Result<WordCount> {
        let author = params
            .positional()
            .first()
            .and_then(|v| v.as_str())
            .context("author argument missing")?
            .to_string();
        let min_words = params
            .get("min_words")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;

        debug!("Scanning articles for {}", author);
        tokio::time::sleep(SCAN_DELAY).await;

        let rows = self.table.rows.read();
        let counts: Vec<usize> = rows
            .iter()
            .filter(|a| a.author == author)
            .map(|a| a.body.split_whitespace().count())
            .filter(|&words| words >= min_words)
            .collect();

        Ok(WordCount {
            articles: counts.len(),
            words: counts.iter().sum(),
        })
    }

    fn version(&self, _params: &Parameters) -> Version {
        Version(self.table.revision())
    }

    fn invalidation_sources(&self, _params: &Parameters) -> Vec<Source> {
        vec![ArticleTable::source()]
    }
}
