//! WebObs results-page sources, the page parser and the acquisition loop.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tabby_core::{Observation, ParseError};
use tabby_storage::{ArtifactStore, FetchError, HttpFetcher};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "tabby-adapters";

pub const DEFAULT_BASE_URL: &str = "https://www.aavso.org/apps/webobs/results/";
pub const DEFAULT_STAR: &str = "KIC 8462852";

/// Observation rows of a results page. Detail rows carry other classes.
pub const ROW_SELECTOR: &str = "tr.obs.tr-even";

/// Text of the pagination link shown while more pages exist.
pub const NEXT_PAGE_TEXT: &str = "Next";

/// Cells per observation row: details, star, JD, date, magnitude, error,
/// filter, observer, comparison star. Only the first eight are required.
const MIN_CELLS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPage {
    pub page: u32,
    pub url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

/// The six text fields of one observation row, untrimmed and unparsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRow {
    pub timestamp: String,
    pub calendar_label: String,
    pub magnitude: String,
    pub uncertainty: String,
    pub band: String,
    pub observer_id: String,
}

impl RawRow {
    pub fn to_observation(&self) -> Result<Observation, ParseError> {
        Observation::new(
            &self.timestamp,
            &self.calendar_label,
            &self.magnitude,
            &self.uncertainty,
            &self.band,
            &self.observer_id,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPage {
    pub rows: Vec<RawRow>,
    pub has_next: bool,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid selector {selector:?}: {message}")]
    Selector { selector: String, message: String },
    #[error("page {page} row {row}: expected at least 8 cells, found {cells}")]
    MalformedRow { page: u32, row: usize, cells: usize },
    #[error("page {page} row {row}: {source}")]
    Parse {
        page: u32,
        row: usize,
        #[source]
        source: ParseError,
    },
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Message(String),
    #[error("stopped after {limit} pages while the source still reported a next page")]
    PageLimit { limit: u32 },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// A paginated source of results pages for one star.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Stable identifier, used to group archived pages.
    fn source_id(&self) -> &str;

    async fn fetch_page(&self, page: u32) -> Result<RawPage, AdapterError>;
}

/// Live WebObs results pages fetched over HTTP.
#[derive(Debug, Clone)]
pub struct WebObsSource {
    http: HttpFetcher,
    base_url: String,
    star: String,
    source_id: String,
}

impl WebObsSource {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>, star: impl Into<String>) -> Self {
        let star = star.into();
        Self {
            http,
            base_url: base_url.into(),
            source_id: source_slug(&star),
            star,
        }
    }

    pub fn page_url(&self, page: u32) -> Result<String, AdapterError> {
        let page = page.to_string();
        let url = reqwest::Url::parse_with_params(
            &self.base_url,
            [("star", self.star.as_str()), ("page", page.as_str())],
        )
        .map_err(|e| AdapterError::Message(format!("invalid base url {:?}: {e}", self.base_url)))?;
        Ok(url.to_string())
    }
}

#[async_trait]
impl PageSource for WebObsSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_page(&self, page: u32) -> Result<RawPage, AdapterError> {
        let url = self.page_url(page)?;
        let fetched_at = Utc::now();
        let response = self.http.fetch_bytes(&url).await?;
        Ok(RawPage {
            page,
            url: response.final_url.clone(),
            body: response.text(),
            fetched_at,
        })
    }
}

/// Saved results pages named `page-<n>.html` in one directory.
#[derive(Debug, Clone)]
pub struct FixtureDirSource {
    dir: PathBuf,
    source_id: String,
}

impl FixtureDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "fixtures".to_string());
        Self {
            source_id: source_slug(&name),
            dir,
        }
    }

    pub fn page_path(&self, page: u32) -> PathBuf {
        self.dir.join(format!("page-{page}.html"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl PageSource for FixtureDirSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_page(&self, page: u32) -> Result<RawPage, AdapterError> {
        let path = self.page_path(page);
        let body = tokio::fs::read_to_string(&path).await.map_err(|source| AdapterError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(RawPage {
            page,
            url: path.display().to_string(),
            body,
            fetched_at: Utc::now(),
        })
    }
}

/// Lowercase ASCII slug of a star name, e.g. `KIC 8462852` -> `kic-8462852`.
pub fn source_slug(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

fn selector(raw: &str) -> Result<Selector, AdapterError> {
    Selector::parse(raw).map_err(|e| AdapterError::Selector {
        selector: raw.to_string(),
        message: e.to_string(),
    })
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>()
}

/// Extract observation rows and the "has next page" signal from one page.
pub fn parse_results_page(page: u32, html: &str) -> Result<ParsedPage, AdapterError> {
    let document = Html::parse_document(html);
    let row_sel = selector(ROW_SELECTOR)?;
    let link_sel = selector("a")?;

    let mut rows = Vec::new();
    for (idx, tr) in document.select(&row_sel).enumerate() {
        let cells = tr
            .children()
            .filter_map(ElementRef::wrap)
            .filter(|el| el.value().name() == "td")
            .collect::<Vec<_>>();
        if cells.len() < MIN_CELLS {
            return Err(AdapterError::MalformedRow {
                page,
                row: idx + 1,
                cells: cells.len(),
            });
        }

        // The magnitude is rendered as a link to the observation details.
        let magnitude = cells[4]
            .select(&link_sel)
            .next()
            .map(element_text)
            .unwrap_or_else(|| element_text(cells[4]));

        rows.push(RawRow {
            timestamp: element_text(cells[2]),
            calendar_label: element_text(cells[3]),
            magnitude,
            uncertainty: element_text(cells[5]),
            band: element_text(cells[6]),
            observer_id: element_text(cells[7]),
        });
    }

    let has_next = document
        .root_element()
        .text()
        .any(|text| text.trim() == NEXT_PAGE_TEXT);

    Ok(ParsedPage { rows, has_next })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquireOptions {
    pub start_page: u32,
    pub max_pages: u32,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            start_page: 1,
            max_pages: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Acquired {
    /// Every row of every page, in page order, duplicates included.
    pub observations: Vec<Observation>,
    pub pages_fetched: u32,
    pub archived_pages: usize,
}

/// Walk the source page by page until it stops reporting a next page.
///
/// Pages are fetched one after another. Any fetch, markup or parse failure
/// aborts the walk, so callers never see a partial scrape.
pub async fn acquire(
    source: &dyn PageSource,
    options: AcquireOptions,
    archive: Option<&ArtifactStore>,
) -> Result<Acquired, AdapterError> {
    let mut observations = Vec::new();
    let mut pages_fetched = 0u32;
    let mut archived_pages = 0usize;
    let mut page = options.start_page;

    loop {
        info!(source = source.source_id(), page, "fetching page");
        let raw = source.fetch_page(page).await?;
        pages_fetched += 1;

        if let Some(archive) = archive {
            archive
                .store_page(raw.fetched_at, source.source_id(), page, "html", raw.body.as_bytes())
                .await?;
            archived_pages += 1;
        }

        let parsed = parse_results_page(page, &raw.body)?;
        debug!(page, rows = parsed.rows.len(), has_next = parsed.has_next, "parsed page");

        for (idx, row) in parsed.rows.iter().enumerate() {
            let obs = row.to_observation().map_err(|source| AdapterError::Parse {
                page,
                row: idx + 1,
                source,
            })?;
            observations.push(obs);
        }

        if !parsed.has_next {
            break;
        }
        if pages_fetched >= options.max_pages {
            return Err(AdapterError::PageLimit {
                limit: options.max_pages,
            });
        }
        page += 1;
    }

    Ok(Acquired {
        observations,
        pages_fetched,
        archived_pages,
    })
}
