//! Google results-page parsing.
//!
//! Everything in here is synchronous and infallible: malformed markup yields
//! fewer results, never an error. Deciding whether an empty page is suspicious
//! is left to the caller via [`Extraction::Degraded`].

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::models::{Location, MapPackResult, OrganicResult, SearchResult};

// Google ships unversioned markup; each list is tried in order.
const BLOCK_SELECTORS: &[&str] = &[
    "#search .g",
    "#search [jscontroller=\"SC7lYd\"]",
    "#rso > div",
];
const TITLE_SELECTORS: &[&str] = &["h3", "[role=\"heading\"]"];
const SNIPPET_SELECTORS: &[&str] = &[".VwiC3b", ".s3v9rd", "[data-sncf]", ".IsZvec", ".yXK7lf"];
const MAP_PACK_SELECTORS: &[&str] = &[".rllt__details"];
const MAP_TITLE_SELECTORS: &[&str] = &[".dbg0pd", ".OSrXXb"];

static BLOCKS: Lazy<Vec<Selector>> = Lazy::new(|| compile(BLOCK_SELECTORS));
static TITLES: Lazy<Vec<Selector>> = Lazy::new(|| compile(TITLE_SELECTORS));
static SNIPPETS: Lazy<Vec<Selector>> = Lazy::new(|| compile(SNIPPET_SELECTORS));
static MAP_PACK: Lazy<Vec<Selector>> = Lazy::new(|| compile(MAP_PACK_SELECTORS));
static MAP_TITLES: Lazy<Vec<Selector>> = Lazy::new(|| compile(MAP_TITLE_SELECTORS));
static LINKS: Lazy<Vec<Selector>> = Lazy::new(|| compile(&["a[href]"]));
static RESULT_STATS: Lazy<Vec<Selector>> = Lazy::new(|| compile(&["#result-stats"]));

static TOTAL_RESULTS: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(\d[\d,.]*)\s+results?").ok());

fn compile(list: &[&str]) -> Vec<Selector> {
    list.iter().filter_map(|css| Selector::parse(css).ok()).collect()
}

/// Parsed page, tagged by whether anything usable was found.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Complete(SearchResult),
    /// Neither organic nor map-pack results were found. Usually a changed
    /// layout or an interstitial the renderer did not recognise.
    Degraded(SearchResult),
}

impl Extraction {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Extraction::Degraded(_))
    }

    pub fn result(&self) -> &SearchResult {
        match self {
            Extraction::Complete(r) | Extraction::Degraded(r) => r,
        }
    }

    pub fn into_result(self) -> SearchResult {
        match self {
            Extraction::Complete(r) | Extraction::Degraded(r) => r,
        }
    }
}

/// Turn a rendered results page into a `SearchResult`.
pub fn extract(html: &str, keyword: &str, location: &Location) -> Extraction {
    let document = Html::parse_document(html);

    let mut result = SearchResult::empty(keyword, location);
    result.organic = extract_organic(&document);
    result.map_pack = extract_map_pack(&document);
    result.total_results = extract_total_results(&document);

    if result.is_empty() {
        Extraction::Degraded(result)
    } else {
        Extraction::Complete(result)
    }
}

fn extract_organic(document: &Html) -> Vec<OrganicResult> {
    for block_selector in BLOCKS.iter() {
        let mut organic: Vec<OrganicResult> = Vec::new();

        for block in document.select(block_selector) {
            if nested_in_match(&block, block_selector) {
                continue;
            }
            if let Some((title, url, snippet)) = parse_block(&block) {
                let domain = extract_domain(&url);
                organic.push(OrganicResult {
                    position: organic.len() as u32 + 1,
                    title,
                    url,
                    snippet,
                    domain,
                });
            }
        }

        if !organic.is_empty() {
            return organic;
        }
    }
    Vec::new()
}

/// (title, destination url, snippet) for a valid organic block.
fn parse_block(block: &ElementRef) -> Option<(String, String, String)> {
    let title = first_text(block, &TITLES)?;
    let href = LINKS
        .iter()
        .find_map(|sel| block.select(sel).next())
        .and_then(|a| a.value().attr("href"))
        .map(str::trim)
        .filter(|h| !h.is_empty())?;

    // Refinement links point back into the results page.
    if href.starts_with("/search") {
        return None;
    }

    let url = normalize_result_url(href);
    let snippet = first_text(block, &SNIPPETS).unwrap_or_default();
    Some((title, url, snippet))
}

fn extract_map_pack(document: &Html) -> Vec<MapPackResult> {
    let mut map_pack: Vec<MapPackResult> = Vec::new();

    for selector in MAP_PACK.iter() {
        for details in document.select(selector) {
            let Some(title) = first_text(&details, &MAP_TITLES) else {
                continue;
            };
            map_pack.push(MapPackResult {
                position: map_pack.len() as u32 + 1,
                address: map_pack_address(&details, &title),
                title,
            });
        }
        if !map_pack.is_empty() {
            break;
        }
    }
    map_pack
}

/// Google puts the address line in the last `div` child of the details block.
fn map_pack_address(details: &ElementRef, title: &str) -> String {
    let last_div = details
        .children()
        .filter_map(ElementRef::wrap)
        .filter(|child| child.value().name() == "div")
        .last();

    match last_div {
        Some(div) => {
            let text = clean_text(&div);
            if text == title {
                String::new()
            } else {
                text
            }
        }
        None => String::new(),
    }
}

fn extract_total_results(document: &Html) -> u64 {
    let Some(stats) = RESULT_STATS.iter().find_map(|sel| document.select(sel).next()) else {
        return 0;
    };
    parse_total_results(&clean_text(&stats))
}

/// Parse "About 1,234,567 results" into a count, 0 when the text doesn't match.
pub fn parse_total_results(text: &str) -> u64 {
    TOTAL_RESULTS
        .as_ref()
        .and_then(|re| re.captures(text))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().replace([',', '.'], ""))
        .and_then(|digits| digits.parse::<u64>().ok())
        .unwrap_or(0)
}

/// Unwrap Google's `/url?...&url=<dest>` indirection. Anything else is returned
/// as-is, as is a redirect whose target can't be recovered.
pub fn normalize_result_url(href: &str) -> String {
    let is_redirect = href.starts_with("/url?")
        || (href.contains("google.") && href.contains("/url?"));
    if !is_redirect {
        return href.to_string();
    }

    let parsed = Url::parse(href).or_else(|_| {
        Url::parse("https://www.google.com/").and_then(|base| base.join(href))
    });

    parsed
        .ok()
        .and_then(|url| {
            let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
            ["url", "q"].iter().find_map(|key| {
                pairs
                    .iter()
                    .find(|(k, v)| k == key && v.starts_with("http"))
                    .map(|(_, v)| v.clone())
            })
        })
        .unwrap_or_else(|| href.to_string())
}

/// Bare host of a result URL (`https://www.example.com/a` → `example.com`).
/// Unparsable input comes back unchanged.
pub fn extract_domain(url: &str) -> String {
    let candidate = if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{}", url)
    };

    match Url::parse(&candidate) {
        Ok(parsed) => match parsed.host_str() {
            Some(host) if !host.is_empty() => host.strip_prefix("www.").unwrap_or(host).to_string(),
            _ => url.to_string(),
        },
        Err(_) => url.to_string(),
    }
}

fn nested_in_match(element: &ElementRef, selector: &Selector) -> bool {
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .any(|ancestor| selector.matches(&ancestor))
}

fn first_text(scope: &ElementRef, candidates: &[Selector]) -> Option<String> {
    candidates.iter().find_map(|sel| {
        scope
            .select(sel)
            .map(|el| clean_text(&el))
            .find(|text| !text.is_empty())
    })
}

fn clean_text(element: &ElementRef) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}
