//! Title enumeration and redirect discovery.
//!
//! Two mutually exclusive modes: a titles file (one title per line) or the
//! wiki's own content namespaces via `generator=allpages`. Every discovered
//! title gets a redirect lookup on its own bounded queue; the enumeration
//! loop sleeps when that queue backs up past the high-water mark so the
//! redirect queue cannot grow without bound.

use crate::{
    api::{self, Api, PageDetails, SiteInfo},
    config::Config,
    fetch::Client,
    queue::WorkQueue,
    store::Store,
    title,
};
use indexmap::IndexMap;
use std::{sync::Arc, thread, time::Duration};

/// Pending redirect lookups beyond this make the enumerator sleep.
const REDIRECT_HIGH_WATER: usize = 30_000;

/// Errors that may occur during enumeration.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The wiki API failed in a way retries did not fix.
    #[error(transparent)]
    Api(#[from] api::Error),

    /// The titles file could not be read.
    #[error("{1}: cannot read titles file: {0}")]
    ArticleList(std::io::Error, std::path::PathBuf),

    /// The coordination store failed.
    #[error(transparent)]
    Store(#[from] crate::store::Error),
}

/// The result of enumeration.
pub struct Enumeration {
    /// Canonical title → revision id, in discovery order.
    pub articles: IndexMap<String, u64>,
    /// True when the namespaces were walked (file mode sets this false).
    pub by_namespace: bool,
}

/// Enumerates every article title, records its details in the store, and
/// discovers inbound redirects.
pub fn enumerate(
    config: &Config,
    client: &Arc<Client>,
    store: &Arc<Store>,
    site: &SiteInfo,
    main_page: &str,
) -> Result<Enumeration, Error> {
    let api = Api::new(config, client);
    let redirects = redirect_queue(config, client, store);
    let mut articles = IndexMap::new();

    let by_namespace = config.article_list.is_none();
    if let Some(path) = config.article_list.as_deref() {
        let list = std::fs::read_to_string(path)
            .map_err(|err| Error::ArticleList(err, path.to_path_buf()))?;
        for line in list.lines() {
            let requested = title::normalize(line);
            if requested.is_empty() {
                continue;
            }
            match api.page_details(&requested)? {
                Some(details) => {
                    record(store, &redirects, &mut articles, details)?;
                }
                None => log::warn!("{requested}: page is missing, skipping"),
            }
        }
    } else {
        for namespace in site.content_namespaces() {
            log::info!("Enumerating namespace {} ({})", namespace.id, namespace.name);
            let mut cont: Option<String> = None;
            loop {
                let batch = api.all_pages(namespace.id, cont.as_deref())?;
                for details in batch.pages {
                    record(store, &redirects, &mut articles, details)?;
                }
                match batch.next {
                    Some(next) => cont = Some(next),
                    None => break,
                }
            }
        }
    }

    // The main page is usually inside a content namespace, but not always.
    if !articles.contains_key(main_page) {
        match api.page_details(main_page)? {
            Some(details) => record(store, &redirects, &mut articles, details)?,
            None => log::warn!("{main_page}: main page is missing from the wiki"),
        }
    }

    log::info!(
        "Enumerated {} articles, waiting for redirect lookups",
        articles.len()
    );
    redirects.drain();
    redirects.shutdown();
    log::info!("Recorded {} redirects", store.redirects().len()?);

    Ok(Enumeration {
        articles,
        by_namespace,
    })
}

/// Records one discovered title: the id map, the details database, and a
/// redirect lookup.
fn record(
    store: &Store,
    redirects: &WorkQueue<String>,
    articles: &mut IndexMap<String, u64>,
    details: PageDetails,
) -> Result<(), Error> {
    let mut value = serde_json::Map::new();
    value.insert("t".to_string(), details.timestamp.into());
    if let Some((lat, lon)) = details.coordinates {
        value.insert("g".to_string(), format!("{lat};{lon}").into());
    }
    store.details().hset(
        &details.title,
        &serde_json::Value::Object(value).to_string(),
    )?;

    if let Some(delay) = backpressure_delay(redirects.len()) {
        log::debug!("Redirect queue is saturated, sleeping {delay:?}");
        thread::sleep(delay);
    }
    redirects.push(details.title.clone());

    articles.insert(details.title, details.revision);
    Ok(())
}

/// The enumeration throttle: one millisecond per pending lookup beyond the
/// high-water mark.
fn backpressure_delay(pending: usize) -> Option<Duration> {
    (pending > REDIRECT_HIGH_WATER)
        .then(|| Duration::from_millis((pending - REDIRECT_HIGH_WATER) as u64))
}

/// Spawns the redirect lookup queue (width `speed × 3`).
fn redirect_queue(
    config: &Config,
    client: &Arc<Client>,
    store: &Arc<Store>,
) -> WorkQueue<String> {
    let api_url = config.api_url();
    let client = Arc::clone(client);
    let store = Arc::clone(store);

    WorkQueue::new("redirects", config.speed * 3, move |target: String| {
        let url = api::backlinks_url(&api_url, &target);
        let payload = match client.fetch(&url) {
            Ok(payload) => payload,
            Err(err) => {
                // Missed redirects degrade the archive but do not stop it.
                log::error!("{err}");
                return;
            }
        };
        let sources = match api::parse_backlinks(&payload.body) {
            Ok(sources) => sources,
            Err(err) => {
                log::warn!("{url}: malformed backlinks response: {err}");
                return;
            }
        };

        let pairs = sources
            .iter()
            // A title redirecting to itself would shadow the article.
            .filter(|source| *source != &target)
            .map(|source| (source.as_str(), target.as_str()))
            .collect::<Vec<_>>();
        if pairs.is_empty() {
            return;
        }
        if let Err(err) = store.redirects().hmset(pairs) {
            // Coordination state cannot be partially rebuilt; stop the run.
            log::error!("{err}");
            std::process::exit(1);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backpressure_thresholds() {
        assert_eq!(backpressure_delay(0), None);
        assert_eq!(backpressure_delay(REDIRECT_HIGH_WATER), None);
        assert_eq!(
            backpressure_delay(REDIRECT_HIGH_WATER + 1),
            Some(Duration::from_millis(1))
        );
        assert_eq!(
            backpressure_delay(REDIRECT_HIGH_WATER + 2_000),
            Some(Duration::from_millis(2_000))
        );
    }
}
