//! The run context threaded through every component.
//!
//! Configuration is read-only after startup; the article-id map is written
//! during enumeration and read-only thereafter. The store is the only
//! cross-component mutable state.

use crate::{api::SiteInfo, cache::Cache, config::Config, fetch::Client, store::Store, title};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Shared state for one run.
///
/// The client and store sit behind `Arc` because the enumeration phase
/// hands them to queue workers before this struct exists.
pub struct Context {
    pub config: Config,
    pub client: Arc<Client>,
    pub store: Arc<Store>,
    pub cache: Cache,
    pub site: SiteInfo,
    /// Wiki subtitle scraped from the base page.
    pub subtitle: String,
    /// Canonical main page title.
    pub main_page: String,
    /// Article-id map: canonical title → revision id, in discovery order.
    pub articles: IndexMap<String, u64>,
    /// True when enumeration ran by namespace rather than from a titles
    /// file; titles with a content-namespace prefix then count as mirrored.
    pub by_namespace: bool,
    /// Serialises the media width check-and-set against the store.
    pub media_lock: Mutex<()>,
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Context;
    use crate::{
        api::{NamespaceInfo, SiteInfo},
        cache::Cache,
        config::Config,
        fetch::Client,
        store::Store,
    };
    use parking_lot::Mutex;
    use std::{sync::Arc, time::Duration};

    /// Builds a context against a throwaway directory, with one mirrored
    /// article ("Paris") and one content namespace.
    pub fn context() -> (Context, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let argv: Vec<std::ffi::OsString> = vec![
            "--mwUrl".into(),
            "https://en.example.org".into(),
            "--adminEmail".into(),
            "admin@example.org".into(),
        ];
        let config = Config::from_args(pico_args::Arguments::from_vec(argv)).unwrap();
        let client = Arc::new(Client::new(
            "test/0",
            "en.example.org",
            true,
            Duration::from_secs(1),
        ));
        let store = Arc::new(Store::open("t_".to_string(), None).unwrap());
        let cache = Cache::prepare(dir.path().join("cache")).unwrap();
        let site = SiteInfo {
            main_page: "Main_Page".to_string(),
            site_name: "Example".to_string(),
            logo: None,
            lang: "en".to_string(),
            rtl: false,
            namespaces: vec![
                NamespaceInfo {
                    id: 0,
                    name: String::new(),
                    content: true,
                },
                NamespaceInfo {
                    id: 4,
                    name: "Project".to_string(),
                    content: false,
                },
            ],
        };
        let mut articles = indexmap::IndexMap::new();
        articles.insert("Paris".to_string(), 1u64);
        let ctx = Context {
            config,
            client,
            store,
            cache,
            site,
            subtitle: String::new(),
            main_page: "Main_Page".to_string(),
            articles,
            by_namespace: false,
            media_lock: Mutex::new(()),
        };
        (ctx, dir)
    }
}

impl Context {
    /// Returns true if `target` is (or will be) an article in this archive.
    pub fn is_mirrored(&self, target: &str) -> bool {
        if target.is_empty() {
            return false;
        }
        let canonical = title::normalize(target);
        if self.articles.contains_key(canonical.as_ref()) {
            return true;
        }
        self.by_namespace
            && canonical
                .split_once(':')
                .is_some_and(|(prefix, _)| {
                    self.site.is_content_namespace(&prefix.replace('_', " "))
                })
    }
}
