//! Typed access to the MediaWiki HTTP API.
//!
//! The `action=` endpoint answers enumeration and metadata queries; article
//! bodies come from the mobile-sections REST endpoint as `{lead, remaining}`
//! section lists. Namespace enumeration follows the old-style
//! `query-continue` token, which every MediaWiki version in the wild still
//! emits for `generator=allpages`.

use crate::{
    config::Config,
    fetch::{Client, Payload},
    title,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

/// Errors that may occur when talking to the wiki.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The download itself failed.
    #[error(transparent)]
    Fetch(#[from] crate::fetch::Error),

    /// The response was not the JSON shape the endpoint documents.
    #[error("{0}: malformed API response: {1}")]
    Json(String, serde_json::Error),

    /// The login handshake was refused.
    #[error("login failed: {0}")]
    Login(String),
}

/// A handle over the wiki's endpoints.
pub struct Api<'a> {
    config: &'a Config,
    client: &'a Client,
}

/// Everything `meta=siteinfo` tells us that the run needs.
#[derive(Debug)]
pub struct SiteInfo {
    /// Canonicalised main page title.
    pub main_page: String,
    /// Human-readable wiki name.
    pub site_name: String,
    /// Wiki logo URL, the default favicon source.
    pub logo: Option<String>,
    /// Content language code.
    pub lang: String,
    /// Right-to-left script.
    pub rtl: bool,
    /// All registered namespaces.
    pub namespaces: Vec<NamespaceInfo>,
}

impl SiteInfo {
    /// The namespaces holding the wiki's main content.
    pub fn content_namespaces(&self) -> impl Iterator<Item = &NamespaceInfo> {
        self.namespaces.iter().filter(|ns| ns.content)
    }

    /// Returns true if `name` (the part of a title before `:`) names a
    /// content namespace.
    pub fn is_content_namespace(&self, name: &str) -> bool {
        self.content_namespaces()
            .any(|ns| !ns.name.is_empty() && ns.name.eq_ignore_ascii_case(name))
    }
}

/// One namespace from siteinfo.
#[derive(Debug)]
pub struct NamespaceInfo {
    pub id: i32,
    /// Display name, canonical spelling (spaces, not underscores).
    pub name: String,
    /// Whether pages here count as main wiki content.
    pub content: bool,
}

/// Revision metadata for one discovered title.
#[derive(Debug)]
pub struct PageDetails {
    /// Canonicalised title (spaces already folded to underscores).
    pub title: String,
    /// Latest revision id.
    pub revision: u64,
    /// Latest revision time, UNIX seconds.
    pub timestamp: i64,
    /// Page coordinates, when the wiki records them.
    pub coordinates: Option<(f64, f64)>,
}

/// One page of `generator=allpages` results.
#[derive(Debug)]
pub struct AllPagesBatch {
    pub pages: Vec<PageDetails>,
    /// Token to pass back for the next page, if any.
    pub next: Option<String>,
}

impl<'a> Api<'a> {
    /// Creates the handle.
    pub fn new(config: &'a Config, client: &'a Client) -> Self {
        Self { config, client }
    }

    /// Performs the legacy `action=login` handshake. The session cookie
    /// lands in the client's cookie store and rides every later request.
    pub fn login(&self) -> Result<(), Error> {
        let Some(username) = self.config.mw_username.as_deref() else {
            return Ok(());
        };
        let password = self.config.mw_password.as_deref().unwrap_or_default();
        let url = format!("{}?action=login&format=json", self.config.api_url());

        let mut form = vec![("lgname", username), ("lgpassword", password)];
        if let Some(domain) = self.config.mw_domain.as_deref() {
            form.push(("lgdomain", domain));
        }

        let first: wire::Login = json(&url, &self.client.post_form(&url, &form)?)?;
        let token = match first.login {
            wire::LoginInner {
                result,
                token: Some(token),
            } if result == "NeedToken" => token,
            wire::LoginInner { result, .. } if result == "Success" => return Ok(()),
            wire::LoginInner { result, .. } => return Err(Error::Login(result)),
        };

        let mut form = form.clone();
        form.push(("lgtoken", token.as_str()));
        let second: wire::Login = json(&url, &self.client.post_form(&url, &form)?)?;
        if second.login.result == "Success" {
            log::info!("Logged in as {username}");
            Ok(())
        } else {
            Err(Error::Login(second.login.result))
        }
    }

    /// Fetches site metadata.
    pub fn site_info(&self) -> Result<SiteInfo, Error> {
        let url = format!(
            "{}?action=query&meta=siteinfo&siprop=general%7Cnamespaces\
             &format=json&formatversion=2",
            self.config.api_url()
        );
        let response: wire::SiteInfo = json(&url, &self.client.fetch(&url)?)?;
        let general = response.query.general;

        let namespaces = response
            .query
            .namespaces
            .into_values()
            .map(|ns| NamespaceInfo {
                id: ns.id,
                name: ns.name,
                content: ns.content,
            })
            .collect();

        Ok(SiteInfo {
            main_page: title::normalize(&general.mainpage).into_owned(),
            site_name: general.sitename,
            logo: general.logo,
            lang: general.lang,
            rtl: general.rtl,
            namespaces,
        })
    }

    /// Scrapes the wiki's subtitle (the `siteSub` element of the base
    /// page). Best-effort: a missing subtitle is an empty string.
    pub fn sub_title(&self) -> String {
        let payload = self.client.fetch_or_empty(&self.config.mw_url);
        let html = String::from_utf8_lossy(&payload.body);
        let pattern = regex::Regex::new(r#"id="siteSub"[^>]*>([^<]*)<"#)
            .expect("the siteSub pattern is well-formed");
        pattern
            .captures(&html)
            .map(|captures| captures[1].trim().to_string())
            .unwrap_or_default()
    }

    /// Resolves one title (following wiki redirects) to its revision
    /// details. `Ok(None)` means the wiki reports the page missing.
    pub fn page_details(&self, page_title: &str) -> Result<Option<PageDetails>, Error> {
        let url = format!(
            "{}?action=query&redirects=&prop=revisions%7Ccoordinates\
             &rvprop=ids%7Ctimestamp&titles={}&format=json",
            self.config.api_url(),
            title::url_encode(&title::with_spaces(page_title)),
        );
        let response: wire::Pages = json(&url, &self.client.fetch(&url)?)?;
        let pages = response.query.map(|query| query.pages).unwrap_or_default();
        Ok(pages.into_values().next().and_then(into_details))
    }

    /// Fetches one batch of non-redirect pages from a namespace.
    pub fn all_pages(&self, namespace: i32, cont: Option<&str>) -> Result<AllPagesBatch, Error> {
        let mut url = format!(
            "{}?action=query&generator=allpages&gapfilterredir=nonredirects\
             &gaplimit=max&gapnamespace={namespace}&prop=revisions%7Ccoordinates\
             &rvprop=ids%7Ctimestamp&format=json",
            self.config.api_url(),
        );
        if let Some(cont) = cont {
            use core::fmt::Write as _;
            write!(url, "&gapcontinue={}", title::url_encode(cont))
                .expect("writing to a String cannot fail");
        }

        let response: wire::Pages = json(&url, &self.client.fetch(&url)?)?;
        let pages = response
            .query
            .map(|query| query.pages)
            .unwrap_or_default()
            .into_values()
            .filter_map(into_details)
            .collect();
        let next = response
            .cont
            .map(|cont| cont.allpages.gapcontinue);

        Ok(AllPagesBatch { pages, next })
    }

    /// The mobile-sections URL for a title.
    pub fn sections_url(&self, page_title: &str) -> String {
        format!(
            "{}{}",
            self.config.rest_url(),
            title::url_encode(page_title)
        )
    }

}

/// Parses a mobile-sections body. `None` means the endpoint answered
/// without a lead section, which drops the title from the run.
pub fn parse_sections(body: &[u8]) -> Option<Article> {
    let parsed = serde_json::from_slice::<Article>(body).ok()?;
    parsed.lead.is_some().then_some(parsed)
}

/// The redirect-discovery URL for a title. A free function so queue
/// workers can build requests without borrowing the whole configuration.
pub fn backlinks_url(api_url: &str, page_title: &str) -> String {
    format!(
        "{api_url}?action=query&list=backlinks&blfilterredir=redirects&bllimit=max\
         &bltitle={}&format=json&formatversion=2",
        title::url_encode(&title::with_spaces(page_title)),
    )
}

/// Parses a backlinks response into canonicalised source titles.
pub fn parse_backlinks(body: &[u8]) -> Result<Vec<String>, serde_json::Error> {
    let response: wire::Backlinks = serde_json::from_slice(body)?;
    Ok(response
        .query
        .map(|query| query.backlinks)
        .unwrap_or_default()
        .into_iter()
        .map(|backlink| title::normalize(&backlink.title).into_owned())
        .collect())
}

/// Converts a raw page node into [`PageDetails`], dropping pages that the
/// wiki reports missing or revision-less.
fn into_details(page: wire::Page) -> Option<PageDetails> {
    if page.missing.is_some() {
        return None;
    }
    let revision = page.revisions?.into_iter().next()?;
    let timestamp = OffsetDateTime::parse(&revision.timestamp, &Rfc3339)
        .map(OffsetDateTime::unix_timestamp)
        .ok()?;
    let coordinates = page
        .coordinates
        .and_then(|coords| coords.into_iter().next())
        .map(|coord| (coord.lat, coord.lon));

    Some(PageDetails {
        title: title::normalize(&page.title).into_owned(),
        revision: revision.revid,
        timestamp,
        coordinates,
    })
}

/// Deserialises a payload, labelling parse failures with their URL.
fn json<T: serde::de::DeserializeOwned>(url: &str, payload: &Payload) -> Result<T, Error> {
    payload
        .json()
        .map_err(|err| Error::Json(url.to_string(), err))
}

/// An article from the mobile-sections endpoint.
///
/// Unknown fields are preserved through `extra` so a rewrite is a pure
/// transformation of the section texts.
#[derive(Debug, Deserialize, Serialize)]
pub struct Article {
    pub lead: Option<Lead>,
    #[serde(default)]
    pub remaining: Remaining,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The lead block: the first section plus article-level metadata.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Lead {
    #[serde(default)]
    pub sections: Vec<Section>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displaytitle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<LeadImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pronunciation: Option<Pronunciation>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The sections after the lead.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Remaining {
    #[serde(default)]
    pub sections: Vec<Section>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One article section.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Section {
    #[serde(default)]
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toclevel: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The lead image in its various renditions, keyed by width.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LeadImage {
    #[serde(default)]
    pub urls: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A pronunciation audio link in the lead.
#[derive(Debug, Deserialize, Serialize)]
pub struct Pronunciation {
    pub url: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Wire shapes of the `action=` endpoint.
mod wire {
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Deserialize)]
    pub(super) struct Login {
        pub login: LoginInner,
    }

    #[derive(Deserialize)]
    pub(super) struct LoginInner {
        pub result: String,
        #[serde(default)]
        pub token: Option<String>,
    }

    #[derive(Deserialize)]
    pub(super) struct SiteInfo {
        pub query: SiteInfoQuery,
    }

    #[derive(Deserialize)]
    pub(super) struct SiteInfoQuery {
        pub general: General,
        pub namespaces: BTreeMap<String, Namespace>,
    }

    #[derive(Deserialize)]
    pub(super) struct General {
        pub mainpage: String,
        pub sitename: String,
        #[serde(default)]
        pub logo: Option<String>,
        pub lang: String,
        #[serde(default)]
        pub rtl: bool,
    }

    #[derive(Deserialize)]
    pub(super) struct Namespace {
        pub id: i32,
        pub name: String,
        #[serde(default)]
        pub content: bool,
    }

    /// `action=query` responses carrying a pages map, format version 1:
    /// pages keyed by page id, continuation under `query-continue`.
    #[derive(Deserialize)]
    pub(super) struct Pages {
        #[serde(default)]
        pub query: Option<PagesQuery>,
        #[serde(default, rename = "query-continue")]
        pub cont: Option<QueryContinue>,
    }

    #[derive(Deserialize)]
    pub(super) struct PagesQuery {
        #[serde(default)]
        pub pages: BTreeMap<String, Page>,
    }

    #[derive(Deserialize)]
    pub(super) struct Page {
        pub title: String,
        #[serde(default)]
        pub missing: Option<serde_json::Value>,
        #[serde(default)]
        pub revisions: Option<Vec<Revision>>,
        #[serde(default)]
        pub coordinates: Option<Vec<Coordinates>>,
    }

    #[derive(Deserialize)]
    pub(super) struct Revision {
        pub revid: u64,
        pub timestamp: String,
    }

    #[derive(Deserialize)]
    pub(super) struct Coordinates {
        pub lat: f64,
        pub lon: f64,
    }

    #[derive(Deserialize)]
    pub(super) struct QueryContinue {
        pub allpages: AllPagesContinue,
    }

    #[derive(Deserialize)]
    pub(super) struct AllPagesContinue {
        pub gapcontinue: String,
    }

    #[derive(Deserialize)]
    pub(super) struct Backlinks {
        #[serde(default)]
        pub query: Option<BacklinksQuery>,
    }

    #[derive(Deserialize)]
    pub(super) struct BacklinksQuery {
        #[serde(default)]
        pub backlinks: Vec<Backlink>,
    }

    #[derive(Deserialize)]
    pub(super) struct Backlink {
        pub title: String,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_details_drops_missing_pages() {
        let page: wire::Page = serde_json::from_str(
            r#"{"title": "Ghost", "missing": ""}"#,
        )
        .unwrap();
        assert!(super::into_details(page).is_none());
    }

    #[test]
    fn page_details_parses_revision_and_coordinates() {
        let page: wire::Page = serde_json::from_str(
            r#"{
                "title": "Eiffel Tower",
                "revisions": [{"revid": 42, "timestamp": "2020-06-01T12:00:00Z"}],
                "coordinates": [{"lat": 48.858, "lon": 2.294}]
            }"#,
        )
        .unwrap();
        let details = super::into_details(page).unwrap();
        assert_eq!(details.title, "Eiffel_Tower");
        assert_eq!(details.revision, 42);
        assert_eq!(details.timestamp, 1_591_012_800);
        assert_eq!(details.coordinates, Some((48.858, 2.294)));
    }

    #[test]
    fn allpages_continue_parses() {
        let response: wire::Pages = serde_json::from_str(
            r#"{
                "query": {"pages": {"1": {
                    "title": "A",
                    "revisions": [{"revid": 1, "timestamp": "2020-01-01T00:00:00Z"}]
                }}},
                "query-continue": {"allpages": {"gapcontinue": "B"}}
            }"#,
        )
        .unwrap();
        assert_eq!(response.cont.unwrap().allpages.gapcontinue, "B");
        assert_eq!(response.query.unwrap().pages.len(), 1);
    }

    #[test]
    fn article_round_trips_unknown_fields() {
        let raw = r#"{
            "lead": {
                "displaytitle": "Foo",
                "ns": 0,
                "sections": [{"id": 0, "text": "<p>hi</p>"}]
            },
            "remaining": {"sections": []}
        }"#;
        let article: Article = serde_json::from_str(raw).unwrap();
        let lead = article.lead.as_ref().unwrap();
        assert_eq!(lead.sections.len(), 1);
        // The unmodelled "ns" field must survive a round trip.
        assert_eq!(lead.extra.get("ns"), Some(&serde_json::json!(0)));
        let out = serde_json::to_value(&article).unwrap();
        assert_eq!(out["lead"]["ns"], serde_json::json!(0));
    }

    #[test]
    fn article_without_lead_is_dropped() {
        let raw = br#"{"error": {"code": "not_found"}}"#;
        let article = serde_json::from_slice::<Article>(raw).unwrap();
        assert!(article.lead.is_none());
    }
}
