//! The HTML rewriter: turns one article's API sections into offline pages.
//!
//! Each section's HTML passes through the same fixed pipeline: media
//! elements are rewritten against the local media tree (scheduling the
//! actual downloads), geo-enabled external links become `geo:` URLs, the
//! blacklists prune navigation chrome, and the cleaned sections are
//! assembled into a page under the output tree. The pipeline is
//! deterministic: rewriting the same input twice yields identical bytes.

use crate::{
    api::{Article, Section},
    config::Variant,
    context::Context,
    dom::{self, Fragment, NodeId},
    media,
    queue::WorkQueue,
    title,
};
use std::{collections::HashSet, io::Write as _, path::Path, sync::LazyLock};

/// Nodes with these ids are always deleted.
static ID_BLACKLIST: phf::Set<&'static str> = phf::phf_set! {
    "purgelink",
};

/// Nodes with any of these classes are always deleted.
static CLASS_BLACKLIST: phf::Set<&'static str> = phf::phf_set! {
    "noprint", "metadata", "ambox", "stub", "topicon", "magnify", "navbar",
    "mwe-math-mathml-inline",
};

/// Nodes with any of these classes are deleted only when they contain no
/// link; a hatnote without its link is an empty shell.
static CLASS_BLACKLIST_IF_NO_LINK: phf::Set<&'static str> = phf::phf_set! {
    "mainarticle", "seealso", "dablink", "rellink", "hatnote",
};

/// Nodes with any of these classes get their inline `display` cleared.
static CLASS_FORCE_DISPLAY: phf::Set<&'static str> = phf::phf_set! {
    "thumb",
};

/// The class marking a math formula's fallback render, kept even in
/// `nopic` dumps.
const MATH_FALLBACK_CLASS: &str = "mwe-math-fallback-image-inline";

/// The `typeof` marking the math extension's output.
const MATH_TYPEOF: &str = "mw:Extension/math";

/// Image sources under this prefix are file-description plumbing, not
/// mirrorable media.
const FILEPATH_PREFIX: &str = "./Special:FilePath/";

/// Rewrites one article's sections in place, scheduling media downloads on
/// `downloads`.
pub fn rewrite_article(
    ctx: &Context,
    variant: Variant,
    downloads: &WorkQueue<String>,
    article: &mut Article,
) {
    let mut rewriter = Rewriter {
        ctx,
        nopic: variant.nopic,
        downloads,
        seen: HashSet::new(),
    };

    let Some(lead) = article.lead.as_mut() else {
        return;
    };
    for section in &mut lead.sections {
        rewriter.rewrite_section(section);
    }
    for section in &mut article.remaining.sections {
        rewriter.rewrite_section(section);
    }

    // Lead metadata refers to media by bare URL rather than markup.
    if !rewriter.nopic
        && let Some(image) = lead.image.as_mut()
    {
        for url in image.urls.values_mut() {
            if let Some(local) = rewriter.localise_media_url(url) {
                *url = local;
            }
        }
    }
    if let Some(pronunciation) = lead.pronunciation.as_mut()
        && let Some(local) = rewriter.localise_media_url(&pronunciation.url)
    {
        pronunciation.url = local;
    }
}

/// Per-article rewrite state.
struct Rewriter<'a> {
    ctx: &'a Context,
    nopic: bool,
    downloads: &'a WorkQueue<String>,
    /// Source URLs already scheduled during this pass.
    seen: HashSet<String>,
}

impl Rewriter<'_> {
    /// Rewrites one section's HTML.
    fn rewrite_section(&mut self, section: &mut Section) {
        if let Some(text) = section.text.as_mut() {
            *text = self.clean_html(text);
        }
    }

    /// Runs the full pipeline over one HTML fragment.
    fn clean_html(&mut self, html: &str) -> String {
        let mut fragment = dom::parse(html);
        self.rewrite_media_elements(&mut fragment);
        rewrite_geo_links(&mut fragment);
        filter_blacklisted(&mut fragment);
        if !self.ctx.config.keep_empty_paragraphs {
            drop_empty_paragraphs(&mut fragment);
        }
        fragment.to_html()
    }

    /// Media element handling: prune (`nopic`), unwrap file links, point
    /// `src` into the local media tree and schedule the download.
    fn rewrite_media_elements(&mut self, fragment: &mut Fragment) {
        for img in fragment.elements_named("img") {
            if self.nopic && !is_math_image(fragment, img) {
                fragment.detach(img);
                continue;
            }

            let src = fragment
                .element(img)
                .and_then(|element| element.attr("src"))
                .map(str::to_string);
            let Some(src) = src else {
                fragment.detach(img);
                continue;
            };
            if src.starts_with(FILEPATH_PREFIX) {
                continue;
            }

            let url = self.ctx.client.absolute(&src);
            let Some(media) = media::parse_media_url(&url) else {
                // No local name can be derived; a dead reference is worse
                // than no image.
                fragment.detach(img);
                continue;
            };

            if let Some(link) = fragment.ancestor_named(img, "a") {
                let target = fragment
                    .element(link)
                    .and_then(|element| element.attr("href"))
                    .map(|href| self.extract_target_id(href))
                    .unwrap_or_default();
                if !self.ctx.is_mirrored(&target) {
                    fragment.unwrap(link);
                }
            }

            let local = format!("m/{}", title::url_encode(&media::media_base(&media)));
            let element = fragment
                .element_mut(img)
                .expect("elements_named returns elements");
            element.set_attr("src", &local);
            element.remove_attr("resource");
            element.remove_attr("srcset");

            if self.seen.insert(url.clone()) {
                self.downloads.push(url);
            }
        }

        if self.nopic {
            for map in fragment.elements_named("map") {
                fragment.detach(map);
            }
        }
    }

    /// Rewrites a bare media URL (lead image, pronunciation) to its local
    /// path, scheduling the download.
    fn localise_media_url(&mut self, url: &str) -> Option<String> {
        let absolute = self.ctx.client.absolute(url);
        let media = media::parse_media_url(&absolute)?;
        if self.seen.insert(absolute.clone()) {
            self.downloads.push(absolute);
        }
        Some(format!(
            "m/{}",
            title::url_encode(&media::media_base(&media))
        ))
    }

    /// Extracts the article title a link points at, or `""` when it leaves
    /// the mirror.
    fn extract_target_id(&self, href: &str) -> String {
        extract_target_id(
            href,
            &self.ctx.config.web_url(),
            &format!("/{}/", self.ctx.config.mw_wiki_path),
        )
    }
}

/// Returns true for the math-extension images kept even in `nopic` dumps.
fn is_math_image(fragment: &Fragment, img: NodeId) -> bool {
    fragment.element(img).is_some_and(|element| {
        element.has_class(MATH_FALLBACK_CLASS)
            || element.attr("typeof") == Some(MATH_TYPEOF)
    })
}

/// The link-target extraction shared with the redirect machinery: Parsoid's
/// `./Title` form, then the wiki's own article path, else empty.
pub fn extract_target_id(href: &str, web_url: &str, base_path: &str) -> String {
    let target = if let Some(rest) = href.strip_prefix("./") {
        rest
    } else if let Some(rest) = href.strip_prefix(web_url) {
        rest
    } else if let Some(rest) = href.strip_prefix(base_path) {
        rest
    } else {
        return String::new();
    };
    let target = target.split(['#', '?']).next().unwrap_or(target);
    title::url_decode(target).into_owned()
}

/// Replaces geo-service links (`poimap2.php`, `geohack.php`) with `geo:`
/// URLs; every other link is left untouched.
fn rewrite_geo_links(fragment: &mut Fragment) {
    for name in ["a", "area"] {
        for node in fragment.elements_named(name) {
            let coordinates = fragment
                .element(node)
                .and_then(|element| element.attr("href"))
                .and_then(geo_coordinates);
            if let Some((lat, lon)) = coordinates
                && let Some(element) = fragment.element_mut(node)
            {
                element.set_attr("href", &format!("geo:{lat},{lon}"));
            }
        }
    }
}

/// Extracts coordinates from a geo-service URL.
fn geo_coordinates(href: &str) -> Option<(f64, f64)> {
    let location = href.split(['?', '#']).next().unwrap_or(href);
    if location.contains("poimap2.php") {
        let lat = query_param(href, "lat")?.parse::<f64>().ok()?;
        let lon = query_param(href, "lon")?.parse::<f64>().ok()?;
        return (lat.is_finite() && lon.is_finite()).then_some((lat, lon));
    }
    if location.contains("geohack.php") {
        // Repeated `params=` arguments form an array; the first numeric
        // element wins.
        let params = query_params(href)
            .into_iter()
            .filter(|(key, _)| key == "params")
            .map(|(_, value)| value)
            .find(|value| value.starts_with(|c: char| c.is_ascii_digit() || c == '-'))?;
        return parse_geohack(&params);
    }
    None
}

/// Parses geohack's `params=` blob: either `lat;lon_…` or DMS segments
/// with hemisphere letters.
fn parse_geohack(params: &str) -> Option<(f64, f64)> {
    let mut tokens = params.split('_');

    let first = tokens.next()?;
    if let Some((lat, lon)) = first.split_once(';') {
        let lat = lat.parse::<f64>().ok()?;
        let lon = lon.parse::<f64>().ok()?;
        return (lat.is_finite() && lon.is_finite()).then_some((lat, lon));
    }

    // DMS: degree, minute and second values accumulate until a hemisphere
    // letter closes the coordinate. `O` is Ost.
    const FACTORS: [f64; 3] = [1.0, 60.0, 3600.0];
    let mut lat = None;
    let mut lon = None;
    let mut acc = 0.0;
    let mut place = 0;
    for token in std::iter::once(first).chain(tokens) {
        if let Ok(number) = token.parse::<f64>() {
            if place < FACTORS.len() {
                acc += number / FACTORS[place];
                place += 1;
            }
            continue;
        }
        match token {
            "N" | "S" if lat.is_none() => {
                lat = Some(if token == "S" { -acc } else { acc });
                acc = 0.0;
                place = 0;
            }
            "E" | "W" | "O" if lat.is_some() => {
                lon = Some(if token == "W" { -acc } else { acc });
                break;
            }
            _ => break,
        }
    }

    let (lat, lon) = (lat?, lon?);
    (lat.is_finite() && lon.is_finite()).then_some((lat, lon))
}

/// The decoded value of one query parameter.
fn query_param(url: &str, name: &str) -> Option<String> {
    query_params(url)
        .into_iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value)
}

/// All query parameters, decoded, in order.
fn query_params(url: &str) -> Vec<(String, String)> {
    let query = url
        .split_once('?')
        .map(|(_, rest)| rest)
        .unwrap_or_default();
    let query = query.split('#').next().unwrap_or_default();
    query
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.to_string(), title::url_decode(value).into_owned()))
        })
        .collect()
}

/// Applies the id and class blacklists and the forced-display list.
fn filter_blacklisted(fragment: &mut Fragment) {
    for node in fragment.elements_in(fragment.root()) {
        let (blacklisted, conditional, force_display) = {
            let Some(element) = fragment.element(node) else {
                continue;
            };
            (
                element
                    .attr("id")
                    .is_some_and(|id| ID_BLACKLIST.contains(id))
                    || element
                        .classes()
                        .any(|class| CLASS_BLACKLIST.contains(class)),
                element
                    .classes()
                    .any(|class| CLASS_BLACKLIST_IF_NO_LINK.contains(class)),
                element
                    .classes()
                    .any(|class| CLASS_FORCE_DISPLAY.contains(class)),
            )
        };

        if blacklisted || (conditional && !fragment.contains_element(node, "a")) {
            fragment.detach(node);
            continue;
        }

        if force_display {
            clear_display(fragment, node);
        }
    }
}

/// Clears any inline `display` declaration so the node stays visible.
fn clear_display(fragment: &mut Fragment, node: NodeId) {
    let Some(element) = fragment.element_mut(node) else {
        return;
    };
    let Some(style) = element.attr("style") else {
        return;
    };
    let kept = style
        .split(';')
        .map(str::trim)
        .filter(|decl| {
            !decl.is_empty() && !decl.to_ascii_lowercase().starts_with("display")
        })
        .collect::<Vec<_>>()
        .join(";");
    if kept.is_empty() {
        element.remove_attr("style");
    } else {
        element.set_attr("style", &kept);
    }
}

/// Deletes `<p>` elements with neither element children nor text.
fn drop_empty_paragraphs(fragment: &mut Fragment) {
    for node in fragment.elements_named("p") {
        if fragment.elements_in(node).is_empty()
            && fragment.text_of(node).trim().is_empty()
        {
            fragment.detach(node);
        }
    }
}

/// Collapses whitespace runs between tags.
static INTER_TAG_SPACE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r">\s+<").expect("the pattern is well-formed"));

/// Assembles the cleaned sections into a complete page.
pub fn render_page(ctx: &Context, page_title: &str, article: &Article) -> String {
    use core::fmt::Write as _;

    let display = title::with_spaces(page_title);
    let direction = if ctx.site.rtl { "rtl" } else { "ltr" };

    let mut out = String::new();
    let _ = write!(
        out,
        "<!DOCTYPE html>\n<html lang=\"{}\" dir=\"{direction}\">\n<head>\n\
         <meta charset=\"utf-8\">\n<title>{}</title>\n\
         <link rel=\"stylesheet\" href=\"s/style.css\">\n</head>\n<body>\n\
         <h1 id=\"titleHeading\">{}</h1>\n",
        ctx.site.lang,
        html_escape::encode_text(&display),
        article
            .lead
            .as_ref()
            .and_then(|lead| lead.displaytitle.as_deref())
            .map_or_else(
                || html_escape::encode_text(&display).into_owned(),
                str::to_string,
            ),
    );

    if let Some(lead) = article.lead.as_ref() {
        for section in &lead.sections {
            write_section(&mut out, section);
        }
    }
    for section in &article.remaining.sections {
        write_section(&mut out, section);
    }
    out.push_str("</body>\n</html>\n");

    if ctx.config.minify_html {
        INTER_TAG_SPACE.replace_all(&out, "><").into_owned()
    } else {
        out
    }
}

/// Writes one section: a heading (when the section has one) and its text.
fn write_section(out: &mut String, section: &Section) {
    use core::fmt::Write as _;

    if let Some(line) = section.line.as_deref() {
        // toclevel 1 is a top-level section: <h2>, like the wiki renders.
        let level = section.toclevel.unwrap_or(1).clamp(1, 5) + 1;
        let _ = write!(out, "<h{level}");
        if let Some(anchor) = section.anchor.as_deref() {
            let _ = write!(
                out,
                " id=\"{}\"",
                html_escape::encode_double_quoted_attribute(anchor)
            );
        }
        let _ = write!(out, ">{line}</h{level}>\n");
    }
    if let Some(text) = section.text.as_deref() {
        out.push_str(text);
        out.push('\n');
    }
}

/// Errors that may occur when emitting an article file.
#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    #[error("{1}: cannot write article: {0}")]
    Io(std::io::Error, std::path::PathBuf),
}

/// Writes a rendered page under the output root, deflate-compressed when
/// configured.
pub fn save_page(ctx: &Context, html_root: &Path, page_title: &str, html: &str) -> Result<(), SaveError> {
    let path = html_root.join(title::article_filename(page_title));
    let io_err = |err| SaveError::Io(err, path.clone());

    if ctx.config.deflate_tmp_html {
        let file = std::fs::File::create(&path).map_err(io_err)?;
        let mut encoder =
            flate2::write::ZlibEncoder::new(file, flate2::Compression::default());
        encoder.write_all(html.as_bytes()).map_err(io_err)?;
        encoder.finish().map_err(io_err)?;
    } else {
        std::fs::write(&path, html).map_err(io_err)?;
    }
    Ok(())
}

/// Fetches, rewrites and saves one title. The per-article entry point the
/// article queue workers run.
pub fn process_title(
    ctx: &Context,
    variant: Variant,
    html_root: &Path,
    downloads: &WorkQueue<String>,
    page_title: &str,
) {
    let url = crate::api::Api::new(&ctx.config, &ctx.client).sections_url(page_title);

    let body = if ctx.config.skip_html_cache {
        ctx.client.fetch_or_empty(&url).body
    } else if let Some((body, _)) = ctx.cache.lookup(&url) {
        body
    } else {
        let payload = ctx.client.fetch_or_empty(&url);
        if !payload.body.is_empty()
            && let Err(err) = ctx.cache.store(&url, &payload.body, &payload.headers)
        {
            log::warn!("{err}");
        }
        payload.body
    };

    let Some(mut article) = crate::api::parse_sections(&body) else {
        log::warn!("{page_title}: article has no lead section, dropping");
        return;
    };

    rewrite_article(ctx, variant, downloads, &mut article);
    let html = render_page(ctx, page_title, &article);
    if let Err(err) = save_page(ctx, html_root, page_title, &html) {
        log::error!("{err}");
    } else {
        log::debug!("Saved {page_title}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::context as test_context;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Runs `clean_html` against a collector queue, returning the cleaned
    /// fragment and the scheduled download URLs.
    fn clean(ctx: &Context, nopic: bool, html: &str) -> (String, Vec<String>) {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&collected);
        let downloads = WorkQueue::new("collect", 1, move |url: String| {
            sink.lock().push(url);
        });
        let mut rewriter = Rewriter {
            ctx,
            nopic,
            downloads: &downloads,
            seen: std::collections::HashSet::new(),
        };
        let out = rewriter.clean_html(html);
        downloads.drain();
        let urls = collected.lock().clone();
        downloads.shutdown();
        (out, urls)
    }

    #[test]
    fn geohack_dms_translation() {
        let href =
            "http://tools.wmflabs.org/geohack/geohack.php?params=48.85825_N_2.2945_E_type:landmark";
        assert_eq!(geo_coordinates(href), Some((48.85825, 2.2945)));

        let (ctx, _dir) = test_context();
        let (out, _) = clean(&ctx, false, &format!(r#"<a href="{href}">Eiffel</a>"#));
        assert_eq!(out, r#"<a href="geo:48.85825,2.2945">Eiffel</a>"#);
    }

    #[test]
    fn geohack_semicolon_translation() {
        let href = "https://tools.example.org/geohack/geohack.php?params=48.858;2.2945_type:landmark";
        assert_eq!(geo_coordinates(href), Some((48.858, 2.2945)));
    }

    #[test]
    fn geohack_southern_western_signs() {
        let href = "https://x/geohack.php?params=33_51_S_151_12_E_";
        let (lat, lon) = geo_coordinates(href).unwrap();
        assert!((lat - -33.85).abs() < 1e-9, "{lat}");
        assert!((lon - 151.2).abs() < 1e-9, "{lon}");
    }

    #[test]
    fn poimap_translation() {
        let href = "https://tools.example.org/poimap2.php?lat=52.52&lon=13.405&zoom=12";
        assert_eq!(geo_coordinates(href), Some((52.52, 13.405)));
    }

    #[test]
    fn plain_links_survive() {
        assert_eq!(geo_coordinates("https://example.org/x?params=48_N_2_E"), None);
        assert_eq!(geo_coordinates("not a url at all"), None);
    }

    #[test]
    fn nopic_keeps_only_math_images() {
        let (ctx, _dir) = test_context();
        let html = concat!(
            r#"<a href="./Special:FilePath/x"><img class="mwe-math-fallback-image-inline" "#,
            r#"src="//upload.example.org/math/render/svg/abc123"></a>"#,
            r#"<img src="//upload.example.org/w/thumb/a/ab/Photo.jpg/200px-Photo.jpg">"#,
            r#"<map name="m"></map>"#,
        );
        let (out, urls) = clean(&ctx, true, html);
        assert!(out.contains("mwe-math-fallback-image-inline"), "{out}");
        assert!(!out.contains("Photo.jpg"), "{out}");
        assert!(!out.contains("<map"), "{out}");
        // The math image was unwrapped out of its link and rewritten.
        assert!(!out.contains("<a "), "{out}");
        assert!(out.contains(r#"src="m/abc123.svg""#), "{out}");
        assert_eq!(urls, vec!["https://upload.example.org/math/render/svg/abc123"]);
    }

    #[test]
    fn image_link_to_mirrored_article_is_kept() {
        let (ctx, _dir) = test_context();
        let html = concat!(
            r#"<a href="./Paris"><img src="//upload.example.org/t/a/ab/P.jpg/100px-P.jpg"></a>"#,
            r#"<a href="./File:P.jpg"><img src="//upload.example.org/t/a/ab/P.jpg/100px-P.jpg"></a>"#,
        );
        let (out, urls) = clean(&ctx, false, html);
        // The link to the mirrored article survives; the file-page link is
        // unwrapped.
        assert!(out.contains(r#"<a href="./Paris">"#), "{out}");
        assert_eq!(out.matches("<a ").count(), 1, "{out}");
        // One URL scheduled despite two identical references.
        assert_eq!(urls.len(), 1);
        assert!(out.contains(r#"src="m/P.jpg""#), "{out}");
    }

    #[test]
    fn srcset_and_resource_are_stripped() {
        let (ctx, _dir) = test_context();
        let html = concat!(
            r#"<img src="//u.example.org/t/a/ab/P.jpg/100px-P.jpg" "#,
            r#"resource="./File:P.jpg" srcset="//u.example.org/2x 2x">"#,
        );
        let (out, _) = clean(&ctx, false, html);
        assert!(!out.contains("srcset"), "{out}");
        assert!(!out.contains("resource"), "{out}");
    }

    #[test]
    fn underivable_image_is_deleted() {
        let (ctx, _dir) = test_context();
        let (out, urls) = clean(&ctx, false, r#"<p><img src="data:image/png;base64,xyz"></p>"#);
        assert!(!out.contains("<img"), "{out}");
        assert!(urls.is_empty());
    }

    #[test]
    fn blacklists_apply() {
        let (ctx, _dir) = test_context();
        let html = concat!(
            r#"<div id="purgelink">x</div>"#,
            r#"<div class="navbar plainlinks">nav</div>"#,
            r#"<div class="hatnote">bare text</div>"#,
            r#"<div class="hatnote">see <a href="./Paris">Paris</a></div>"#,
            r#"<div class="thumb" style="display:none;border:1px">t</div>"#,
        );
        let (out, _) = clean(&ctx, false, html);
        assert!(!out.contains("purgelink"), "{out}");
        assert!(!out.contains("nav</div>"), "{out}");
        assert!(!out.contains("bare text"), "{out}");
        assert!(out.contains("see <a"), "{out}");
        assert!(out.contains(r#"style="border:1px""#), "{out}");
        assert!(!out.contains("display:none"), "{out}");
    }

    #[test]
    fn empty_paragraphs_are_dropped() {
        let (ctx, _dir) = test_context();
        let (out, _) = clean(&ctx, false, "<p>  </p><p>kept</p><p><b>kept too</b></p>");
        assert_eq!(out, "<p>kept</p><p><b>kept too</b></p>");
    }

    #[test]
    fn rewrite_is_idempotent_on_same_input() {
        let (ctx, _dir) = test_context();
        let html = concat!(
            r#"<p>intro</p><div class="hatnote">bare</div>"#,
            r#"<a href="https://x/geohack.php?params=1_N_2_E_">geo</a>"#,
            r#"<img src="//u.example.org/t/a/ab/P.jpg/100px-P.jpg">"#,
        );
        let (first, _) = clean(&ctx, false, html);
        let (second, _) = clean(&ctx, false, html);
        assert_eq!(first, second);
    }

    #[test]
    fn target_extraction() {
        let web = "https://en.example.org/wiki/";
        assert_eq!(extract_target_id("./Foo_bar", web, "/wiki/"), "Foo_bar");
        assert_eq!(
            extract_target_id("https://en.example.org/wiki/Foo%20bar", web, "/wiki/"),
            "Foo bar"
        );
        assert_eq!(extract_target_id("/wiki/Foo#History", web, "/wiki/"), "Foo");
        assert_eq!(extract_target_id("https://other.org/wiki/Foo", web, "/wiki/"), "");
        assert_eq!(extract_target_id("", web, "/wiki/"), "");
        assert_eq!(extract_target_id("%%%malformed", web, "/wiki/"), "");
    }
}
