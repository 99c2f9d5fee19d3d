//! The run orchestrator: phases in a fixed order, each one a barrier.
//!
//! `login -> siteinfo -> subtitle -> directories -> cache -> resume check
//! -> enumeration -> {per variant: subdirs -> favicon -> main page ->
//! redirects -> articles -> drain downloads -> drain optimization ->
//! archive -> cleanup} -> cache sweep -> store teardown`. A phase only
//! starts once the previous one has fully quiesced; the queue `drain`
//! calls are those barriers.

use crate::{
    api::Api,
    cache::{self, Cache},
    config::{self, Config, Variant},
    context::Context,
    crawler,
    fetch::Client,
    media::{self, OptimizeJob},
    queue::WorkQueue,
    rewrite, store,
    store::Store,
    title, zim,
};
use parking_lot::Mutex;
use std::{fs, path::PathBuf, sync::Arc};

/// The stylesheet shipped with every tree. Articles reference it as
/// `s/style.css`.
const STYLE: &str = "\
body { margin: 0 auto; max-width: 55em; padding: 0 1em; \
font-family: sans-serif; line-height: 1.5; }
img { max-width: 100%; height: auto; }
.thumb { float: right; clear: right; margin: 0 0 1em 1em; }
h1, h2, h3 { line-height: 1.2; }
";

/// Errors that abort the run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The wiki API failed.
    #[error(transparent)]
    Api(#[from] crate::api::Error),

    /// Startup validation failed (missing binaries).
    #[error(transparent)]
    Args(#[from] config::ArgsError),

    /// The disk cache failed.
    #[error(transparent)]
    Cache(#[from] cache::Error),

    /// Enumeration failed.
    #[error(transparent)]
    Crawl(#[from] crawler::Error),

    /// A working directory could not be created.
    #[error("{1}: cannot create directory: {0}")]
    CreateDir(std::io::Error, PathBuf),

    /// The coordination store failed.
    #[error(transparent)]
    Store(#[from] store::Error),

    /// An output surface could not be produced.
    #[error(transparent)]
    Zim(#[from] zim::Error),
}

/// Runs the whole pipeline.
pub fn run(config: Config) -> Result<(), Error> {
    config.check_binaries()?;

    for dir in [
        &config.output_directory,
        &config.tmp_directory,
        &config.cache_directory,
    ] {
        fs::create_dir_all(dir).map_err(|err| Error::CreateDir(err, dir.clone()))?;
    }

    let client = Arc::new(Client::new(
        &config.user_agent(),
        config.host(),
        config.is_https(),
        config.request_timeout,
    ));
    // The prefix makes this run's databases disjoint from any concurrent
    // run against the same store.
    let prefix = format!("{}_{}_", config.cache_radical(), std::process::id());
    let store = Arc::new(Store::open(prefix, config.redis_socket.as_deref())?);

    let api = Api::new(&config, &client);
    api.login()?;

    let site = api.site_info()?;
    log::info!(
        "Mirroring {} ({}, {})",
        site.site_name,
        site.lang,
        if site.rtl { "rtl" } else { "ltr" }
    );
    let subtitle = api.sub_title();
    log::info!(
        "Content namespaces: {}",
        site.content_namespaces()
            .map(|ns| ns.id.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let cache = Cache::prepare(config.cache_directory.join(config.cache_radical()))?;

    let variants = resume_variants(&config);
    if variants.is_empty() {
        log::info!("Every requested archive already exists; nothing to do");
        store.quit();
        return Ok(());
    }

    let main_page = config
        .custom_main_page
        .as_deref()
        .map(|custom| title::normalize(custom).into_owned())
        .unwrap_or_else(|| site.main_page.clone());

    let enumeration = crawler::enumerate(&config, &client, &store, &site, &main_page)?;
    log::info!("Cached {} redirects", store.redirects().len()?);

    let ctx = Arc::new(Context {
        config,
        client,
        store,
        cache,
        site,
        subtitle,
        main_page,
        articles: enumeration.articles,
        by_namespace: enumeration.by_namespace,
        media_lock: Mutex::new(()),
    });

    for variant in variants {
        dump(&ctx, variant)?;
    }

    if ctx.config.skip_cache_cleaning {
        log::info!("Skipping the cache staleness sweep");
    } else {
        ctx.cache.sweep()?;
    }

    // Normal exit only: an aborted run leaves its databases behind.
    ctx.store.delete_databases()?;
    ctx.store.quit();
    // Dropping the context tears down the HTTP connection pools.
    Ok(())
}

/// Applies `--resume`: variants whose archive already exists are done.
fn resume_variants(config: &Config) -> Vec<Variant> {
    if !config.resume {
        return config.formats.clone();
    }
    config
        .formats
        .iter()
        .copied()
        .filter(|&variant| {
            let archive = zim::archive_file(config, variant);
            let done = !variant.nozim && archive.exists();
            if done {
                log::info!("{}: already built, skipping", archive.display());
            }
            !done
        })
        .collect()
}

/// Produces one dump variant.
fn dump(ctx: &Arc<Context>, variant: Variant) -> Result<(), Error> {
    log::info!("Producing dump variant '{variant}'");
    let radical = ctx.config.dump_radical(variant);
    let html_root = ctx.config.output_directory.join(&radical);

    for sub in ["s", "j", "m"] {
        let dir = html_root.join(sub);
        fs::create_dir_all(&dir).map_err(|err| Error::CreateDir(err, dir))?;
    }
    let style = html_root.join("s").join("style.css");
    fs::write(&style, STYLE).map_err(|err| Error::CreateDir(err, style))?;

    zim::save_favicon(ctx, &html_root)?;
    zim::write_main_page(ctx, &html_root)?;

    let redirect_index = if ctx.config.write_html_redirects {
        let written = zim::write_html_redirects(ctx, &html_root)?;
        log::info!("Wrote {written} HTML redirects");
        None
    } else {
        let path = ctx
            .config
            .tmp_directory
            .join(format!("{radical}_redirects"));
        let written = zim::write_redirect_index(ctx, &path)?;
        log::info!("Indexed {written} redirects");
        Some(path)
    };

    // The three queues of the article phase. Articles feed downloads,
    // downloads feed optimization; they drain in that order.
    let optimize = Arc::new(WorkQueue::new(
        "optimize",
        ctx.config.cpu_count * 2,
        move |job: OptimizeJob| media::optimize(&job),
    ));
    let downloads = {
        let ctx = Arc::clone(ctx);
        let optimize = Arc::clone(&optimize);
        let media_dir = html_root.join("m");
        Arc::new(WorkQueue::new(
            "media",
            ctx.config.speed * 5,
            move |url: String| media::download(&ctx, &media_dir, &optimize, &url),
        ))
    };
    let articles = {
        let ctx = Arc::clone(ctx);
        let downloads = Arc::clone(&downloads);
        let html_root = html_root.clone();
        WorkQueue::new("articles", ctx.config.speed, move |page_title: String| {
            rewrite::process_title(&ctx, variant, &html_root, &downloads, &page_title);
        })
    };

    log::info!("Saving {} articles", ctx.articles.len());
    for page_title in ctx.articles.keys() {
        articles.push(page_title.clone());
    }
    articles.drain();
    articles.shutdown();
    downloads.drain();
    downloads.shutdown();
    optimize.drain();
    optimize.shutdown();

    if variant.nozim {
        log::info!("{}: tree finished (no archive requested)", html_root.display());
    } else {
        zim::build_zim(ctx, variant, &html_root, redirect_index.as_deref())?;
        if ctx.config.keep_html {
            log::info!("Keeping the intermediate tree at {}", html_root.display());
        } else if let Err(err) = fs::remove_dir_all(&html_root) {
            log::warn!("{}: cannot remove tree: {err}", html_root.display());
        }
    }
    if let Some(index) = redirect_index {
        let _ = fs::remove_file(index);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(out: &std::path::Path, extra: &[&str]) -> Config {
        let mut argv: Vec<std::ffi::OsString> = vec![
            "--mwUrl".into(),
            "https://en.example.org".into(),
            "--adminEmail".into(),
            "admin@example.org".into(),
            "--outputDirectory".into(),
            out.into(),
        ];
        argv.extend(extra.iter().map(std::ffi::OsString::from));
        Config::from_args(pico_args::Arguments::from_vec(argv)).unwrap()
    }

    #[test]
    fn resume_skips_existing_archives() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), &["--resume", "--format", "", "--format", "nopic"]);

        // Nothing exists yet: both variants remain.
        assert_eq!(resume_variants(&config).len(), 2);

        // Once the plain archive exists, only nopic remains.
        let plain = zim::archive_file(&config, Variant::default());
        fs::write(&plain, b"zim").unwrap();
        let remaining = resume_variants(&config);
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].nopic);
    }

    #[test]
    fn without_resume_nothing_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), &["--format", ""]);
        let plain = zim::archive_file(&config, Variant::default());
        fs::write(&plain, b"zim").unwrap();
        assert_eq!(resume_variants(&config).len(), 1);
    }
}
