#![doc = include_str!("../README.md")]
#![warn(
    clippy::pedantic,
    clippy::missing_docs_in_private_items,
    missing_docs,
    rust_2018_idioms
)]

mod api;
mod cache;
mod config;
mod context;
mod crawler;
mod dom;
mod fetch;
mod media;
mod queue;
mod rewrite;
mod run;
mod store;
mod title;
mod zim;

use config::Config;

/// The exit code for anything that escapes to the panic handler.
const PANIC_EXIT_CODE: i32 = 42;

/// Uses the [`Display`](core::fmt::Display) formatter for an error even when
/// the [`Debug`](core::fmt::Debug) formatter is requested.
struct DisplayError(Box<dyn std::error::Error>);

impl core::fmt::Debug for DisplayError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl<E: Into<Box<dyn std::error::Error>>> From<E> for DisplayError {
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

/// Command line usage instructions.
fn usage() {
    let exe = std::env::args().next().unwrap_or_default();
    eprintln!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    eprintln!("Usage: {exe} --mwUrl <url> --adminEmail <email> [options]\n");
    eprintln!("Required:");
    eprintln!("  --mwUrl: Base URL of the wiki (e.g. https://en.wikipedia.org/)");
    eprintln!("  --adminEmail: Contact address, advertised in the User-Agent");
    eprintln!("Selection:");
    eprintln!("  --articleList: Mirror only the titles in this file (one per line)");
    eprintln!("  --customMainPage: Welcome article instead of the wiki main page");
    eprintln!("  --format: Dump variant, a comma-joined subset of 'nopic'/'nozim';");
    eprintln!("            repeat the flag for several variants");
    eprintln!("Output:");
    eprintln!("  --outputDirectory: Where trees and archives land (default: out)");
    eprintln!("  --cacheDirectory: Download cache root (default: cache)");
    eprintln!("  --tmpDirectory: Scratch directory (default: system temp)");
    eprintln!("  --filenamePrefix: Override the '{{creator}}_{{lang}}' radical stem");
    eprintln!("  --customZimTitle / --customZimDescription / --customZimFavicon");
    eprintln!("  --publisher: Archive publisher string (default: Kiwix)");
    eprintln!("  --withZimFullTextIndex: Ask the archive builder for a text index");
    eprintln!("  --writeHtmlRedirects: Redirect files instead of a redirect index");
    eprintln!("  --keepHtml: Keep the intermediate tree after archiving");
    eprintln!("  --deflateTmpHtml / --minifyHtml / --keepEmptyParagraphs");
    eprintln!("Wiki access:");
    eprintln!("  --mwWikiPath: Article path (default: wiki)");
    eprintln!("  --mwApiPath: API path (default: w/api.php)");
    eprintln!("  --mwUsername / --mwPassword / --mwDomain: Private-wiki login");
    eprintln!("  --parsoidUrl: Explicit mobile-sections endpoint");
    eprintln!("  --requestTimeout: Base HTTP timeout in seconds (default: 60)");
    eprintln!("  --speed: Multiplier on the CPU count for queue widths (default: 1)");
    eprintln!("Run control:");
    eprintln!("  --resume: Skip variants whose archive already exists");
    eprintln!("  --skipHtmlCache: Do not cache article bodies");
    eprintln!("  --skipCacheCleaning: Keep stale cache entries");
    eprintln!("  --redisSocket: Use a RESP server as the coordination store");
    eprintln!("  --verbose: Debug-level logging");
}

fn main() -> Result<(), DisplayError> {
    // The analogue of a top-level uncaught-exception handler: a panic on
    // any thread must not strand a half-written tree looking successful.
    std::panic::set_hook(Box::new(|panic| {
        eprintln!("{panic}");
        eprintln!("{}", std::backtrace::Backtrace::force_capture());
        std::process::exit(PANIC_EXIT_CODE);
    }));

    let mut args = pico_args::Arguments::from_env();
    if args.contains(["-h", "--help"]) {
        usage();
        return Ok(());
    }

    let config = match Config::from_args(args) {
        Ok(config) => config,
        Err(err) => {
            usage();
            return Err(err)?;
        }
    };

    env_logger::init_from_env(env_logger::Env::default().default_filter_or(
        if config.verbose { "debug" } else { "info" },
    ));

    log::info!("Starting up offliner-rs ...");
    run::run(config).map_err(Into::into)
}
