//! Run configuration.
//!
//! Every recognised command-line option lands in a read-only [`Config`]
//! value built once at startup. Components never consult globals; the
//! configuration travels inside the run context.

use regex::Regex;
use std::{
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};
use time::{OffsetDateTime, macros::format_description};

/// External tools the media pipeline and output stages shell out to.
///
/// `zimwriterfs` is checked separately since `nozim` runs never need it.
pub const REQUIRED_BINARIES: &[&str] = &[
    "jpegoptim", "pngquant", "gifsicle", "advdef", "file", "stat", "convert",
];

/// Errors that may occur when parsing arguments.
#[derive(Debug, thiserror::Error)]
pub enum ArgsError {
    /// The admin email did not look like an email address.
    #[error("invalid --adminEmail '{0}' (used in the User-Agent header; must be a valid address)")]
    AdminEmail(String),

    /// Extra unknown junk on the command line.
    #[error("unknown arguments: {}", _0.display())]
    Extra(std::ffi::OsString),

    /// An unknown dump format token.
    #[error("unknown --format token '{0}' (should be 'nopic' and/or 'nozim')")]
    Format(String),

    /// A required external tool is not installed.
    #[error("required binary '{0}' was not found on PATH")]
    MissingBinary(String),

    /// The wiki base URL is missing or unusable.
    #[error("missing or invalid --mwUrl")]
    MwUrl,

    /// Some other parsing error.
    #[error(transparent)]
    Pico(#[from] pico_args::Error),
}

/// One dump to produce: a subset of `{nopic, nozim}`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Variant {
    /// Strip pictures (except math fallback renders).
    pub nopic: bool,
    /// Stop after producing the file tree; build no archive.
    pub nozim: bool,
}

impl Variant {
    /// Parses a comma-joined subset, e.g. `""`, `"nopic"`, `"nopic,nozim"`.
    fn parse(value: &str) -> Result<Self, ArgsError> {
        let mut variant = Self::default();
        for token in value.split(',').filter(|token| !token.is_empty()) {
            match token.trim() {
                "nopic" => variant.nopic = true,
                "nozim" => variant.nozim = true,
                other => return Err(ArgsError::Format(other.to_string())),
            }
        }
        Ok(variant)
    }
}

impl core::fmt::Display for Variant {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match (self.nopic, self.nozim) {
            (false, false) => f.write_str("plain"),
            (true, false) => f.write_str("nopic"),
            (false, true) => f.write_str("nozim"),
            (true, true) => f.write_str("nopic,nozim"),
        }
    }
}

/// The validated run configuration.
pub struct Config {
    /// Wiki base URL, normalised to end with `/`.
    pub mw_url: String,
    /// Contact address advertised in the User-Agent header.
    pub admin_email: String,
    /// Titles file enabling file-mode enumeration.
    pub article_list: Option<PathBuf>,
    /// Root under which per-run cache directories live.
    pub cache_directory: PathBuf,
    /// Scratch directory (redirect index, favicon intermediates).
    pub tmp_directory: PathBuf,
    /// Where finished trees and archives land.
    pub output_directory: PathBuf,
    /// Favicon source URL overriding the wiki logo.
    pub custom_zim_favicon: Option<String>,
    /// Archive title overriding the wiki name.
    pub custom_zim_title: Option<String>,
    /// Archive description overriding the wiki subtitle.
    pub custom_zim_description: Option<String>,
    /// Welcome article overriding the wiki main page.
    pub custom_main_page: Option<String>,
    /// Deflate-compress intermediate article files.
    pub deflate_tmp_html: bool,
    /// Filename radical override (replaces `{creator}_{lang}`).
    pub filename_prefix: Option<String>,
    /// Dump variants to produce, in order.
    pub formats: Vec<Variant>,
    /// Keep `<p>` elements with no content.
    pub keep_empty_paragraphs: bool,
    /// Keep the intermediate file tree after archiving.
    pub keep_html: bool,
    /// Article path under the base URL (default `wiki`).
    pub mw_wiki_path: String,
    /// API path under the base URL (default `w/api.php`).
    pub mw_api_path: String,
    /// Login credentials for private wikis.
    pub mw_username: Option<String>,
    pub mw_password: Option<String>,
    pub mw_domain: Option<String>,
    /// Collapse inter-tag whitespace in emitted HTML.
    pub minify_html: bool,
    /// Explicit mobile-sections endpoint base.
    pub parsoid_url: Option<String>,
    /// Archive publisher string.
    pub publisher: String,
    /// Unix socket of a RESP server to use as the coordination store.
    pub redis_socket: Option<PathBuf>,
    /// Base HTTP timeout; attempt `n` of a fetch waits `n` times this.
    pub request_timeout: Duration,
    /// Skip dump variants whose archive already exists.
    pub resume: bool,
    /// Do not cache article bodies (media is always cached).
    pub skip_html_cache: bool,
    /// Leave stale cache entries in place at end of run.
    pub skip_cache_cleaning: bool,
    /// Width of the article queue; other queues scale from it.
    pub speed: usize,
    /// Detected logical CPU count.
    pub cpu_count: usize,
    /// Raise default log filtering to debug.
    pub verbose: bool,
    /// Ask the archive builder for a full-text index.
    pub with_zim_full_text_index: bool,
    /// Emit HTML redirect files instead of a redirect index.
    pub write_html_redirects: bool,
}

/// The address shape accepted for `--adminEmail`.
static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)^[a-zA-Z0-9.!\#$%&'*+/=?^_`{|}~-]+
          @[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?
          (?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)+$",
    )
    .expect("the email pattern is well-formed")
});

impl Config {
    /// Builds a configuration from command-line arguments.
    pub fn from_args(mut args: pico_args::Arguments) -> Result<Self, ArgsError> {
        let mw_url: String = args.value_from_str("--mwUrl").map_err(|_| ArgsError::MwUrl)?;
        if !mw_url.starts_with("http://") && !mw_url.starts_with("https://") {
            return Err(ArgsError::MwUrl);
        }
        let mw_url = if mw_url.ends_with('/') {
            mw_url
        } else {
            format!("{mw_url}/")
        };

        let admin_email: String = args.value_from_str("--adminEmail")?;
        if !EMAIL.is_match(&admin_email) {
            return Err(ArgsError::AdminEmail(admin_email));
        }

        let mut formats = args
            .values_from_str::<_, String>("--format")?
            .iter()
            .map(|value| Variant::parse(value))
            .collect::<Result<Vec<_>, _>>()?;
        if formats.is_empty() {
            formats.push(Variant::default());
        }
        formats.dedup();

        let cpu_count = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        let speed_multiplier: usize = args.opt_value_from_str("--speed")?.unwrap_or(1);

        let config = Self {
            article_list: args.opt_value_from_str("--articleList")?,
            cache_directory: args
                .opt_value_from_str("--cacheDirectory")?
                .unwrap_or_else(|| PathBuf::from("cache")),
            tmp_directory: args
                .opt_value_from_str("--tmpDirectory")?
                .unwrap_or_else(std::env::temp_dir),
            output_directory: args
                .opt_value_from_str("--outputDirectory")?
                .unwrap_or_else(|| PathBuf::from("out")),
            custom_zim_favicon: args.opt_value_from_str("--customZimFavicon")?,
            custom_zim_title: args.opt_value_from_str("--customZimTitle")?,
            custom_zim_description: args.opt_value_from_str("--customZimDescription")?,
            custom_main_page: args.opt_value_from_str("--customMainPage")?,
            deflate_tmp_html: args.contains("--deflateTmpHtml"),
            filename_prefix: args.opt_value_from_str("--filenamePrefix")?,
            formats,
            keep_empty_paragraphs: args.contains("--keepEmptyParagraphs"),
            keep_html: args.contains("--keepHtml"),
            mw_wiki_path: args
                .opt_value_from_str("--mwWikiPath")?
                .unwrap_or_else(|| "wiki".to_string()),
            mw_api_path: args
                .opt_value_from_str("--mwApiPath")?
                .unwrap_or_else(|| "w/api.php".to_string()),
            mw_username: args.opt_value_from_str("--mwUsername")?,
            mw_password: args.opt_value_from_str("--mwPassword")?,
            mw_domain: args.opt_value_from_str("--mwDomain")?,
            minify_html: args.contains("--minifyHtml"),
            parsoid_url: args.opt_value_from_str("--parsoidUrl")?,
            publisher: args
                .opt_value_from_str("--publisher")?
                .unwrap_or_else(|| "Kiwix".to_string()),
            redis_socket: args.opt_value_from_str("--redisSocket")?,
            request_timeout: Duration::from_secs(
                args.opt_value_from_str("--requestTimeout")?.unwrap_or(60),
            ),
            resume: args.contains("--resume"),
            skip_html_cache: args.contains("--skipHtmlCache"),
            skip_cache_cleaning: args.contains("--skipCacheCleaning"),
            speed: cpu_count.saturating_mul(speed_multiplier).max(1),
            cpu_count,
            verbose: args.contains("--verbose"),
            with_zim_full_text_index: args.contains("--withZimFullTextIndex"),
            write_html_redirects: args.contains("--writeHtmlRedirects"),
            mw_url,
            admin_email,
        };

        let rest = args.finish();
        if !rest.is_empty() {
            return Err(ArgsError::Extra(rest.join(std::ffi::OsStr::new(" "))));
        }

        Ok(config)
    }

    /// The User-Agent header advertised on every request.
    pub fn user_agent(&self) -> String {
        format!(
            "MWOffliner/{} ({})",
            env!("CARGO_PKG_VERSION"),
            self.admin_email
        )
    }

    /// Host (with optional port) of the wiki base URL.
    pub fn host(&self) -> &str {
        let rest = self
            .mw_url
            .split_once("://")
            .map_or(self.mw_url.as_str(), |(_, rest)| rest);
        rest.split('/').next().unwrap_or(rest)
    }

    /// True when the wiki speaks HTTPS (scheme, or an explicit `:443`).
    pub fn is_https(&self) -> bool {
        self.mw_url.starts_with("https://") || self.host().ends_with(":443")
    }

    /// The `action=` API endpoint.
    pub fn api_url(&self) -> String {
        format!("{}{}", self.mw_url, self.mw_api_path)
    }

    /// The article URL prefix, `{base}{wikiPath}/`.
    pub fn web_url(&self) -> String {
        format!("{}{}/", self.mw_url, self.mw_wiki_path)
    }

    /// The mobile-sections REST endpoint prefix.
    pub fn rest_url(&self) -> String {
        self.parsoid_url.clone().unwrap_or_else(|| {
            format!("{}api/rest_v1/page/mobile-sections/", self.mw_url)
        })
    }

    /// The wiki-derived creator string: the registrable host label,
    /// capitalised.
    pub fn creator(&self) -> String {
        let host = self.host();
        let host = host.split(':').next().unwrap_or(host);
        let labels = host.split('.').collect::<Vec<_>>();
        let label = match labels.as_slice() {
            [.., name, _tld] if labels.len() >= 3 || name.len() > 3 => *name,
            [name, ..] => *name,
            [] => "wiki",
        };
        let mut chars = label.chars();
        chars.next().map_or_else(String::new, |first| {
            first.to_uppercase().collect::<String>() + chars.as_str()
        })
    }

    /// The language suffix for filenames: the leading hostname label when it
    /// looks like a language code (three letters preferred, per ISO-639-2).
    pub fn lang_suffix(&self) -> String {
        let label = self.host().split('.').next().unwrap_or_default();
        if (2..=3).contains(&label.len()) && label.chars().all(|c| c.is_ascii_lowercase()) {
            label.to_string()
        } else {
            "en".to_string()
        }
    }

    /// The radical shared by all of a wiki's runs: `{creator}_{lang}` (or
    /// the `--filenamePrefix` override) plus the selection. Cache
    /// directories use this so a warm cache survives across dates and
    /// variants.
    pub fn cache_radical(&self) -> String {
        let base = self.filename_prefix.clone().unwrap_or_else(|| {
            format!("{}_{}", self.creator().to_lowercase(), self.lang_suffix())
        });
        format!("{base}_{}", self.selection())
    }

    /// The full filename radical for one dump variant, date included.
    pub fn dump_radical(&self, variant: Variant) -> String {
        let mut radical = self.cache_radical();
        if variant.nopic {
            radical.push_str("_nopic");
        }
        let date = OffsetDateTime::now_utc()
            .format(format_description!("[year]-[month]"))
            .expect("the date format is well-formed");
        format!("{radical}_{date}")
    }

    /// The selection part of the radical: `all`, or the titles-file stem.
    fn selection(&self) -> String {
        self.article_list
            .as_deref()
            .and_then(Path::file_stem)
            .map_or_else(|| "all".to_string(), |stem| {
                stem.to_string_lossy().into_owned()
            })
    }

    /// Verifies that every required external tool resolves on `PATH`.
    /// `zimwriterfs` is only required when some variant builds an archive.
    pub fn check_binaries(&self) -> Result<(), ArgsError> {
        let needs_zim = self.formats.iter().any(|variant| !variant.nozim);
        for name in REQUIRED_BINARIES
            .iter()
            .copied()
            .chain(needs_zim.then_some("zimwriterfs"))
        {
            if find_binary(name).is_none() {
                return Err(ArgsError::MissingBinary(name.to_string()));
            }
        }
        Ok(())
    }
}

/// Searches `PATH` for an executable.
pub fn find_binary(name: &str) -> Option<PathBuf> {
    use std::os::unix::fs::PermissionsExt as _;

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path).find_map(|dir| {
        let candidate = dir.join(name);
        let meta = std::fs::metadata(&candidate).ok()?;
        (meta.is_file() && meta.permissions().mode() & 0o111 != 0).then_some(candidate)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(extra: &[&str]) -> Result<Config, ArgsError> {
        let mut argv = vec![
            "--mwUrl".into(),
            "https://en.example.org".into(),
            "--adminEmail".into(),
            "admin@example.org".into(),
        ];
        argv.extend(extra.iter().map(|arg| std::ffi::OsString::from(*arg)));
        Config::from_args(pico_args::Arguments::from_vec(argv))
    }

    #[test]
    fn minimal_config() {
        let config = config(&[]).unwrap();
        assert_eq!(config.mw_url, "https://en.example.org/");
        assert_eq!(config.api_url(), "https://en.example.org/w/api.php");
        assert_eq!(config.web_url(), "https://en.example.org/wiki/");
        assert_eq!(
            config.rest_url(),
            "https://en.example.org/api/rest_v1/page/mobile-sections/"
        );
        assert_eq!(config.formats, vec![Variant::default()]);
        assert!(config.is_https());
    }

    #[test]
    fn bad_email_rejected() {
        let argv: Vec<std::ffi::OsString> = vec![
            "--mwUrl".into(),
            "https://en.example.org".into(),
            "--adminEmail".into(),
            "nope".into(),
        ];
        assert!(matches!(
            Config::from_args(pico_args::Arguments::from_vec(argv)),
            Err(ArgsError::AdminEmail(_))
        ));
        assert!(config(&[]).unwrap().user_agent().contains("admin@example.org"));
    }

    #[test]
    fn formats_parse() {
        let cfg = config(&["--format", "nopic", "--format", "nopic,nozim"]).unwrap();
        assert_eq!(
            cfg.formats,
            vec![
                Variant {
                    nopic: true,
                    nozim: false
                },
                Variant {
                    nopic: true,
                    nozim: true
                },
            ]
        );
        assert!(matches!(
            config(&["--format", "sepia"]),
            Err(ArgsError::Format(_))
        ));
    }

    #[test]
    fn derived_names() {
        let config = config(&[]).unwrap();
        assert_eq!(config.creator(), "Example");
        assert_eq!(config.lang_suffix(), "en");
        assert_eq!(config.cache_radical(), "example_en_all");
        let radical = config.dump_radical(Variant {
            nopic: true,
            nozim: false,
        });
        assert!(radical.starts_with("example_en_all_nopic_"), "{radical}");
    }

    #[test]
    fn unknown_arguments_rejected() {
        assert!(matches!(
            config(&["--frobnicate"]),
            Err(ArgsError::Extra(_))
        ));
    }
}
