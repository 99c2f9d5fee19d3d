//! The media pipeline: a deduplicating download queue and an external-tool
//! optimization queue.
//!
//! Downloads dedup on two levels. Within one article rewrite the rewriter
//! skips repeated source URLs itself; across the whole run the store's
//! media database records the widest rendition claimed per filename base,
//! and the claim is written *before* the download so a concurrent request
//! for the same file cannot fetch twice.

use crate::{
    cache::WIDTH_HEADER,
    context::Context,
    queue::WorkQueue,
    store::{self, Db},
    title,
};
use parking_lot::Mutex;
use rand::{Rng as _, SeedableRng as _, rngs::SmallRng};
use regex::Regex;
use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
    sync::LazyLock,
    time::{SystemTime, UNIX_EPOCH},
};

/// The width recorded for a URL with no `NNNpx-` prefix: the original
/// rendition, wider than any sized request.
pub const WIDTH_FULL: u32 = 9_999_999;

/// How many times one file's optimization is attempted.
const OPTIMIZE_ATTEMPTS: u32 = 5;

/// Splits a media URL into path, penultimate segment, width prefix, base
/// name and up to two extensions.
static MEDIA_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.*/)([^/]+)(/)(\d+px-|)(.+?)(\.[A-Za-z0-9]{2,6}|)(\.[A-Za-z0-9]{2,6}|)$")
        .expect("the media URL pattern is well-formed")
});

/// A media reference parsed out of a URL.
#[derive(Debug, Eq, PartialEq)]
pub struct MediaRef {
    /// The deduplication key: the longer of the penultimate path segment
    /// and the reassembled final segment (math renders get a synthetic
    /// `.svg`).
    pub filename_base: String,
    /// Requested rendition width, [`WIDTH_FULL`] when unscaled.
    pub width: u32,
}

impl MediaRef {
    /// The (lower-cased) extension of the filename base, dot included.
    pub fn ext(&self) -> String {
        self.filename_base
            .rsplit_once('.')
            .map(|(_, ext)| format!(".{}", ext.to_ascii_lowercase()))
            .unwrap_or_default()
    }
}

/// Parses a media URL. `None` means the URL does not look like wiki media
/// at all, in which case the referencing image is dropped.
pub fn parse_media_url(url: &str) -> Option<MediaRef> {
    let captures = MEDIA_URL.captures(url)?;

    let segment = &captures[2];
    let first_ext = captures.get(6).map_or("", |m| m.as_str());
    let reassembled = format!(
        "{}{}{}",
        &captures[5],
        if first_ext.is_empty() { ".svg" } else { first_ext },
        &captures[7],
    );
    let filename_base = if segment.len() >= reassembled.len() {
        segment.to_string()
    } else {
        reassembled
    };

    let width = captures[4]
        .strip_suffix("px-")
        .and_then(|digits| digits.parse().ok())
        .unwrap_or(WIDTH_FULL);

    Some(MediaRef {
        filename_base,
        width,
    })
}

/// The on-disk (and `src`-referenced) name for a media file: the filename
/// base percent-decoded and clamped to the filename ceiling.
pub fn media_base(media: &MediaRef) -> String {
    let decoded = title::url_decode(&media.filename_base);
    match decoded.rsplit_once('.') {
        Some((stem, ext)) => title::fit_filename(stem, ext),
        None => title::fit_filename(&decoded, ""),
    }
}

/// A file awaiting optimization, with its size at enqueue time.
pub struct OptimizeJob {
    pub path: PathBuf,
    pub size: u64,
}

/// Errors terminating one media download.
#[derive(Debug, thiserror::Error)]
enum DownloadError {
    #[error(transparent)]
    Cache(#[from] crate::cache::Error),

    #[error(transparent)]
    Fetch(#[from] crate::fetch::Error),

    #[error("cannot publish into the media directory: {0}")]
    Publish(#[from] std::io::Error),

    #[error("URL does not match the media pattern")]
    Unrecognised,
}

/// Downloads one media URL into the cache and publishes it into the
/// variant's media directory. Failures are logged and the article keeps its
/// (now dangling) reference.
pub fn download(ctx: &Context, media_dir: &Path, optimize: &WorkQueue<OptimizeJob>, url: &str) {
    if let Err(err) = try_download(ctx, media_dir, optimize, url) {
        log::error!("{url}: media download failed: {err}");
    }
}

fn try_download(
    ctx: &Context,
    media_dir: &Path,
    optimize: &WorkQueue<OptimizeJob>,
    url: &str,
) -> Result<(), DownloadError> {
    let media = parse_media_url(url).ok_or(DownloadError::Unrecognised)?;

    match claim_width(&ctx.store.media(), &ctx.media_lock, &media) {
        Ok(true) => {}
        Ok(false) => {
            log::trace!("{url}: an equal or wider rendition is already claimed");
            return Ok(());
        }
        // Store errors are fatal to the run by design.
        Err(err) => {
            log::error!("{err}");
            std::process::exit(1);
        }
    }

    let dest = media_dir.join(media_base(&media));
    let cache_body = ctx.cache.media_path(url, &media.ext());

    // A previous run may already hold this rendition.
    if let Some(headers) = ctx.cache.media_headers(&cache_body) {
        let cached_width = headers
            .get(WIDTH_HEADER)
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(0);
        if cached_width >= media.width {
            ctx.cache.touch(&cache_body);
            ctx.cache.publish(&cache_body, &dest)?;
            let check = ctx.store.cached_media();
            let result = if cached_width > media.width {
                check.hset(&media.filename_base, &cached_width.to_string())
            } else {
                check.hdel(&media.filename_base)
            };
            if let Err(err) = result {
                log::error!("{err}");
                std::process::exit(1);
            }
            return Ok(());
        }
    }

    let payload = ctx.client.fetch(url)?;
    ctx.cache
        .store_media(&cache_body, &payload.body, &payload.headers, media.width)?;
    ctx.cache.publish(&cache_body, &dest)?;

    optimize.push(OptimizeJob {
        size: payload.body.len() as u64,
        path: dest,
    });
    Ok(())
}

/// Claims `media`'s width in the store, write-before-download. Returns
/// false when an equal or wider rendition is already claimed.
fn claim_width(
    media_db: &Db<'_>,
    lock: &Mutex<()>,
    media: &MediaRef,
) -> Result<bool, store::Error> {
    let _guard = lock.lock();
    let claimed = media_db
        .hget(&media.filename_base)?
        .and_then(|value| value.parse::<u32>().ok());
    if claimed.is_some_and(|width| width >= media.width) {
        return Ok(false);
    }
    media_db.hset(&media.filename_base, &media.width.to_string())?;
    Ok(true)
}

/// Image formats the optimization queue knows how to shrink.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Format {
    Jpeg,
    Png,
    Gif,
}

impl Format {
    /// Infers a format from a file extension.
    fn from_path(path: &Path) -> Option<Self> {
        match path
            .extension()?
            .to_str()?
            .to_ascii_lowercase()
            .as_str()
        {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "gif" => Some(Self::Gif),
            _ => None,
        }
    }

    /// Infers a format from a MIME type.
    fn from_mime(mime: &str) -> Option<Self> {
        match mime.trim() {
            "image/jpeg" => Some(Self::Jpeg),
            "image/png" => Some(Self::Png),
            "image/gif" => Some(Self::Gif),
            _ => None,
        }
    }
}

/// Optimizes one downloaded file in place, retrying with a re-probed
/// format on failure. The original file is kept when every attempt fails.
pub fn optimize(job: &OptimizeJob) {
    // A wider rendition may have replaced the file since this job was
    // queued; its optimization is queued behind us, so leave it alone.
    match fs::metadata(&job.path) {
        Ok(meta) if meta.len() > job.size => {
            log::trace!("{}: grew since enqueue, skipping", job.path.display());
            return;
        }
        Ok(_) => {}
        Err(_) => return,
    }

    // Formats without a shrinking tool (SVG, audio) pass through untouched.
    let Some(mut format) = Format::from_path(&job.path) else {
        return;
    };
    for _attempt in 0..OPTIMIZE_ATTEMPTS {
        match shrink(format, &job.path) {
            Ok(()) => return,
            Err(err) => {
                log::debug!("{}: optimization failed: {err}", job.path.display());
                // The extension may simply be lying about the content.
                if let Some(probed) = probe_format(&job.path) {
                    format = probed;
                }
            }
        }
    }

    log::warn!(
        "{}: could not be optimized, keeping the original",
        job.path.display()
    );
}

/// Runs the format-specific shrinking tool. The path is always a single
/// argv element; nothing here goes through a shell.
fn shrink(format: Format, path: &Path) -> std::io::Result<()> {
    match format {
        Format::Jpeg => {
            run(Command::new("jpegoptim")
                .args(["-s", "-f", "--all-normal", "-m40"])
                .arg(path))
        }
        Format::Png => {
            let tmp_ext = format!(".{:08x}.png", random_tag(path));
            run(Command::new("pngquant")
                .args(["--nofs", "--force"])
                .arg(format!("--ext={tmp_ext}"))
                .arg(path))?;

            let tmp = sibling(path, ".png", &tmp_ext);
            let _cleanup = scopeguard::guard(tmp.clone(), |tmp| {
                let _ = fs::remove_file(tmp);
            });
            run(Command::new("advdef").args(["-q", "-z", "-4", "-i", "5"]).arg(&tmp))?;
            replace_if_smaller(&tmp, path)
        }
        Format::Gif => {
            let tmp = sibling(path, "", &format!(".{:08x}.gif", random_tag(path)));
            let _cleanup = scopeguard::guard(tmp.clone(), |tmp| {
                let _ = fs::remove_file(tmp);
            });
            run(Command::new("gifsicle")
                .args(["--colors", "64", "-O3"])
                .arg(path)
                .arg("-o")
                .arg(&tmp))?;
            replace_if_smaller(&tmp, path)
        }
    }
}

/// Asks `file` what the content actually is.
fn probe_format(path: &Path) -> Option<Format> {
    let output = Command::new("file")
        .args(["-b", "--mime-type"])
        .arg(path)
        .output()
        .ok()?;
    output
        .status
        .success()
        .then(|| Format::from_mime(&String::from_utf8_lossy(&output.stdout)))
        .flatten()
}

/// Runs a command, mapping non-zero exit to an error.
fn run(command: &mut Command) -> std::io::Result<()> {
    let status = command.status()?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!(
            "{:?} exited with {status}",
            command.get_program()
        )))
    }
}

/// Accepts the optimized candidate only when it is strictly smaller.
fn replace_if_smaller(candidate: &Path, path: &Path) -> std::io::Result<()> {
    let new_size = fs::metadata(candidate)?.len();
    let old_size = fs::metadata(path)?.len();
    if new_size < old_size {
        fs::rename(candidate, path)?;
    }
    Ok(())
}

/// The sibling path produced by replacing `strip` (a suffix of the file
/// name, possibly empty) with `ext`.
fn sibling(path: &Path, strip: &str, ext: &str) -> PathBuf {
    let name = path.file_name().unwrap_or_default().to_string_lossy();
    let stem = name.strip_suffix(strip).unwrap_or(&name);
    path.with_file_name(format!("{stem}{ext}"))
}

/// A cheap unique tag for temporary file names.
fn random_tag(path: &Path) -> u32 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::from(elapsed.subsec_nanos()));
    let spice = path.as_os_str().len() as u64;
    SmallRng::seed_from_u64(nanos ^ (u64::from(std::process::id()) << 32) ^ spice).random()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn thumb_url_parses() {
        let media = parse_media_url(
            "https://upload.example.org/wikipedia/commons/thumb/a/a2/Foo_bar.jpg/300px-Foo_bar.jpg",
        )
        .unwrap();
        assert_eq!(media.filename_base, "Foo_bar.jpg");
        assert_eq!(media.width, 300);
        assert_eq!(media.ext(), ".jpg");
    }

    #[test]
    fn unscaled_url_is_full_width() {
        let media = parse_media_url(
            "https://upload.example.org/wikipedia/commons/a/a2/Foo_bar.jpg",
        )
        .unwrap();
        assert_eq!(media.filename_base, "Foo_bar.jpg");
        assert_eq!(media.width, WIDTH_FULL);
    }

    #[test]
    fn math_render_gets_svg_extension() {
        let media = parse_media_url(
            "https://wikimedia.example.org/api/rest_v1/media/math/render/svg/2a9d7e6c4b0f",
        )
        .unwrap();
        assert_eq!(media.filename_base, "2a9d7e6c4b0f.svg");
        assert_eq!(media.width, WIDTH_FULL);
    }

    #[test]
    fn double_extension_survives() {
        let media = parse_media_url(
            "https://upload.example.org/math/thumb/Foo.svg/120px-Foo.svg.png",
        )
        .unwrap();
        assert_eq!(media.filename_base, "Foo.svg.png");
        assert_eq!(media.width, 120);
        assert_eq!(media.ext(), ".png");
    }

    #[test]
    fn unparseable_url_is_rejected() {
        assert_eq!(parse_media_url("no-slashes-here"), None);
    }

    #[test]
    fn media_base_decodes_and_fits() {
        let media = parse_media_url(
            "https://upload.example.org/a/a2/Caf%C3%A9.jpg",
        )
        .unwrap();
        assert_eq!(media_base(&media), "Café.jpg");
    }

    #[test]
    fn width_claims_escalate_only() {
        let store = Store::open("t_".to_string(), None).unwrap();
        let lock = Mutex::new(());
        let small = MediaRef {
            filename_base: "Foo.jpg".to_string(),
            width: 120,
        };
        let large = MediaRef {
            filename_base: "Foo.jpg".to_string(),
            width: 300,
        };

        assert!(claim_width(&store.media(), &lock, &small).unwrap());
        // A wider request upgrades the claim…
        assert!(claim_width(&store.media(), &lock, &large).unwrap());
        // …after which both the equal and the narrower request are no-ops.
        assert!(!claim_width(&store.media(), &lock, &large).unwrap());
        assert!(!claim_width(&store.media(), &lock, &small).unwrap());
        assert_eq!(
            store.media().hget("Foo.jpg").unwrap().as_deref(),
            Some("300")
        );
    }

    #[test]
    fn format_inference() {
        assert_eq!(
            Format::from_path(Path::new("m/Foo.JPG")),
            Some(Format::Jpeg)
        );
        assert_eq!(Format::from_path(Path::new("m/Foo.png")), Some(Format::Png));
        assert_eq!(Format::from_path(Path::new("m/Foo.webm")), None);
        assert_eq!(Format::from_mime("image/gif\n"), Some(Format::Gif));
    }

    #[test]
    fn sibling_names() {
        assert_eq!(
            sibling(Path::new("m/Foo.png"), ".png", ".1a2b3c4d.png"),
            Path::new("m/Foo.1a2b3c4d.png")
        );
        assert_eq!(
            sibling(Path::new("m/Foo.gif"), "", ".tmp.gif"),
            Path::new("m/Foo.gif.tmp.gif")
        );
    }
}
