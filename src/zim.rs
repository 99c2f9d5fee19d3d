//! The output surfaces fed to the archive builder: the redirect index (or
//! HTML redirect files), the favicon, the `index.htm` main page, and the
//! `zimwriterfs` invocation itself.

use crate::{context::Context, config::Variant, title};
use std::{
    fs,
    io::Write as _,
    path::{Path, PathBuf},
    process::Command,
};

/// Errors that may occur while producing outputs.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The archive builder rejected the tree.
    #[error("zimwriterfs failed with {0}")]
    Builder(std::process::ExitStatus),

    /// `convert` could not resize the favicon.
    #[error("favicon conversion failed with {0}")]
    Convert(std::process::ExitStatus),

    /// A file could not be written.
    #[error("{1}: I/O error: {0}")]
    Io(std::io::Error, PathBuf),

    /// The coordination store failed while reading redirects.
    #[error(transparent)]
    Store(#[from] crate::store::Error),
}

/// Writes the TAB-separated redirect index the archive builder consumes.
/// Returns the number of redirects written.
///
/// One line per redirect: `A<TAB>srcFile<TAB>src title<TAB>dstFile`.
/// Sources that are themselves mirrored articles are skipped; a title is an
/// article or a redirect, never both.
pub fn write_redirect_index(ctx: &Context, path: &Path) -> Result<usize, Error> {
    let io_err = |err| Error::Io(err, path.to_path_buf());
    let mut out = std::io::BufWriter::new(fs::File::create(path).map_err(io_err)?);
    let redirects = ctx.store.redirects();

    let mut written = 0;
    for source in redirects.hkeys()? {
        if ctx.articles.contains_key(&source) {
            continue;
        }
        let Some(target) = redirects.hget(&source)? else {
            continue;
        };
        writeln!(
            out,
            "A\t{}\t{}\t{}",
            title::article_filename(&source),
            title::with_spaces(&source),
            title::article_filename(&target),
        )
        .map_err(io_err)?;
        written += 1;
    }
    out.flush().map_err(io_err)?;
    Ok(written)
}

/// Writes one meta-refresh HTML file per redirect instead of an index.
pub fn write_html_redirects(ctx: &Context, html_root: &Path) -> Result<usize, Error> {
    let redirects = ctx.store.redirects();
    let mut written = 0;
    for source in redirects.hkeys()? {
        if ctx.articles.contains_key(&source) {
            continue;
        }
        let Some(target) = redirects.hget(&source)? else {
            continue;
        };
        let path = html_root.join(title::article_filename(&source));
        let html = redirect_page(&title::with_spaces(&source), &title::article_filename(&target));
        fs::write(&path, html).map_err(|err| Error::Io(err, path))?;
        written += 1;
    }
    Ok(written)
}

/// A minimal page bouncing the reader to `target`.
fn redirect_page(display: &str, target: &str) -> String {
    let display = html_escape::encode_text(display);
    let href = html_escape::encode_double_quoted_attribute(target);
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
         <title>{display}</title>\n\
         <meta http-equiv=\"refresh\" content=\"0;url={href}\">\n</head>\n\
         <body>\n<a href=\"{href}\">{display}</a>\n</body>\n</html>\n"
    )
}

/// Downloads the wiki logo (or the configured favicon) and resizes it to
/// the 48×48 `favicon.png` the archive format expects.
pub fn save_favicon(ctx: &Context, html_root: &Path) -> Result<(), Error> {
    let Some(source) = ctx
        .config
        .custom_zim_favicon
        .clone()
        .or_else(|| ctx.site.logo.clone())
    else {
        log::warn!("No favicon source; the archive will have none");
        return Ok(());
    };

    let url = ctx.client.absolute(&source);
    let payload = ctx.client.fetch_or_empty(&url);
    if payload.body.is_empty() {
        log::warn!("{url}: favicon download failed; the archive will have none");
        return Ok(());
    }

    let scratch = ctx.config.tmp_directory.join("favicon");
    fs::write(&scratch, &payload.body).map_err(|err| Error::Io(err, scratch.clone()))?;

    let favicon = html_root.join("favicon.png");
    let status = Command::new("convert")
        .arg(&scratch)
        .args(["-thumbnail", "48x48!", "-background", "white", "-flatten"])
        .arg(&favicon)
        .status()
        .map_err(|err| Error::Io(err, favicon.clone()))?;
    let _ = fs::remove_file(&scratch);
    if status.success() {
        Ok(())
    } else {
        Err(Error::Convert(status))
    }
}

/// Writes `index.htm`: an article list when mirroring from a titles file,
/// otherwise a redirect to the main page.
pub fn write_main_page(ctx: &Context, html_root: &Path) -> Result<(), Error> {
    let path = html_root.join("index.htm");
    let html = if ctx.config.article_list.is_some() {
        let mut out = String::from(
            "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>Index</title>\n\
             <link rel=\"stylesheet\" href=\"s/style.css\">\n</head>\n<body>\n<ul>\n",
        );
        for article in ctx.articles.keys() {
            use core::fmt::Write as _;
            let _ = writeln!(
                out,
                "<li><a href=\"{}\">{}</a></li>",
                html_escape::encode_double_quoted_attribute(&title::article_filename(article)),
                html_escape::encode_text(&title::with_spaces(article)),
            );
        }
        out.push_str("</ul>\n</body>\n</html>\n");
        out
    } else {
        redirect_page(
            &title::with_spaces(&ctx.main_page),
            &title::article_filename(&ctx.main_page),
        )
    };
    fs::write(&path, html).map_err(|err| Error::Io(err, path))
}

/// The archive path for one variant.
pub fn archive_file(config: &crate::config::Config, variant: Variant) -> PathBuf {
    config
        .output_directory
        .join(format!("{}.zim", config.dump_radical(variant)))
}

/// Invokes `zimwriterfs` over the finished tree. All paths are argv
/// elements; no shell is involved.
pub fn build_zim(
    ctx: &Context,
    variant: Variant,
    html_root: &Path,
    redirect_index: Option<&Path>,
) -> Result<PathBuf, Error> {
    let out = archive_file(&ctx.config, variant);

    // The single welcome page: the mirrored main-page article when one was
    // configured, the generated index otherwise.
    let welcome = if ctx.config.custom_main_page.is_some() {
        title::article_filename(&ctx.main_page)
    } else {
        "index.htm".to_string()
    };

    let default_title = &ctx.site.site_name;
    let zim_title = ctx.config.custom_zim_title.as_deref().unwrap_or(default_title);
    let description = ctx
        .config
        .custom_zim_description
        .as_deref()
        .unwrap_or(&ctx.subtitle);

    let mut command = Command::new("zimwriterfs");
    command
        .arg("--welcome")
        .arg(&welcome)
        .arg("--favicon")
        .arg("favicon.png")
        .arg("--language")
        .arg(&ctx.site.lang)
        .arg("--title")
        .arg(zim_title)
        .arg("--description")
        .arg(description)
        .arg("--creator")
        .arg(ctx.config.creator())
        .arg("--publisher")
        .arg(&ctx.config.publisher);
    if let Some(index) = redirect_index {
        command.arg("--redirects").arg(index);
    }
    if ctx.config.with_zim_full_text_index {
        command.arg("--withFullTextIndex");
    }
    command.arg(html_root).arg(&out);

    log::info!("Building archive {}", out.display());
    let status = command
        .status()
        .map_err(|err| Error::Io(err, out.clone()))?;
    if status.success() {
        Ok(out)
    } else {
        Err(Error::Builder(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::context as test_context;

    #[test]
    fn redirect_page_escapes() {
        let html = redirect_page("A & B", "A_%26_B.html");
        assert!(html.contains("A &amp; B"), "{html}");
        assert!(html.contains("url=A_%26_B.html"), "{html}");
    }

    #[test]
    fn redirect_index_format() {
        let (ctx, dir) = test_context();
        ctx.store
            .redirects()
            .hmset([
                ("Paname", "Paris"),
                ("Lutèce", "Paris"),
                // An article shadowing a redirect name must win.
                ("Paris", "Main_Page"),
            ])
            .unwrap();

        let path = dir.path().join("redirects");
        let written = write_redirect_index(&ctx, &path).unwrap();
        assert_eq!(written, 2);

        let index = fs::read_to_string(&path).unwrap();
        assert!(
            index.contains("A\tPaname.html\tPaname\tParis.html\n"),
            "{index}"
        );
        assert!(
            index.contains("A\tLut%C3%A8ce.html\tLutèce\tParis.html\n"),
            "{index}"
        );
        assert!(!index.contains("Main_Page"), "{index}");
    }

    #[test]
    fn html_redirects_bounce_to_target() {
        let (ctx, dir) = test_context();
        ctx.store.redirects().hset("Old_name", "Paris").unwrap();

        let written = write_html_redirects(&ctx, dir.path()).unwrap();
        assert_eq!(written, 1);
        let html = fs::read_to_string(dir.path().join("Old_name.html")).unwrap();
        assert!(html.contains("0;url=Paris.html"), "{html}");
        assert!(html.contains("Old name"), "{html}");
    }

    #[test]
    fn main_page_redirects_by_default() {
        let (ctx, dir) = test_context();
        write_main_page(&ctx, dir.path()).unwrap();
        let html = fs::read_to_string(dir.path().join("index.htm")).unwrap();
        assert!(html.contains("0;url=Main_Page.html"), "{html}");
    }
}
