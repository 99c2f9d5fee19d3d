//! Types and functions for canonical article titles and their on-disk names.
//!
//! A title has three spellings that must stay in sync for the archive to be
//! internally consistent: the canonical key (underscores, case preserved)
//! used for the coordination store and the article-id map; the display form
//! (spaces) used in the redirect index and page text; and the filename stem,
//! which is the canonical key percent-encoded with `/` folded to `_` and
//! truncated to fit the 250-byte filename ceiling.

use md5::{Digest as _, Md5};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::borrow::Cow;

/// The byte ceiling for emitted filenames, including the extension.
const MAX_FILENAME_BYTES: usize = 249;

/// Returns true if the given character `c` is a bidirectional text control
/// character.
fn bidi(c: char) -> bool {
    ('\u{200e}'..='\u{200f}').contains(&c) || ('\u{202a}'..='\u{202e}').contains(&c)
}

/// Returns true if the character `c` is considered like whitespace in title
/// text.
fn spacelike(c: char) -> bool {
    c == '_' || c.is_whitespace()
}

/// Returns true if the character `c` is trimmable in title text.
fn trimmable(c: char) -> bool {
    bidi(c) || spacelike(c)
}

/// Normalises a title into its canonical key: runs of whitespace and
/// underscores collapse into a single underscore, surrounding whitespace and
/// stray carriage returns are trimmed, and bidi markers are stripped. Case is
/// preserved.
pub fn normalize(text: &str) -> Cow<'_, str> {
    let mut out = String::new();
    let mut flushed = 0;
    let mut iter = text.char_indices().peekable();

    while let Some((index, c)) = iter.next() {
        // Peek to avoid switching to owned-mode when encountering a single
        // underscore that is already in canonical position
        if trimmable(c) && (c != '_' || matches!(iter.peek(), Some((_, c)) if trimmable(*c))) {
            while iter.next_if(|(_, c)| trimmable(*c)).is_some() {}

            // This acts like `trim`, not emitting an underscore at the start
            // (`index == 0`) or end (`peek().is_none()`) of the text.
            if let Some((next_index, _)) = iter.peek() {
                out += &text[flushed..index];
                flushed = *next_index;
                if index != 0 && spacelike(c) {
                    out.push('_');
                }
            }
        }
    }

    if flushed == 0 {
        Cow::Borrowed(text.trim_matches(trimmable))
    } else {
        out += text[flushed..].trim_end_matches(trimmable);
        Cow::Owned(out)
    }
}

/// The display form of a canonical title, with underscores restored to
/// spaces.
pub fn with_spaces(title: &str) -> Cow<'_, str> {
    if title.contains('_') {
        Cow::Owned(title.replace('_', " "))
    } else {
        Cow::Borrowed(title)
    }
}

/// The alphabet of characters to keep verbatim when encoding filename stems
/// and URL components, matching ECMAScript `encodeURIComponent`.
const COMPONENT: AsciiSet = NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Percent-encodes a URL component.
#[inline]
pub fn url_encode(input: &str) -> percent_encoding::PercentEncode<'_> {
    utf8_percent_encode(input, &COMPONENT)
}

/// Percent-decodes a URL component.
#[inline]
pub fn url_decode(input: &str) -> Cow<'_, str> {
    percent_encoding::percent_decode_str(input).decode_utf8_lossy()
}

/// The filename stem for an article title: slashes fold to underscores (the
/// output tree is flat) and the result is percent-encoded. Decoding a stem
/// yields the canonical title again, modulo that irreversible fold, and
/// re-encoding the decoded stem is idempotent.
pub fn article_base(title: &str) -> String {
    let flat = title.replace('/', "_");
    url_encode(&flat).to_string()
}

/// The on-disk filename for an article title, `.html` extension included and
/// truncated to the filename ceiling.
pub fn article_filename(title: &str) -> String {
    fit_filename(&article_base(title), "html")
}

/// Builds `{stem}.{ext}`, truncating over-long stems to the 250-byte
/// filename ceiling.
///
/// Over-long stems keep their first `239 - ext` bytes (backed off to a
/// character boundary, so multi-byte sequences never split) and gain a
/// two-hex-character MD5 suffix of the *full* stem, which keeps distinct
/// long names from colliding after truncation.
pub fn fit_filename(stem: &str, ext: &str) -> String {
    if stem.len() + ".".len() + ext.len() <= MAX_FILENAME_BYTES {
        return format!("{stem}.{ext}");
    }

    let keep = stem.floor_char_boundary(239 - ext.len());
    let digest = Md5::digest(stem.as_bytes());
    format!("{}{:02x}.{ext}", &stem[..keep], digest[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize() {
        assert_eq!(super::normalize("A b"), "A_b");
        assert_eq!(super::normalize("A_b"), Cow::Borrowed("A_b"));
        assert_eq!(super::normalize("A_______b"), "A_b");
        assert_eq!(super::normalize("A__  __b"), "A_b");
        assert_eq!(super::normalize("  A b \r"), "A_b");
        assert_eq!(super::normalize("A b\r\n"), "A_b");
        assert_eq!(super::normalize("\u{200e}A b\u{202e}"), "A_b");
        assert_eq!(super::normalize("Łódź"), Cow::Borrowed("Łódź"));
    }

    #[test]
    fn display_form() {
        assert_eq!(with_spaces("Foo_bar_baz"), "Foo bar baz");
        assert_eq!(with_spaces("Foo"), Cow::Borrowed("Foo"));
    }

    #[test]
    fn base_round_trip() {
        let base = article_base("Georges Méliès/filmography");
        assert_eq!(url_decode(&base), "Georges Méliès_filmography");
        // Re-encoding the decoded stem must be stable.
        assert_eq!(article_base(&url_decode(&base)), base);
    }

    #[test]
    fn filename_ceiling() {
        // 65 four-byte characters: 260 bytes of UTF-8.
        let title = "\u{1f4da}".repeat(65);
        let name = article_filename(&title);
        assert!(name.len() <= 250, "{} bytes", name.len());
        assert!(name.ends_with(".html"));
        // Percent-encoded stems are ASCII, so the cut lands exactly at
        // 239 - "html".len() bytes plus the two-hex suffix.
        assert_eq!(name.len(), 239 - 4 + 2 + ".html".len());
    }

    #[test]
    fn filename_ceiling_multibyte_safe() {
        // An unencoded stem exercises the char-boundary backoff directly.
        let stem = "é".repeat(130); // 260 bytes
        let name = fit_filename(&stem, "png");
        assert!(name.len() <= 250);
        assert!(name.is_char_boundary(name.len() - ".png".len() - 2));
        // Two distinct over-long stems keep distinct suffixes.
        let other = format!("{}X", "é".repeat(130));
        assert_ne!(name, fit_filename(&other, "png"));
    }

    #[test]
    fn short_names_untouched() {
        assert_eq!(fit_filename("Foo", "jpg"), "Foo.jpg");
    }
}
