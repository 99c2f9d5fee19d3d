//! The content-addressed disk cache of fetched bodies.
//!
//! Entries are keyed by `SHA1(url)` truncated to 20 hex characters. Each
//! entry is a body file plus a `.h` sidecar holding the response headers as
//! JSON; media entries live under `m/` with their file extension appended
//! and a synthetic `width` header recording the rendition that was fetched.
//! A body without its sidecar is treated as absent.
//!
//! Staleness is tracked with modification times: a `ref` sentinel file is
//! written when the run starts, every entry used during the run has its
//! mtime refreshed, and the end-of-run sweep deletes whatever is still older
//! than the sentinel.

use crate::fetch::Headers;
use filetime::FileTime;
use sha1::{Digest as _, Sha1};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

/// The synthetic header recording a media entry's rendition width.
pub const WIDTH_HEADER: &str = "width";

/// Errors that may occur when using the disk cache.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The cache directory could not be prepared.
    #[error("{1}: cannot prepare cache directory: {0}")]
    Prepare(std::io::Error, PathBuf),

    /// An entry could not be written.
    #[error("{1}: cache write error: {0}")]
    Write(std::io::Error, PathBuf),

    /// The staleness sweep failed.
    #[error("cache sweep error: {0}")]
    Sweep(std::io::Error),
}

/// A handle to the run's cache directory.
pub struct Cache {
    /// The per-run cache root, `{cacheDirectory}/{radical}`.
    root: PathBuf,
}

/// Hex-encodes the first 10 bytes (20 hex characters) of `SHA1(url)`.
fn url_hash(url: &str) -> String {
    use core::fmt::Write as _;

    let digest = Sha1::digest(url.as_bytes());
    let mut out = String::with_capacity(20);
    for byte in &digest[..10] {
        write!(out, "{byte:02x}").expect("writing to a String cannot fail");
    }
    out
}

impl Cache {
    /// Opens the cache root, creating it and the `m/` media subdirectory if
    /// needed, and stamps the `ref` staleness sentinel.
    pub fn prepare(root: PathBuf) -> Result<Self, Error> {
        fs::create_dir_all(root.join("m")).map_err(|err| Error::Prepare(err, root.clone()))?;
        let sentinel = root.join("ref");
        fs::write(&sentinel, b"").map_err(|err| Error::Prepare(err, sentinel))?;
        Ok(Self { root })
    }

    /// The on-disk body path for a page entry.
    fn page_path(&self, url: &str) -> PathBuf {
        self.root.join(url_hash(url))
    }

    /// The on-disk body path for a media entry.
    pub fn media_path(&self, url: &str, ext: &str) -> PathBuf {
        let mut name = url_hash(url);
        if !ext.is_empty() {
            name.push_str(ext);
        }
        self.root.join("m").join(name)
    }

    /// Looks up a page entry, refreshing its mtime on hit. The caller gets
    /// the body and parsed headers exactly as a fresh fetch would produce
    /// them.
    pub fn lookup(&self, url: &str) -> Option<(Vec<u8>, Headers)> {
        self.lookup_at(&self.page_path(url))
    }

    /// Reads the headers sidecar of a media entry without touching the body.
    pub fn media_headers(&self, path: &Path) -> Option<Headers> {
        let raw = fs::read(sidecar(path)).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    /// Refreshes an entry's mtimes so the end-of-run sweep keeps it.
    pub fn touch(&self, path: &Path) {
        let now = FileTime::now();
        let _ = filetime::set_file_mtime(path, now);
        let _ = filetime::set_file_mtime(sidecar(path), now);
    }

    /// Stores a page entry.
    pub fn store(&self, url: &str, body: &[u8], headers: &Headers) -> Result<PathBuf, Error> {
        let path = self.page_path(url);
        self.store_at(&path, body, headers)?;
        Ok(path)
    }

    /// Stores a media entry, recording the fetched rendition width in the
    /// sidecar.
    pub fn store_media(
        &self,
        path: &Path,
        body: &[u8],
        headers: &Headers,
        width: u32,
    ) -> Result<(), Error> {
        let mut headers = headers.clone();
        headers.insert(WIDTH_HEADER.to_string(), width.to_string());
        self.store_at(path, body, &headers)
    }

    /// Publishes a cache body into the output tree: a symlink when the
    /// filesystem supports one, otherwise a copy.
    pub fn publish(&self, body: &Path, dest: &Path) -> std::io::Result<()> {
        match fs::remove_file(dest) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        if std::os::unix::fs::symlink(body, dest).is_err() {
            fs::copy(body, dest)?;
        }
        Ok(())
    }

    /// Deletes every cache file whose mtime predates the `ref` sentinel.
    /// Entries used during this run were refreshed on access and survive.
    pub fn sweep(&self) -> Result<usize, Error> {
        let sentinel = fs::metadata(self.root.join("ref")).map_err(Error::Sweep)?;
        let cutoff = FileTime::from_last_modification_time(&sentinel);

        let mut removed = 0;
        for dir in [self.root.clone(), self.root.join("m")] {
            for entry in fs::read_dir(&dir).map_err(Error::Sweep)? {
                let entry = entry.map_err(Error::Sweep)?;
                let path = entry.path();
                if !entry.file_type().map_err(Error::Sweep)?.is_file()
                    || path.file_name().is_some_and(|name| name == "ref")
                {
                    continue;
                }
                let meta = entry.metadata().map_err(Error::Sweep)?;
                if FileTime::from_last_modification_time(&meta) < cutoff {
                    fs::remove_file(&path).map_err(Error::Sweep)?;
                    removed += 1;
                }
            }
        }

        log::info!("Swept {removed} stale cache files");
        Ok(removed)
    }

    fn lookup_at(&self, path: &Path) -> Option<(Vec<u8>, Headers)> {
        let sidecar = sidecar(path);
        let raw_headers = fs::read(&sidecar).ok()?;
        let headers = serde_json::from_slice::<Headers>(&raw_headers).ok()?;
        let body = fs::read(path).ok()?;

        // Refresh both files so the end-of-run sweep keeps them.
        self.touch(path);

        Some((body, headers))
    }

    fn store_at(&self, path: &Path, body: &[u8], headers: &Headers) -> Result<(), Error> {
        fs::write(path, body).map_err(|err| Error::Write(err, path.to_path_buf()))?;
        let sidecar = sidecar(path);
        let serialized = serde_json::to_vec(headers)
            .expect("string maps always serialize");
        fs::write(&sidecar, serialized).map_err(|err| Error::Write(err, sidecar))
    }
}

/// The headers sidecar path for a body path.
fn sidecar(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".h");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>()
    }

    #[test]
    fn hash_is_stable() {
        // SHA-1 of a fixed URL must never change across runs or releases;
        // the whole cache keying scheme depends on it.
        assert_eq!(
            url_hash("https://example.com/wiki"),
            "06dff4fc50d28e7fc474"
        );
        assert_eq!(url_hash("https://example.com/wiki").len(), 20);
    }

    #[test]
    fn page_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::prepare(dir.path().join("c")).unwrap();
        let sent = headers(&[("content-type", "text/html")]);

        assert!(cache.lookup("https://example.com/A").is_none());
        cache.store("https://example.com/A", b"body", &sent).unwrap();

        let (body, got) = cache.lookup("https://example.com/A").unwrap();
        assert_eq!(body, b"body");
        assert_eq!(got, sent);
    }

    #[test]
    fn missing_sidecar_invalidates_body() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::prepare(dir.path().join("c")).unwrap();
        cache
            .store("https://example.com/A", b"body", &headers(&[]))
            .unwrap();

        let body = cache.page_path("https://example.com/A");
        fs::remove_file(sidecar(&body)).unwrap();
        assert!(cache.lookup("https://example.com/A").is_none());
    }

    #[test]
    fn media_width_in_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::prepare(dir.path().join("c")).unwrap();
        let path = cache.media_path("https://example.com/Foo.jpg", ".jpg");
        cache
            .store_media(&path, b"jpeg", &headers(&[]), 320)
            .unwrap();

        let got = cache.media_headers(&path).unwrap();
        assert_eq!(got.get(WIDTH_HEADER).map(String::as_str), Some("320"));
    }

    #[test]
    fn sweep_removes_only_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::prepare(dir.path().join("c")).unwrap();
        cache
            .store("https://example.com/old", b"old", &headers(&[]))
            .unwrap();
        cache
            .store("https://example.com/new", b"new", &headers(&[]))
            .unwrap();

        // Backdate one entry behind the sentinel.
        let old = cache.page_path("https://example.com/old");
        let past = FileTime::from_unix_time(1_000_000, 0);
        filetime::set_file_mtime(&old, past).unwrap();
        filetime::set_file_mtime(sidecar(&old), past).unwrap();

        assert_eq!(cache.sweep().unwrap(), 2);
        assert!(cache.lookup("https://example.com/old").is_none());
        assert!(cache.lookup("https://example.com/new").is_some());
    }

    #[test]
    fn publish_links_into_tree() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::prepare(dir.path().join("c")).unwrap();
        let body = cache.media_path("https://example.com/Foo.png", ".png");
        cache
            .store_media(&body, b"png", &headers(&[]), 64)
            .unwrap();

        let out = dir.path().join("m");
        fs::create_dir_all(&out).unwrap();
        let dest = out.join("Foo.png");
        cache.publish(&body, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"png");

        // Publishing again over an existing link must not fail.
        cache.publish(&body, &dest).unwrap();
    }
}
