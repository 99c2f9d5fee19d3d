//! The bounded-retry HTTP client every pipeline stage downloads through.
//!
//! The client is deliberately boring: cookies ride along for the login
//! session, redirects are followed, and compression is negotiated explicitly
//! (`Accept-Encoding: gzip, deflate`) with the body decoded here so an
//! unsupported encoding is a visible error instead of garbage bytes.
//! Concurrency is bounded by the calling work queue, not in here.

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use serde::de::DeserializeOwned;
use std::{collections::BTreeMap, io::Read as _, thread, time::Duration};
use ureq::Agent;

/// How many times a download is attempted before giving up.
const ATTEMPTS: u32 = 3;

/// Upper bound on a single response body. Media files on large wikis run to
/// tens of megabytes; half a gigabyte is comfortably past anything sane.
const BODY_LIMIT: u64 = 512 * 1024 * 1024;

/// Response headers, lower-cased names to values.
pub type Headers = BTreeMap<String, String>;

/// A fetched response.
pub struct Payload {
    pub body: Vec<u8>,
    pub headers: Headers,
}

impl Payload {
    /// Deserializes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Errors that may occur when fetching.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The response body was compressed with something we did not ask for.
    #[error("{0}: unsupported content encoding '{1}'")]
    Encoding(String, String),

    /// The body failed to decompress.
    #[error("{0}: body decode error: {1}")]
    Decode(String, std::io::Error),

    /// The server kept answering with a non-200 status.
    #[error("{0}: HTTP status {1} after retries")]
    Status(String, u16),

    /// The transport kept failing.
    #[error("{0}: request failed after retries: {1}")]
    Transport(String, ureq::Error),
}

/// The shared HTTP client.
pub struct Client {
    agent: Agent,
    /// Base timeout; attempt `n` waits `n` times this long.
    timeout: Duration,
    /// Scheme of the wiki base URL, used to coerce scheme-less media URLs.
    scheme: &'static str,
    /// Host (and optional port) of the wiki base URL.
    host: String,
}

impl Client {
    /// Creates a client.
    ///
    /// `https` should reflect the wiki base URL's port: requests for URLs
    /// with no usable scheme are coerced to `https` when the wiki itself is
    /// on 443, else to `http`.
    pub fn new(user_agent: &str, host: &str, https: bool, timeout: Duration) -> Self {
        let agent = Agent::config_builder()
            .user_agent(user_agent)
            .http_status_as_error(false)
            .max_redirects(10)
            .build()
            .new_agent();
        Self {
            agent,
            timeout,
            scheme: if https { "https" } else { "http" },
            host: host.to_string(),
        }
    }

    /// Resolves a possibly scheme-less or host-relative URL against the
    /// wiki base. URLs on an unknown `://` scheme are coerced to the
    /// wiki's; non-hierarchical URLs (`data:`, `mailto:`) pass through.
    pub fn absolute(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else if let Some(rest) = url.strip_prefix("//") {
            format!("{}://{rest}", self.scheme)
        } else if let Some((_, rest)) = url.split_once("://") {
            format!("{}://{rest}", self.scheme)
        } else if url.starts_with('/') {
            format!("{}://{}{url}", self.scheme, self.host)
        } else if has_scheme(url) {
            url.to_string()
        } else {
            format!("{}://{}/{url}", self.scheme, self.host)
        }
    }

    /// Downloads a URL, retrying transient failures.
    ///
    /// Each attempt gets a longer timeout than the last. Socket-level
    /// failures back off `10 × attempt` seconds; request-level failures and
    /// non-200 statuses retry immediately.
    pub fn fetch(&self, url: &str) -> Result<Payload, Error> {
        let mut last_status = 0;
        let mut last_transport = None;

        for attempt in 1..=ATTEMPTS {
            match self.attempt(url, self.timeout * attempt) {
                Ok((200, headers, body)) => return decode(url, body, headers),
                Ok((status, ..)) => {
                    log::debug!("{url}: status {status} on attempt {attempt}");
                    last_status = status;
                }
                Err(err) if is_socket_error(&err) => {
                    log::debug!("{url}: socket error on attempt {attempt}: {err}");
                    last_transport = Some(err);
                    thread::sleep(Duration::from_secs(u64::from(10 * attempt)));
                }
                Err(err) => {
                    log::debug!("{url}: request error on attempt {attempt}: {err}");
                    last_transport = Some(err);
                }
            }
        }

        Err(match last_transport {
            Some(err) => Error::Transport(url.to_string(), err),
            None => Error::Status(url.to_string(), last_status),
        })
    }

    /// Downloads a URL; on exhausted retries, logs the failure and hands
    /// back an empty body so the crawl can continue.
    pub fn fetch_or_empty(&self, url: &str) -> Payload {
        match self.fetch(url) {
            Ok(payload) => payload,
            Err(err) => {
                log::error!("{err}");
                Payload {
                    body: Vec::new(),
                    headers: Headers::new(),
                }
            }
        }
    }

    /// Sends a form-encoded POST (the login handshake) without retry.
    pub fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<Payload, Error> {
        let mut response = self
            .agent
            .post(url)
            .send_form(form.iter().copied())
            .map_err(|err| Error::Transport(url.to_string(), err))?;
        let headers = collect_headers(response.headers());
        let body = response
            .body_mut()
            .with_config()
            .limit(BODY_LIMIT)
            .read_to_vec()
            .map_err(|err| Error::Transport(url.to_string(), err))?;
        decode(url, body, headers)
    }

    fn attempt(&self, url: &str, timeout: Duration) -> Result<(u16, Headers, Vec<u8>), ureq::Error> {
        let mut response = self
            .agent
            .get(url)
            .header("Accept-Encoding", "gzip, deflate")
            .config()
            .timeout_global(Some(timeout))
            .build()
            .call()?;

        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let body = response
            .body_mut()
            .with_config()
            .limit(BODY_LIMIT)
            .read_to_vec()?;
        Ok((status, headers, body))
    }
}

/// Returns true if `url` opens with a URI scheme.
fn has_scheme(url: &str) -> bool {
    url.split_once(':').is_some_and(|(scheme, _)| {
        scheme.starts_with(|c: char| c.is_ascii_alphabetic())
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '-'))
    })
}

/// Returns true for failures of the connection itself, which deserve a
/// backoff before the next attempt.
fn is_socket_error(err: &ureq::Error) -> bool {
    matches!(err, ureq::Error::Io(_) | ureq::Error::Timeout(_))
}

/// Lower-cases response headers into a plain map.
fn collect_headers(headers: &ureq::http::HeaderMap) -> Headers {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
        })
        .collect()
}

/// Decodes the body according to its `Content-Encoding`.
fn decode(url: &str, body: Vec<u8>, headers: Headers) -> Result<Payload, Error> {
    let encoding = headers
        .get("content-encoding")
        .map(String::as_str)
        .unwrap_or("identity");

    let body = match encoding {
        "identity" | "" => body,
        "gzip" => {
            let mut out = Vec::new();
            GzDecoder::new(&body[..])
                .read_to_end(&mut out)
                .map_err(|err| Error::Decode(url.to_string(), err))?;
            out
        }
        "deflate" => {
            // Some servers send a zlib stream, some a raw DEFLATE stream.
            let mut out = Vec::new();
            if ZlibDecoder::new(&body[..]).read_to_end(&mut out).is_err() {
                out.clear();
                DeflateDecoder::new(&body[..])
                    .read_to_end(&mut out)
                    .map_err(|err| Error::Decode(url.to_string(), err))?;
            }
            out
        }
        other => return Err(Error::Encoding(url.to_string(), other.to_string())),
    };

    Ok(Payload { body, headers })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Client {
        Client::new(
            "test/0",
            "en.example.org",
            true,
            Duration::from_secs(1),
        )
    }

    #[test]
    fn absolute_urls() {
        let client = client();
        assert_eq!(
            client.absolute("https://upload.example.org/a.png"),
            "https://upload.example.org/a.png"
        );
        assert_eq!(
            client.absolute("//upload.example.org/a.png"),
            "https://upload.example.org/a.png"
        );
        assert_eq!(
            client.absolute("/w/api.php"),
            "https://en.example.org/w/api.php"
        );
        assert_eq!(
            client.absolute("ftp://upload.example.org/a.png"),
            "https://upload.example.org/a.png"
        );
        assert_eq!(
            client.absolute("data:image/png;base64,xyz"),
            "data:image/png;base64,xyz"
        );
    }

    #[test]
    fn decode_gzip() {
        use flate2::{Compression, write::GzEncoder};
        use std::io::Write as _;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"hello").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut headers = Headers::new();
        headers.insert("content-encoding".to_string(), "gzip".to_string());
        let payload = decode("http://x", compressed, headers).unwrap();
        assert_eq!(payload.body, b"hello");
    }

    #[test]
    fn decode_rejects_unknown_encoding() {
        let mut headers = Headers::new();
        headers.insert("content-encoding".to_string(), "br".to_string());
        assert!(matches!(
            decode("http://x", vec![1, 2, 3], headers),
            Err(Error::Encoding(..))
        ));
    }

    #[test]
    fn decode_passes_identity_through() {
        let payload = decode("http://x", b"plain".to_vec(), Headers::new()).unwrap();
        assert_eq!(payload.body, b"plain");
    }
}
