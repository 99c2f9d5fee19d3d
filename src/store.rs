//! The run's coordination store: a hash-of-hashes key/value abstraction.
//!
//! Four sub-databases, each named `{runPrefix}{suffix}`, hold the state the
//! pipeline stages share: `r` (redirects), `d` (article details), `m`
//! (media widths), and `c` (cached media needing a width check on a future
//! run). The store is the only cross-stage mutable state, so any error here
//! is fatal to the run; there is no way to rebuild half of it mid-crawl.
//!
//! By default the store lives in process memory. When `--redisSocket` is
//! given, it speaks RESP over a unix socket instead, so several tools can
//! share one coordination server.

use indexmap::IndexMap;
use parking_lot::Mutex;
use std::{collections::HashMap, path::Path};

/// Errors that may occur when talking to the store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The server rejected a command.
    #[error("store error: {0}")]
    Command(String),

    /// An I/O error occurred on the store socket.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The server sent something that is not RESP.
    #[error("malformed store reply: {0}")]
    Protocol(String),
}

/// Suffixes of the four sub-databases.
const REDIRECTS: &str = "r";
const DETAILS: &str = "d";
const MEDIA: &str = "m";
const CACHED_MEDIA: &str = "c";

/// One in-memory database: field → value, insertion-ordered so that runs
/// enumerate redirects deterministically.
type MemoryDb = IndexMap<String, String>;

/// The store backend.
enum Backend {
    /// Process-local storage.
    Memory(Mutex<HashMap<String, MemoryDb>>),
    /// A RESP server on a unix socket.
    Redis(Mutex<resp::Connection>),
}

/// The run's key/value store.
pub struct Store {
    backend: Backend,
    /// Run-unique database name prefix.
    prefix: String,
}

impl Store {
    /// Opens the store, in memory or against the given RESP socket.
    ///
    /// `prefix` must be unique per run; the four sub-database names derive
    /// from it.
    pub fn open(prefix: String, socket: Option<&Path>) -> Result<Self, Error> {
        let backend = match socket {
            Some(path) => Backend::Redis(Mutex::new(resp::Connection::open(path)?)),
            None => Backend::Memory(Mutex::new(HashMap::new())),
        };
        Ok(Self { backend, prefix })
    }

    /// The redirects database (`src title → dst title`).
    pub fn redirects(&self) -> Db<'_> {
        self.db(REDIRECTS)
    }

    /// The article details database (`title → {t, g?}` JSON).
    pub fn details(&self) -> Db<'_> {
        self.db(DETAILS)
    }

    /// The media widths database (`filename base → widest requested width`).
    pub fn media(&self) -> Db<'_> {
        self.db(MEDIA)
    }

    /// The database of cache entries whose width should be re-checked by a
    /// future run.
    pub fn cached_media(&self) -> Db<'_> {
        self.db(CACHED_MEDIA)
    }

    /// Deletes all four sub-databases. Called on normal exit only, so an
    /// aborted run leaves its state behind for inspection.
    pub fn delete_databases(&self) -> Result<(), Error> {
        let names = [REDIRECTS, DETAILS, MEDIA, CACHED_MEDIA].map(|s| format!("{}{s}", self.prefix));
        match &self.backend {
            Backend::Memory(dbs) => {
                let mut dbs = dbs.lock();
                for name in &names {
                    dbs.remove(name);
                }
                Ok(())
            }
            Backend::Redis(conn) => {
                let mut args = vec!["DEL".to_string()];
                args.extend(names);
                conn.lock().command(&args).map(drop)
            }
        }
    }

    /// Says goodbye to a RESP backend. A no-op for the in-memory store.
    pub fn quit(&self) {
        if let Backend::Redis(conn) = &self.backend {
            let _ = conn.lock().command(&["QUIT".to_string()]);
        }
    }

    fn db(&self, suffix: &str) -> Db<'_> {
        Db {
            store: self,
            name: format!("{}{suffix}", self.prefix),
        }
    }
}

/// A handle to one sub-database.
pub struct Db<'a> {
    store: &'a Store,
    name: String,
}

impl Db<'_> {
    /// Sets one field.
    pub fn hset(&self, field: &str, value: &str) -> Result<(), Error> {
        match &self.store.backend {
            Backend::Memory(dbs) => {
                dbs.lock()
                    .entry(self.name.clone())
                    .or_default()
                    .insert(field.to_string(), value.to_string());
                Ok(())
            }
            Backend::Redis(conn) => conn
                .lock()
                .command(&[
                    "HSET".to_string(),
                    self.name.clone(),
                    field.to_string(),
                    value.to_string(),
                ])
                .map(drop),
        }
    }

    /// Sets many fields at once.
    pub fn hmset<'i>(
        &self,
        pairs: impl IntoIterator<Item = (&'i str, &'i str)>,
    ) -> Result<(), Error> {
        match &self.store.backend {
            Backend::Memory(dbs) => {
                let mut dbs = dbs.lock();
                let db = dbs.entry(self.name.clone()).or_default();
                for (field, value) in pairs {
                    db.insert(field.to_string(), value.to_string());
                }
                Ok(())
            }
            Backend::Redis(conn) => {
                let mut args = vec!["HMSET".to_string(), self.name.clone()];
                let before = args.len();
                for (field, value) in pairs {
                    args.push(field.to_string());
                    args.push(value.to_string());
                }
                if args.len() == before {
                    return Ok(());
                }
                conn.lock().command(&args).map(drop)
            }
        }
    }

    /// Gets a field's value.
    pub fn hget(&self, field: &str) -> Result<Option<String>, Error> {
        match &self.store.backend {
            Backend::Memory(dbs) => Ok(dbs
                .lock()
                .get(&self.name)
                .and_then(|db| db.get(field).cloned())),
            Backend::Redis(conn) => {
                match conn
                    .lock()
                    .command(&[
                        "HGET".to_string(),
                        self.name.clone(),
                        field.to_string(),
                    ])? {
                    resp::Reply::Nil => Ok(None),
                    resp::Reply::Bulk(value) => Ok(Some(value)),
                    other => Err(other.unexpected("HGET")),
                }
            }
        }
    }

    /// Lists every field.
    pub fn hkeys(&self) -> Result<Vec<String>, Error> {
        match &self.store.backend {
            Backend::Memory(dbs) => Ok(dbs
                .lock()
                .get(&self.name)
                .map(|db| db.keys().cloned().collect())
                .unwrap_or_default()),
            Backend::Redis(conn) => {
                match conn
                    .lock()
                    .command(&["HKEYS".to_string(), self.name.clone()])?
                {
                    resp::Reply::Array(items) => Ok(items),
                    other => Err(other.unexpected("HKEYS")),
                }
            }
        }
    }

    /// Returns true if a field exists.
    #[allow(dead_code)]
    pub fn hexists(&self, field: &str) -> Result<bool, Error> {
        match &self.store.backend {
            Backend::Memory(dbs) => Ok(dbs
                .lock()
                .get(&self.name)
                .is_some_and(|db| db.contains_key(field))),
            Backend::Redis(conn) => {
                match conn
                    .lock()
                    .command(&[
                        "HEXISTS".to_string(),
                        self.name.clone(),
                        field.to_string(),
                    ])? {
                    resp::Reply::Integer(n) => Ok(n != 0),
                    other => Err(other.unexpected("HEXISTS")),
                }
            }
        }
    }

    /// Removes a field.
    pub fn hdel(&self, field: &str) -> Result<(), Error> {
        match &self.store.backend {
            Backend::Memory(dbs) => {
                if let Some(db) = dbs.lock().get_mut(&self.name) {
                    db.shift_remove(field);
                }
                Ok(())
            }
            Backend::Redis(conn) => conn
                .lock()
                .command(&[
                    "HDEL".to_string(),
                    self.name.clone(),
                    field.to_string(),
                ])
                .map(drop),
        }
    }

    /// The number of fields.
    pub fn len(&self) -> Result<usize, Error> {
        match &self.store.backend {
            Backend::Memory(dbs) => {
                Ok(dbs.lock().get(&self.name).map_or(0, MemoryDb::len))
            }
            Backend::Redis(conn) => {
                match conn
                    .lock()
                    .command(&["HLEN".to_string(), self.name.clone()])?
                {
                    resp::Reply::Integer(n) => Ok(usize::try_from(n).unwrap_or(0)),
                    other => Err(other.unexpected("HLEN")),
                }
            }
        }
    }
}

/// A minimal RESP (redis serialization protocol) client.
mod resp {
    use super::Error;
    use std::io::{BufRead, BufReader, Read as _, Write};
    use std::os::unix::net::UnixStream;
    use std::path::Path;

    /// A single server reply.
    #[derive(Debug, PartialEq, Eq)]
    pub enum Reply {
        /// `+OK` style status line.
        Status(String),
        /// `:n` integer.
        Integer(i64),
        /// `$n` bulk string.
        Bulk(String),
        /// `$-1` missing value.
        Nil,
        /// `*n` array of bulk strings.
        Array(Vec<String>),
    }

    impl Reply {
        /// Builds the error for a reply of the wrong shape.
        pub fn unexpected(self, command: &str) -> Error {
            Error::Protocol(format!("unexpected reply to {command}: {self:?}"))
        }
    }

    /// A connection to a RESP server.
    pub struct Connection {
        reader: BufReader<UnixStream>,
        writer: UnixStream,
    }

    impl Connection {
        /// Connects to the server at the given unix socket path.
        pub fn open(path: &Path) -> Result<Self, Error> {
            let stream = UnixStream::connect(path)?;
            let writer = stream.try_clone()?;
            Ok(Self {
                reader: BufReader::new(stream),
                writer,
            })
        }

        /// Sends one command and reads its reply. Error replies become
        /// [`Error::Command`], which callers treat as fatal.
        pub fn command(&mut self, args: &[String]) -> Result<Reply, Error> {
            let mut out = format!("*{}\r\n", args.len()).into_bytes();
            for arg in args {
                out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
                out.extend_from_slice(arg.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            self.writer.write_all(&out)?;
            self.read_reply()
        }

        fn read_line(&mut self) -> Result<String, Error> {
            let mut line = String::new();
            self.reader.read_line(&mut line)?;
            let line = line
                .strip_suffix("\r\n")
                .or_else(|| line.strip_suffix('\n'))
                .unwrap_or(&line);
            Ok(line.to_string())
        }

        fn read_bulk(&mut self, header: &str) -> Result<Option<String>, Error> {
            let len = header
                .parse::<i64>()
                .map_err(|_| Error::Protocol(format!("bad bulk length {header:?}")))?;
            if len < 0 {
                return Ok(None);
            }
            // Clippy: RESP lengths are non-negative here and bounded by the
            // value sizes this tool itself wrote.
            #[allow(clippy::cast_sign_loss)]
            let mut buf = vec![0; len as usize + 2];
            self.reader.read_exact(&mut buf)?;
            buf.truncate(buf.len() - 2);
            String::from_utf8(buf)
                .map(Some)
                .map_err(|err| Error::Protocol(err.to_string()))
        }

        fn read_reply(&mut self) -> Result<Reply, Error> {
            let line = self.read_line()?;
            let (kind, rest) = line.split_at(1.min(line.len()));
            match kind {
                "+" => Ok(Reply::Status(rest.to_string())),
                "-" => Err(Error::Command(rest.to_string())),
                ":" => rest
                    .parse()
                    .map(Reply::Integer)
                    .map_err(|_| Error::Protocol(format!("bad integer {rest:?}"))),
                "$" => Ok(self
                    .read_bulk(rest)?
                    .map_or(Reply::Nil, Reply::Bulk)),
                "*" => {
                    let count = rest
                        .parse::<i64>()
                        .map_err(|_| Error::Protocol(format!("bad array length {rest:?}")))?;
                    let mut items = Vec::new();
                    for _ in 0..count.max(0) {
                        let header = self.read_line()?;
                        let Some(payload) = header.strip_prefix('$') else {
                            return Err(Error::Protocol(format!(
                                "expected bulk string in array, got {header:?}"
                            )));
                        };
                        if let Some(item) = self.read_bulk(payload)? {
                            items.push(item);
                        }
                    }
                    Ok(Reply::Array(items))
                }
                _ => Err(Error::Protocol(format!("unknown reply {line:?}"))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_store() -> Store {
        Store::open("t1_".to_string(), None).unwrap()
    }

    #[test]
    fn hash_round_trip() {
        let store = memory_store();
        let media = store.media();
        media.hset("Foo.jpg", "300").unwrap();
        assert_eq!(media.hget("Foo.jpg").unwrap().as_deref(), Some("300"));
        assert!(media.hexists("Foo.jpg").unwrap());
        assert!(!media.hexists("Bar.jpg").unwrap());
        media.hdel("Foo.jpg").unwrap();
        assert_eq!(media.hget("Foo.jpg").unwrap(), None);
    }

    #[test]
    fn databases_are_disjoint() {
        let store = memory_store();
        store.redirects().hset("A", "B").unwrap();
        assert!(!store.details().hexists("A").unwrap());
        assert_eq!(store.redirects().hkeys().unwrap(), vec!["A"]);
    }

    #[test]
    fn hmset_preserves_order() {
        let store = memory_store();
        let redirects = store.redirects();
        redirects
            .hmset([("C", "X"), ("A", "X"), ("B", "X")])
            .unwrap();
        assert_eq!(redirects.hkeys().unwrap(), vec!["C", "A", "B"]);
        assert_eq!(redirects.len().unwrap(), 3);
    }

    #[test]
    fn delete_databases_clears_state() {
        let store = memory_store();
        store.redirects().hset("A", "B").unwrap();
        store.delete_databases().unwrap();
        assert_eq!(store.redirects().len().unwrap(), 0);
    }
}
