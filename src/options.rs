use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::errors::FsError;
use crate::errors::Result;

/// Configuration recognized by the filesystem core.
///
/// Most fields are fixed once the filesystem is constructed and read
/// without synchronization. The three runtime-mutable knobs
/// ([`stream_threshold`](Options::stream_threshold),
/// [`must_crc32`](Options::must_crc32),
/// [`fd_cache_bypass`](Options::fd_cache_bypass)) are atomics whose changes
/// take effect at the next operation that reads them.
#[derive(Debug)]
pub struct Options {
    /// Absolute cap on simultaneously open archive descriptors.
    pub fd_limit: usize,
    /// Maximum number of cached archive readers. Must be strictly less
    /// than `fd_limit`.
    pub fd_cache_size: usize,
    /// Age after which an idle cached archive reader is evicted.
    pub fd_cache_ttl: Duration,
    /// Capacity of each pooled stream read buffer, in bytes.
    pub stream_pool_size: usize,
    /// Suppress the kernel keep-cache hints on open.
    pub strict_cache: bool,
    /// Repair entry names that are not valid UTF-8 from the Info-ZIP
    /// Unicode Path field, or synthesize placeholders.
    pub force_unicode: bool,
    /// Present every archive as a flat list of files instead of a tree.
    pub flatten_zips: bool,
    stream_threshold: AtomicU64,
    must_crc32: AtomicBool,
    fd_cache_bypass: AtomicBool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            fd_limit: 64,
            fd_cache_size: 16,
            fd_cache_ttl: Duration::from_secs(60),
            stream_pool_size: 128 * 1024,
            strict_cache: false,
            force_unicode: false,
            flatten_zips: false,
            stream_threshold: AtomicU64::new(4 * 1024 * 1024),
            must_crc32: AtomicBool::new(false),
            fd_cache_bypass: AtomicBool::new(false),
        }
    }
}

impl Options {
    /// File size above which lookups produce the streaming file variant.
    pub fn stream_threshold(&self) -> u64 {
        self.stream_threshold.load(Ordering::Relaxed)
    }

    /// Adjusts the streaming threshold at runtime.
    pub fn set_stream_threshold(&self, bytes: u64) {
        self.stream_threshold.store(bytes, Ordering::Relaxed);
    }

    /// Whether CRC-32 verification is forced even for stored entries
    /// (which disables their raw seekable read path).
    pub fn must_crc32(&self) -> bool {
        self.must_crc32.load(Ordering::Relaxed)
    }

    /// Toggles forced CRC-32 verification at runtime.
    pub fn set_must_crc32(&self, enabled: bool) {
        self.must_crc32.store(enabled, Ordering::Relaxed);
    }

    /// Whether newly opened archives skip the descriptor cache.
    pub fn fd_cache_bypass(&self) -> bool {
        self.fd_cache_bypass.load(Ordering::Relaxed)
    }

    /// Toggles descriptor-cache bypass at runtime.
    pub fn set_fd_cache_bypass(&self, enabled: bool) {
        self.fd_cache_bypass.store(enabled, Ordering::Relaxed);
    }

    /// Parses a comma-separated `key` / `key=value` option list.
    ///
    /// Input: `"fd-limit=32,flatten-zips,fd-cache-ttl=30"`
    pub fn parse(list: &str) -> Result<Options> {
        let mut options = Options::default();
        for item in list.split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let (key, value) = match item.split_once('=') {
                Some((key, value)) => (key, Some(value)),
                None => (item, None),
            };
            match key {
                "fd-limit" => options.fd_limit = parse_number(key, value)?,
                "fd-cache-size" => options.fd_cache_size = parse_number(key, value)?,
                "fd-cache-ttl" => {
                    options.fd_cache_ttl = Duration::from_secs(parse_number(key, value)?)
                }
                "fd-cache-bypass" => options.set_fd_cache_bypass(parse_flag(key, value)?),
                "stream-pool-size" => options.stream_pool_size = parse_number(key, value)?,
                "stream-threshold" => options.set_stream_threshold(parse_number(key, value)?),
                "strict-cache" => options.strict_cache = parse_flag(key, value)?,
                "force-unicode" => options.force_unicode = parse_flag(key, value)?,
                "flatten-zips" => options.flatten_zips = parse_flag(key, value)?,
                "must-crc32" => options.set_must_crc32(parse_flag(key, value)?),
                _ => return Err(FsError::Invalid(format!("unknown option: {key}"))),
            }
        }
        options.validate()?;
        Ok(options)
    }

    /// Checks internal consistency. Called by the filesystem constructor.
    pub fn validate(&self) -> Result<()> {
        if self.fd_limit == 0 {
            return Err(FsError::Invalid("fd-limit must be positive".to_owned()));
        }
        if self.fd_cache_size >= self.fd_limit {
            return Err(FsError::Invalid(format!(
                "fd-cache-size ({}) must be less than fd-limit ({})",
                self.fd_cache_size, self.fd_limit
            )));
        }
        if self.stream_pool_size == 0 {
            return Err(FsError::Invalid(
                "stream-pool-size must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: Option<&str>) -> Result<T> {
    let value = value.ok_or_else(|| FsError::Invalid(format!("option {key} needs a value")))?;
    value
        .parse()
        .map_err(|_| FsError::Invalid(format!("option {key}: invalid number {value:?}")))
}

fn parse_flag(key: &str, value: Option<&str>) -> Result<bool> {
    match value {
        None | Some("true") | Some("1") => Ok(true),
        Some("false") | Some("0") => Ok(false),
        Some(other) => Err(FsError::Invalid(format!(
            "option {key}: invalid flag {other:?}"
        ))),
    }
}
