use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::schema::ArchiveUnit;

pub const ARCHIVE_API: &str = "https://lists.apache.org/api/mbox.lua";

/// Source of raw mbox bytes for one archive unit.
///
/// `Ok(None)` means the unit is not published yet or holds no mail; that is
/// not an error.
pub trait ArchiveFetcher: Send + Sync {
    fn fetch(&self, unit: &ArchiveUnit) -> Result<Option<Vec<u8>>, FetchError>;
}

pub trait RosterFetcher {
    fn fetch_roster(&self, url: &str) -> Result<String, FetchError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 500,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        Duration::from_millis(self.base_backoff_ms.saturating_mul(attempt as u64))
    }

    pub fn run<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<T, FetchError>,
    ) -> Result<T, FetchError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(what, attempt, error = %err, delay_ms = delay.as_millis() as u64, "retrying fetch");
                    thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn http_client(timeout_secs: u64) -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(concat!("proposal-tracker/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to create HTTP client")
}

fn classify(err: reqwest::Error, timeout_secs: u64) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout(timeout_secs)
    } else {
        FetchError::Transient(err.to_string())
    }
}

pub struct HttpArchiveFetcher {
    client: reqwest::blocking::Client,
    base_url: String,
    timeout_secs: u64,
    retry: RetryPolicy,
}

impl HttpArchiveFetcher {
    pub fn new(timeout_secs: u64, retry: RetryPolicy) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout_secs)?,
            base_url: ARCHIVE_API.to_string(),
            timeout_secs,
            retry,
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn unit_url(&self, unit: &ArchiveUnit) -> String {
        format!(
            "{}?list={}&domain={}&d={}-{}",
            self.base_url, unit.list, unit.domain, unit.year, unit.month
        )
    }

    fn fetch_once(&self, url: &str) -> Result<Option<Vec<u8>>, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .map_err(|err| classify(err, self.timeout_secs))?;
        let status = resp.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let bytes = resp.bytes().map_err(|err| classify(err, self.timeout_secs))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Ok(Some(bytes.to_vec()))
    }
}

impl ArchiveFetcher for HttpArchiveFetcher {
    fn fetch(&self, unit: &ArchiveUnit) -> Result<Option<Vec<u8>>, FetchError> {
        let url = self.unit_url(unit);
        debug!(unit = %unit, url, "fetching archive unit");
        self.retry.run(&url, || self.fetch_once(&url))
    }
}

pub struct CachingFetcher<F> {
    inner: F,
    dir: PathBuf,
}

impl<F: ArchiveFetcher> CachingFetcher<F> {
    pub fn new(inner: F, dir: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            dir: dir.into(),
        }
    }
}

impl<F: ArchiveFetcher> ArchiveFetcher for CachingFetcher<F> {
    fn fetch(&self, unit: &ArchiveUnit) -> Result<Option<Vec<u8>>, FetchError> {
        let fetched = self.inner.fetch(unit)?;
        if let Some(bytes) = &fetched {
            let path = self.dir.join(unit.file_name());
            if let Err(err) = fs::create_dir_all(&self.dir).and_then(|()| fs::write(&path, bytes)) {
                warn!(unit = %unit, path = %path.display(), error = %err, "could not cache archive unit");
            }
        }
        Ok(fetched)
    }
}

pub struct DirArchiveFetcher {
    dir: PathBuf,
}

impl DirArchiveFetcher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cached_units(&self, list: &str, domain: &str) -> Result<Vec<ArchiveUnit>, FetchError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let prefix = format!("{}_{}-", list, domain.replace('.', "_"));
        let mut units = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let Some(period) = name
                .to_str()
                .and_then(|name| name.strip_prefix(prefix.as_str()))
                .and_then(|rest| rest.strip_suffix(".mbox"))
            else {
                continue;
            };
            let Some((year, month)) = period.split_once('-') else {
                continue;
            };
            if let (Ok(year), Ok(month)) = (year.parse::<i32>(), month.parse::<u8>()) {
                if (1..=12).contains(&month) {
                    units.push(ArchiveUnit::new(list, domain, year, month));
                }
            }
        }
        units.sort_by_key(|unit| (unit.year, unit.month));
        Ok(units)
    }
}

impl ArchiveFetcher for DirArchiveFetcher {
    fn fetch(&self, unit: &ArchiveUnit) -> Result<Option<Vec<u8>>, FetchError> {
        match fs::read(self.dir.join(unit.file_name())) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

pub struct HttpRosterFetcher {
    client: reqwest::blocking::Client,
    timeout_secs: u64,
    retry: RetryPolicy,
}

impl HttpRosterFetcher {
    pub fn new(timeout_secs: u64, retry: RetryPolicy) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout_secs)?,
            timeout_secs,
            retry,
        })
    }
}

impl RosterFetcher for HttpRosterFetcher {
    fn fetch_roster(&self, url: &str) -> Result<String, FetchError> {
        self.retry.run(url, || {
            let resp = self
                .client
                .get(url)
                .send()
                .map_err(|err| classify(err, self.timeout_secs))?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::Status {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }
            resp.text().map_err(|err| classify(err, self.timeout_secs))
        })
    }
}
