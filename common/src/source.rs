use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};

use eyre::{Context, Result, bail};
use regex::Regex;
use reqwest::Client;
use tokio::fs::{read_dir, read_to_string};
use tracing::debug;

static HREF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<a\s[^>]*?href\s*=\s*["']([^"']+)["']"#).expect("static regex")
});

/// A progress file advertised by a [`ResultSource`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEntry {
    /// Name as advertised by the listing, used to derive the run key
    pub name: String,
    /// Where to fetch it from
    pub location: String,
}

#[async_trait::async_trait]
pub trait ResultSource: Send + Sync {
    fn describe(&self) -> String;
    /// Lists the entries whose names end with `suffix`
    async fn list(&self, suffix: &str) -> Result<Vec<ProgressEntry>>;
    async fn fetch(&self, entry: &ProgressEntry) -> Result<String>;
}

/// `http://` and `https://` endpoints are served directory listings,
/// everything else is a local result directory.
pub fn source_for(endpoint: &str, timeout: Option<Duration>) -> Result<Box<dyn ResultSource>> {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        Ok(Box::new(HttpSource::new(endpoint, timeout)?))
    } else {
        Ok(Box::new(DirSource::new(endpoint)))
    }
}

/// Anchor targets in a directory listing page that end with `suffix`
pub fn extract_links(page: &str, suffix: &str) -> Vec<String> {
    HREF.captures_iter(page)
        .filter_map(|cap| cap.get(1))
        .map(|href| href.as_str().to_owned())
        .filter(|href| href.ends_with(suffix))
        .collect()
}

/// A host's result directory served over HTTP, as `python -m http.server` does
pub struct HttpSource {
    base: String,
    client: Client,
}

impl HttpSource {
    pub fn new(base: &str, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            base: base.trim_end_matches('/').to_owned(),
            client: builder.build().context("Build http client")?,
        })
    }

    async fn get(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            bail!("GET {url} returned {status}");
        }
        Ok(response.text().await?)
    }
}

#[async_trait::async_trait]
impl ResultSource for HttpSource {
    fn describe(&self) -> String {
        self.base.clone()
    }

    async fn list(&self, suffix: &str) -> Result<Vec<ProgressEntry>> {
        let page = self
            .get(&self.base)
            .await
            .context(format!("List {}", self.base))?;
        Ok(extract_links(&page, suffix)
            .into_iter()
            .map(|href| ProgressEntry {
                location: format!("{}/{href}", self.base),
                name: href,
            })
            .collect())
    }

    async fn fetch(&self, entry: &ProgressEntry) -> Result<String> {
        self.get(&entry.location).await
    }
}

/// A local copy of a result directory
pub struct DirSource {
    path: PathBuf,
}

impl DirSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

/// Name of a file the way the http file server links to it
fn advertised_name(file_name: &str) -> String {
    file_name.replace(',', "%2C")
}

#[async_trait::async_trait]
impl ResultSource for DirSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn list(&self, suffix: &str) -> Result<Vec<ProgressEntry>> {
        let mut entries = read_dir(&self.path)
            .await
            .context(format!("List {}", self.path.display()))?;
        let mut results = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Some(file_name) = entry.file_name().to_str().map(str::to_owned) else {
                debug!("Skipping non utf-8 file name {:?}", entry.file_name());
                continue;
            };
            if file_name.ends_with(suffix) {
                results.push(ProgressEntry {
                    name: advertised_name(&file_name),
                    location: entry.path().display().to_string(),
                });
            }
        }
        results.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(results)
    }

    async fn fetch(&self, entry: &ProgressEntry) -> Result<String> {
        read_to_string(&entry.location)
            .await
            .context(format!("Read {}", entry.location))
    }
}
