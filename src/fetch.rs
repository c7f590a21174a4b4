//! ETag-cached downloads of paks and other files.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;

use base64::{Engine as _, engine::general_purpose};
use fs_err as fs;
use tracing::{debug, error, info};

use crate::{PakError, Result};

/// Where downloads for one kind of content are cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLayout {
    dir: PathBuf,
    extension: &'static str,
    allow_empty: bool,
}
impl CacheLayout {
    /// `<saved>/DownloadedPaks/`; empty bodies are rejected.
    pub fn paks<P: AsRef<Path>>(saved_dir: P) -> Self {
        Self {
            dir: saved_dir.as_ref().join("DownloadedPaks"),
            extension: ".pak",
            allow_empty: false,
        }
    }
    /// `<saved>/DownloadedFiles/`; empty bodies are cached like any other.
    pub fn files<P: AsRef<Path>>(saved_dir: P) -> Self {
        Self {
            dir: saved_dir.as_ref().join("DownloadedFiles"),
            extension: ".pak",
            allow_empty: true,
        }
    }
    pub fn dir(&self) -> &Path {
        &self.dir
    }
    pub fn cache_paths(&self, url: &str) -> CachePaths {
        let stem = general_purpose::URL_SAFE_NO_PAD.encode(url);
        CachePaths {
            content: self.dir.join(format!("{stem}{}", self.extension)),
            etag: self.dir.join(format!("{stem}.etag")),
        }
    }

    /// The ETag to revalidate with, if both the content and its ETag are
    /// cached.
    fn cached_etag(&self, url: &str) -> Result<Option<String>> {
        fs::create_dir_all(&self.dir)?;
        let paths = self.cache_paths(url);
        if !paths.content.is_file() {
            return Ok(None);
        }
        let etag = fs::read_to_string(&paths.etag).ok().filter(|etag| !etag.is_empty());
        if let Some(etag) = &etag {
            info!(target: "pakloader", "Setting If-None-Match: {etag}");
        }
        Ok(etag)
    }

    fn store(&self, paths: &CachePaths, response: &HttpResponse) -> Result<()> {
        let expected = response.content_length.unwrap_or(response.body.len() as u64);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&response.body)?;
        tmp.flush()?;
        let written = tmp.as_file().metadata()?.len();
        if written != expected {
            return Err(PakError::SizeMismatch {
                path: tmp.path().to_path_buf(),
                written,
                expected,
            });
        }
        tmp.persist(&paths.content).map_err(|err| PakError::Io(err.error))?;
        match response.etag.as_deref().filter(|etag| !etag.is_empty()) {
            Some(etag) => fs::write(&paths.etag, etag)?,
            None => {
                info!(target: "pakloader", "No ETag header for {}", paths.content.display());
                if paths.etag.exists() {
                    fs::remove_file(&paths.etag)?;
                }
            }
        }
        Ok(())
    }

    /// Turns the outcome of a request into events, updating the cache on a
    /// successful download.
    fn finish(&self, url: &str, check_only: bool, response: Result<HttpResponse>) -> Vec<FetchEvent> {
        let response = match response {
            Ok(response) => response,
            Err(err) => {
                error!(target: "pakloader", "Error downloading {url}: {err}");
                return vec![FetchEvent::Failed("Couldn't download file".to_string())];
            }
        };

        let mut events = vec![];
        let not_modified = response.status == 304;
        let changed = response.status == 200;
        if changed {
            info!(target: "pakloader", "Content changed on server: {url}");
            events.push(FetchEvent::Updated(url.to_string()));
        }
        if check_only {
            return events;
        }

        let paths = self.cache_paths(url);
        let declared = response.content_length.unwrap_or(response.body.len() as u64);
        if not_modified {
            if paths.content.is_file() {
                info!(target: "pakloader", "Using cached file for {url}");
                events.push(FetchEvent::Succeeded(paths.content));
            } else {
                error!(target: "pakloader", "Server says {url} is unchanged but nothing is cached");
                events.push(FetchEvent::Failed("Couldn't download file".to_string()));
            }
        } else if response.status == 200 && (self.allow_empty || declared > 0) {
            info!(target: "pakloader", "Attempting to cache {url} as {}", paths.content.display());
            match self.store(&paths, &response) {
                Ok(()) => events.push(FetchEvent::Succeeded(paths.content)),
                Err(err) => {
                    error!(target: "pakloader", "Couldn't save {url} as {}: {err}", paths.content.display());
                    events.push(FetchEvent::Failed("Couldn't save downloaded file".to_string()));
                }
            }
        } else {
            error!(target: "pakloader", "Error downloading {url}: {}", response.status);
            events.push(FetchEvent::Failed("Couldn't download file".to_string()));
        }
        events
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePaths {
    pub content: PathBuf,
    pub etag: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub etag: Option<String>,
    /// Declared by the server; the body length is used when absent.
    pub content_length: Option<u64>,
    pub body: Vec<u8>,
}

/// Issues a GET, optionally conditional on an ETag.
pub trait HttpClient: Send + Sync {
    fn get(&self, url: &str, if_none_match: Option<&str>) -> Result<HttpResponse>;
}

pub struct ReqwestClient {
    client: reqwest::blocking::Client,
}
impl ReqwestClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| PakError::Http(err.to_string()))?;
        Ok(Self { client })
    }
}
impl HttpClient for ReqwestClient {
    fn get(&self, url: &str, if_none_match: Option<&str>) -> Result<HttpResponse> {
        let mut request = self.client.get(url);
        if let Some(etag) = if_none_match {
            request = request.header(reqwest::header::IF_NONE_MATCH, etag);
        }
        let response = request.send().map_err(|err| PakError::Http(err.to_string()))?;
        let status = response.status().as_u16();
        let etag = response.headers().get(reqwest::header::ETAG).and_then(|value| value.to_str().ok()).map(str::to_string);
        let content_length = response.content_length();
        let body = response.bytes().map_err(|err| PakError::Http(err.to_string()))?.to_vec();
        debug!(target: "pakloader", "GET {url}: {status}, {} bytes", body.len());
        Ok(HttpResponse {
            status,
            etag,
            content_length,
            body,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchEvent {
    /// The server has different content than the cache.
    Updated(String),
    /// Path of the up to date cached file.
    Succeeded(PathBuf),
    Failed(String),
}

pub struct ConditionalFetcher {
    client: Arc<dyn HttpClient>,
    layout: CacheLayout,
}
impl ConditionalFetcher {
    pub fn new(client: Arc<dyn HttpClient>, layout: CacheLayout) -> Self {
        Self { client, layout }
    }
    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    /// Fetches `url` on the calling thread. With `check_only` the cache is
    /// left alone and a response only ever yields `Updated`.
    pub fn fetch(&self, url: &str, check_only: bool) -> Vec<FetchEvent> {
        info!(target: "pakloader", "Download request for: {url}");
        let response = self.layout.cached_etag(url).and_then(|etag| self.client.get(url, etag.as_deref()));
        self.layout.finish(url, check_only, response)
    }

    /// Issues the request on a worker thread. The cache is only touched from
    /// [`FetchHandle::poll`]/[`FetchHandle::wait`], so dropping the handle
    /// abandons the download.
    pub fn start(&self, url: &str, check_only: bool) -> FetchHandle {
        info!(target: "pakloader", "Download request for: {url}");
        let (tx, rx) = mpsc::channel();
        let etag = self.layout.cached_etag(url);
        let client = self.client.clone();
        let request_url = url.to_string();
        thread::spawn(move || {
            let response = etag.and_then(|etag| client.get(&request_url, etag.as_deref()));
            tx.send(response).ok();
        });
        FetchHandle {
            url: url.to_string(),
            layout: self.layout.clone(),
            check_only,
            receiver: rx,
            finished: false,
        }
    }
}

pub struct FetchHandle {
    url: String,
    layout: CacheLayout,
    check_only: bool,
    receiver: Receiver<Result<HttpResponse>>,
    finished: bool,
}
impl FetchHandle {
    pub fn url(&self) -> &str {
        &self.url
    }
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Events of the request once its response has arrived; `None` while it's
    /// still in flight and after the events have been handed out.
    pub fn poll(&mut self) -> Option<Vec<FetchEvent>> {
        if self.finished {
            return None;
        }
        let response = match self.receiver.try_recv() {
            Ok(response) => response,
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Disconnected) => Err(PakError::Http("request worker went away".to_string())),
        };
        self.finished = true;
        Some(self.layout.finish(&self.url, self.check_only, response))
    }

    /// Blocks until the response arrives.
    pub fn wait(mut self) -> Vec<FetchEvent> {
        if self.finished {
            return vec![];
        }
        let response = self.receiver.recv().unwrap_or_else(|_| Err(PakError::Http("request worker went away".to_string())));
        self.finished = true;
        self.layout.finish(&self.url, self.check_only, response)
    }
}
