use std::sync::Arc;

use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use thiserror::Error;

use crate::config::NetworkConfig;
use crate::fs::remote::{RemoteClient, RemoteMetadata, UploadOutcome, WriteMode};
use crate::fs::{normalize_path, FileSystemAuthenticator, FileSystemError, Result, ServerCredentials};

#[derive(Error, Debug)]
pub enum WebDAVError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Authentication failed")]
    AuthFailed,
    #[error("No credentials configured")]
    MissingCredentials,
    #[error("Resource not found: {0}")]
    NotFound(String),
    #[error("Resource already exists: {0}")]
    AlreadyExists(String),
    #[error("Server error: {status} - {message}")]
    Server { status: u16, message: String },
    #[error("XML parse error: {0}")]
    XmlParse(String),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl From<WebDAVError> for FileSystemError {
    fn from(err: WebDAVError) -> Self {
        match err {
            WebDAVError::Http(e) => FileSystemError::NetworkIo(e.to_string()),
            WebDAVError::AuthFailed | WebDAVError::MissingCredentials => FileSystemError::Authentication(err.to_string()),
            WebDAVError::NotFound(path) => FileSystemError::NotFound(path),
            WebDAVError::AlreadyExists(path) => FileSystemError::AlreadyExists(path),
            WebDAVError::Server { status, .. } if status >= 500 => FileSystemError::NetworkIo(err.to_string()),
            WebDAVError::Server { .. } | WebDAVError::XmlParse(_) | WebDAVError::InvalidUrl(_) => {
                FileSystemError::InvalidData(err.to_string())
            }
        }
    }
}

/// Blocking WebDAV client. Credentials are read from the authenticator on
/// every request so a credentials update takes effect immediately.
pub struct WebDAVClient {
    client: Client,
    base_url: String,
    authenticator: Arc<dyn FileSystemAuthenticator>,
}

impl WebDAVClient {
    pub fn new(
        base_url: &str,
        authenticator: Arc<dyn FileSystemAuthenticator>,
        network: &NetworkConfig,
    ) -> std::result::Result<Self, WebDAVError> {
        // Normalize URL - ensure no trailing slash
        let base_url = base_url.trim_end_matches('/').to_string();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(WebDAVError::InvalidUrl("URL must start with http:// or https://".to_string()));
        }

        let client = Client::builder()
            .timeout(network.timeout())
            .connect_timeout(network.connect_timeout())
            .build()?;

        Ok(Self {
            client,
            base_url,
            authenticator,
        })
    }

    /// Build full URL for a normalized path
    fn url(&self, path: &str) -> String {
        let encoded: Vec<String> = normalize_path(path)
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| urlencoding::encode(s).into_owned())
            .collect();
        if encoded.is_empty() {
            format!("{}/", self.base_url)
        } else {
            format!("{}/{}", self.base_url, encoded.join("/"))
        }
    }

    fn request(&self, method: Method, path: &str) -> std::result::Result<RequestBuilder, WebDAVError> {
        let (username, password) = match self.authenticator.credentials() {
            Some(ServerCredentials::Basic(basic)) => (basic.username, basic.password),
            _ => return Err(WebDAVError::MissingCredentials),
        };
        let url = self.url(path);
        log::debug!("WebDAV {} {}", method, url);
        Ok(self.client.request(method, &url).basic_auth(username, Some(password)))
    }

    /// PROPFIND - `None` when nothing exists at `path`
    pub fn propfind(&self, path: &str, depth: u32) -> std::result::Result<Option<Vec<RemoteMetadata>>, WebDAVError> {
        let method = Method::from_bytes(b"PROPFIND").map_err(|e| WebDAVError::InvalidUrl(e.to_string()))?;
        let response = self
            .request(method, path)?
            .header("Depth", depth.to_string())
            .header("Content-Type", "application/xml")
            .body(PROPFIND_BODY)
            .send()?;

        match response.status() {
            StatusCode::NOT_FOUND => return Ok(None),
            status if status.is_success() => {}
            _ => return Err(error_from(response, path)),
        }

        let xml = response.text()?;
        parse_propfind_response(&xml, &self.base_url).map(Some)
    }

    /// PUT with a precondition; `None` when the precondition failed
    pub fn put(
        &self,
        path: &str,
        data: &[u8],
        mode: &WriteMode,
    ) -> std::result::Result<Option<Option<String>>, WebDAVError> {
        let mut request = self.request(Method::PUT, path)?.body(data.to_vec());
        match mode {
            WriteMode::Create => request = request.header("If-None-Match", "*"),
            WriteMode::Update(etag) => request = request.header("If-Match", if_match(etag)),
            WriteMode::Overwrite => {}
        }

        let response = request.send()?;
        match response.status() {
            StatusCode::CREATED | StatusCode::NO_CONTENT | StatusCode::OK => Ok(Some(etag(response.headers()))),
            StatusCode::PRECONDITION_FAILED => Ok(None),
            _ => Err(error_from(response, path)),
        }
    }
}

fn error_from(response: Response, path: &str) -> WebDAVError {
    match response.status() {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => WebDAVError::AuthFailed,
        StatusCode::NOT_FOUND => WebDAVError::NotFound(path.to_string()),
        status => WebDAVError::Server {
            status: status.as_u16(),
            message: response.text().unwrap_or_default(),
        },
    }
}

/// Entity tags are kept as sent, weak prefix and quotes included, so a
/// weak tag never passes a strong `If-Match`.
fn entity_tag(raw: &str) -> Option<String> {
    let tag = raw.trim();
    (!tag.is_empty()).then(|| tag.to_string())
}

fn etag(headers: &HeaderMap) -> Option<String> {
    headers.get("etag").and_then(|v| v.to_str().ok()).and_then(entity_tag)
}

/// Some servers send bare tags; `If-Match` needs the quoted form
fn if_match(etag: &str) -> String {
    if etag.starts_with('"') || etag.starts_with("W/\"") {
        etag.to_string()
    } else {
        format!("\"{}\"", etag)
    }
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

impl RemoteClient for WebDAVClient {
    fn prepare(&self) -> Result<String> {
        match self.propfind("/", 0)? {
            Some(_) => Ok("/".to_string()),
            None => Err(FileSystemError::NotFound(self.base_url.clone())),
        }
    }

    fn metadata(&self, path: &str) -> Result<Option<RemoteMetadata>> {
        Ok(self
            .propfind(path, 0)?
            .and_then(|entries| entries.into_iter().next()))
    }

    fn list(&self, path: &str) -> Result<Vec<RemoteMetadata>> {
        let entries = self
            .propfind(path, 1)?
            .ok_or_else(|| FileSystemError::NotFound(path.to_string()))?;
        let dir = normalize_path(path);
        // Skip the directory itself
        Ok(entries.into_iter().filter(|e| e.path != dir).collect())
    }

    fn download(&self, path: &str) -> Result<(Vec<u8>, RemoteMetadata)> {
        let response = self.request(Method::GET, path)?.send().map_err(WebDAVError::from)?;
        if !response.status().is_success() {
            return Err(error_from(response, path).into());
        }

        let headers = response.headers().clone();
        let data = response.bytes().map_err(WebDAVError::from)?.to_vec();
        let meta = RemoteMetadata {
            path: normalize_path(path),
            uid: normalize_path(path),
            is_directory: false,
            revision: etag(&headers),
            modified: headers
                .get("last-modified")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_http_date),
            size: Some(data.len() as u64),
        };
        Ok((data, meta))
    }

    fn upload(&self, path: &str, content: &[u8], mode: &WriteMode) -> Result<UploadOutcome> {
        let Some(etag) = self.put(path, content, mode)? else {
            log::info!("WebDAV precondition failed for {}", path);
            return Ok(UploadOutcome::RevisionMismatch);
        };

        // Not every server returns the new ETag on PUT
        let meta = match self.metadata(path)? {
            Some(mut meta) => {
                if meta.revision.is_none() {
                    meta.revision = etag;
                }
                meta
            }
            None => RemoteMetadata {
                path: normalize_path(path),
                uid: normalize_path(path),
                is_directory: false,
                revision: etag,
                modified: None,
                size: Some(content.len() as u64),
            },
        };
        Ok(UploadOutcome::Uploaded(meta))
    }

    fn create_directory(&self, path: &str) -> Result<RemoteMetadata> {
        let method = Method::from_bytes(b"MKCOL").map_err(|e| WebDAVError::InvalidUrl(e.to_string()))?;
        let response = self.request(method, path)?.send().map_err(WebDAVError::from)?;
        match response.status() {
            StatusCode::CREATED | StatusCode::OK => Ok(RemoteMetadata {
                path: normalize_path(path),
                uid: normalize_path(path),
                is_directory: true,
                revision: None,
                modified: None,
                size: None,
            }),
            StatusCode::METHOD_NOT_ALLOWED => Err(WebDAVError::AlreadyExists(path.to_string()).into()),
            _ => Err(error_from(response, path).into()),
        }
    }

    fn delete(&self, path: &str) -> Result<()> {
        let response = self.request(Method::DELETE, path)?.send().map_err(WebDAVError::from)?;
        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
            _ => Err(error_from(response, path).into()),
        }
    }
}

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8" ?>
<D:propfind xmlns:D="DAV:">
  <D:prop>
    <D:getlastmodified/>
    <D:getetag/>
    <D:getcontentlength/>
    <D:resourcetype/>
  </D:prop>
</D:propfind>"#;

#[derive(Default)]
struct Entry {
    href: Option<String>,
    etag: Option<String>,
    length: Option<u64>,
    modified: Option<DateTime<Utc>>,
    is_collection: bool,
}

/// Turn an href (absolute URL or absolute path) into a path relative to the
/// base URL
fn href_to_path(href: &str, base_url: &str) -> String {
    let base_path = base_url
        .find("://")
        .map(|i| &base_url[i + 3..])
        .and_then(|rest| rest.find('/').map(|i| &rest[i..]))
        .unwrap_or("")
        .trim_end_matches('/');

    let path = href.strip_prefix(base_url).unwrap_or_else(|| {
        let without_host = match href.find("://") {
            Some(i) => href[i + 3..].find('/').map(|j| &href[i + 3 + j..]).unwrap_or("/"),
            None => href,
        };
        without_host.strip_prefix(base_path).unwrap_or(without_host)
    });
    let decoded = urlencoding::decode(path).map(|p| p.into_owned()).unwrap_or_else(|_| path.to_string());
    normalize_path(&decoded)
}

/// Parse a multistatus PROPFIND response
pub fn parse_propfind_response(xml: &str, base_url: &str) -> std::result::Result<Vec<RemoteMetadata>, WebDAVError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut resources = Vec::new();
    let mut current: Option<Entry> = None;
    let mut element: Vec<u8> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.local_name().as_ref().to_vec();
                match name.as_slice() {
                    b"response" => current = Some(Entry::default()),
                    b"collection" => {
                        if let Some(entry) = current.as_mut() {
                            entry.is_collection = true;
                        }
                    }
                    _ => {}
                }
                element = name;
            }
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"collection" {
                    if let Some(entry) = current.as_mut() {
                        entry.is_collection = true;
                    }
                }
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().map_err(|e| WebDAVError::XmlParse(e.to_string()))?;
                if let Some(entry) = current.as_mut() {
                    match element.as_slice() {
                        b"href" => entry.href = Some(text.to_string()),
                        b"getetag" => entry.etag = entity_tag(&text),
                        b"getcontentlength" => entry.length = text.trim().parse().ok(),
                        b"getlastmodified" => entry.modified = parse_http_date(&text),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"response" {
                    if let Some(entry) = current.take() {
                        let Some(href) = entry.href else {
                            continue;
                        };
                        let path = href_to_path(&href, base_url);
                        resources.push(RemoteMetadata {
                            uid: path.clone(),
                            path,
                            is_directory: entry.is_collection,
                            revision: entry.etag,
                            modified: entry.modified,
                            size: entry.length,
                        });
                    }
                }
                element.clear();
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(WebDAVError::XmlParse(e.to_string())),
        }
    }

    log::debug!("PROPFIND returned {} entries", resources.len());
    Ok(resources)
}
