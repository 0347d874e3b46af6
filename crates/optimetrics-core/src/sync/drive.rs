//! Google Drive v3 implementation of [`RemoteStore`].

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::CloudConfig;
use crate::sync::auth::{self, CredentialProvider};
use crate::sync::error::RemoteError;
use crate::sync::remote::RemoteStore;

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const CSV_MIME: &str = "text/csv";
const BOUNDARY: &str = "optimetrics_upload_boundary";

#[derive(Debug, Deserialize)]
struct FileEntry {
    id: String,
    #[serde(default)]
    trashed: bool,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<FileEntry>,
}

/// Blocking Drive client.
pub struct DriveClient {
    http: Client,
    api_base: String,
    credentials: Box<dyn CredentialProvider>,
}

impl DriveClient {
    pub fn new(
        api_base: impl Into<String>,
        credentials: Box<dyn CredentialProvider>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    pub fn from_config(config: &CloudConfig) -> Result<Self, RemoteError> {
        Self::new(
            config.api_base.clone(),
            auth::from_config(config)?,
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    fn execute(&self, request: RequestBuilder, what: &str) -> Result<Response, RemoteError> {
        let token = self.credentials.token(&self.http)?;
        let response = request.bearer_auth(token).send()?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(RemoteError::NotFound(what.to_string()));
        }
        if status == StatusCode::UNAUTHORIZED {
            self.credentials.invalidate();
        }
        Err(RemoteError::Status {
            code: status.as_u16(),
            body: response.text().unwrap_or_default(),
        })
    }

    fn first_match(&self, query: &str) -> Result<Option<String>, RemoteError> {
        debug!(query, "drive search");
        let request = self.http.get(self.url("/drive/v3/files")).query(&[
            ("q", query),
            ("fields", "files(id,name)"),
            ("spaces", "drive"),
            ("supportsAllDrives", "true"),
            ("includeItemsFromAllDrives", "true"),
        ]);
        let list: FileList = self
            .execute(request, query)?
            .json()
            .map_err(|e| RemoteError::Decode(format!("file list: {}", e)))?;
        Ok(list.files.into_iter().next().map(|f| f.id))
    }

    fn created_id(response: Response) -> Result<String, RemoteError> {
        let entry: FileEntry = response
            .json()
            .map_err(|e| RemoteError::Decode(format!("created file: {}", e)))?;
        Ok(entry.id)
    }
}

/// Quotes a value for a Drive `q` expression.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn multipart_body(metadata: &serde_json::Value, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(content.len() + 512);
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n--{BOUNDARY}\r\nContent-Type: {CSV_MIME}\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

impl RemoteStore for DriveClient {
    fn authenticate(&self) -> Result<(), RemoteError> {
        self.credentials.token(&self.http).map(|_| ())
    }

    fn folder_exists(&self, folder_id: &str) -> Result<bool, RemoteError> {
        let request = self
            .http
            .get(self.url(&format!("/drive/v3/files/{}", folder_id)))
            .query(&[("fields", "id,trashed"), ("supportsAllDrives", "true")]);
        match self.execute(request, folder_id) {
            Ok(response) => {
                let entry: FileEntry = response
                    .json()
                    .map_err(|e| RemoteError::Decode(format!("folder metadata: {}", e)))?;
                Ok(!entry.trashed)
            }
            Err(RemoteError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn find_folder(&self, parent_id: &str, name: &str) -> Result<Option<String>, RemoteError> {
        self.first_match(&format!(
            "name={} and {} in parents and mimeType='{}' and trashed=false",
            quote(name),
            quote(parent_id),
            FOLDER_MIME
        ))
    }

    fn create_folder(&self, parent_id: &str, name: &str) -> Result<String, RemoteError> {
        let request = self
            .http
            .post(self.url("/drive/v3/files"))
            .query(&[("fields", "id"), ("supportsAllDrives", "true")])
            .json(&json!({
                "name": name,
                "mimeType": FOLDER_MIME,
                "parents": [parent_id],
            }));
        Self::created_id(self.execute(request, name)?)
    }

    fn find_file(&self, folder_id: &str, name: &str) -> Result<Option<String>, RemoteError> {
        self.first_match(&format!(
            "name={} and {} in parents and trashed=false",
            quote(name),
            quote(folder_id)
        ))
    }

    fn download(&self, file_id: &str) -> Result<Vec<u8>, RemoteError> {
        let request = self
            .http
            .get(self.url(&format!("/drive/v3/files/{}", file_id)))
            .query(&[("alt", "media"), ("supportsAllDrives", "true")]);
        Ok(self.execute(request, file_id)?.bytes()?.to_vec())
    }

    fn create_file(&self, folder_id: &str, name: &str, content: &[u8]) -> Result<String, RemoteError> {
        let metadata = json!({
            "name": name,
            "mimeType": CSV_MIME,
            "parents": [folder_id],
        });
        let request = self
            .http
            .post(self.url("/upload/drive/v3/files"))
            .query(&[
                ("uploadType", "multipart"),
                ("fields", "id"),
                ("supportsAllDrives", "true"),
            ])
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", BOUNDARY),
            )
            .body(multipart_body(&metadata, content));
        Self::created_id(self.execute(request, name)?)
    }

    fn update_file(&self, file_id: &str, content: &[u8]) -> Result<(), RemoteError> {
        let request = self
            .http
            .patch(self.url(&format!("/upload/drive/v3/files/{}", file_id)))
            .query(&[("uploadType", "media"), ("supportsAllDrives", "true")])
            .header(reqwest::header::CONTENT_TYPE, CSV_MIME)
            .body(content.to_vec());
        self.execute(request, file_id).map(|_| ())
    }
}
