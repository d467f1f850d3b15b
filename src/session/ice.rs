//! ICE server configuration and the HTTP config-service loader

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::error::Result;

/// One STUN or TURN entry, in the JSON shape browsers use
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

impl From<&IceServer> for RTCIceServer {
    fn from(server: &IceServer) -> Self {
        RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Accepts both `"urls": "stun:..."` and `"urls": ["stun:..."]`.
#[derive(Deserialize)]
struct RemoteIceServer {
    urls: OneOrMany,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    credential: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl From<RemoteIceServer> for IceServer {
    fn from(remote: RemoteIceServer) -> Self {
        let urls = match remote.urls {
            OneOrMany::One(url) => vec![url],
            OneOrMany::Many(urls) => urls,
        };
        Self {
            urls,
            username: remote.username,
            credential: remote.credential,
        }
    }
}

/// Parse one ICE entry as served by the config service.
pub fn parse_ice_server(text: &str) -> Result<IceServer> {
    let remote: RemoteIceServer = serde_json::from_str(text)?;
    Ok(remote.into())
}

/// Fetch ICE entries: `GET {base}/config` lists file names,
/// `GET {base}/?file={name}` returns one JSON entry per file.
#[instrument]
pub async fn fetch_ice_servers(base_url: &str) -> Result<Vec<IceServer>> {
    let client = reqwest::Client::new();
    let base = base_url.trim_end_matches('/');

    let files: Vec<String> = client
        .get(format!("{}/config", base))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    debug!("ICE config files: {:?}", files);

    let mut servers = Vec::with_capacity(files.len());
    for file in &files {
        let text = client
            .get(format!("{}/", base))
            .query(&[("file", file)])
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        servers.push(parse_ice_server(&text)?);
    }

    info!("Loaded {} ICE servers from {}", servers.len(), base);
    Ok(servers)
}
