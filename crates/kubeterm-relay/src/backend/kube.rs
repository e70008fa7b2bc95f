//! Cluster API backend.
//!
//! Exec and attach run over a websocket speaking the `v4.channel.k8s.io`
//! subprotocol; log follow is a plain HTTP GET whose body is streamed.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt, future};
use reqwest::Url;
use rustls::pki_types::CertificateDer;
use rustls::pki_types::pem::PemObject;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{Connector, connect_async_tls_with_config};
use tracing::{debug, info};

use kubeterm_core::ClusterConfig;

use super::{Backend, OpenRequest};
use crate::channel::Channel;
use crate::session::ConnectionMode;
use crate::session::Target;
use crate::transport::{ChannelDemuxer, Transport, TransportError};

/// Websocket subprotocol for channel-multiplexed exec/attach.
pub const CHANNEL_PROTOCOL: &str = "v4.channel.k8s.io";

const SEC_WEBSOCKET_PROTOCOL: &str = "Sec-WebSocket-Protocol";

/// Opens exec, attach and log streams against a cluster API server.
pub struct KubeBackend {
    base_url: Url,
    token: Option<String>,
    token_path: Option<std::path::PathBuf>,
    http: reqwest::Client,
    tls: Option<Arc<rustls::ClientConfig>>,
    channel_capacity: usize,
}

impl std::fmt::Debug for KubeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeBackend")
            .field("base_url", &self.base_url.as_str())
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("token_path", &self.token_path)
            .finish_non_exhaustive()
    }
}

impl KubeBackend {
    pub fn new(config: &ClusterConfig, channel_capacity: usize) -> Result<Self, TransportError> {
        let base_url = Url::parse(config.api_server.trim_end_matches('/'))
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {e}", config.api_server)))?;
        if base_url.cannot_be_a_base() {
            return Err(TransportError::InvalidUrl(config.api_server.clone()));
        }

        // reqwest uses rustls-no-provider; Err only means it is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut http = reqwest::Client::builder();
        let tls = match &config.ca_cert_path {
            Some(path) => {
                let pem = std::fs::read(path).map_err(|e| {
                    TransportError::Tls(format!("Failed to read CA bundle {}: {e}", path.display()))
                })?;
                for cert in reqwest::Certificate::from_pem_bundle(&pem)
                    .map_err(|e| TransportError::Tls(e.to_string()))?
                {
                    http = http.add_root_certificate(cert);
                }
                Some(Arc::new(websocket_tls(path)?))
            }
            None => None,
        };
        let http = http
            .build()
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        Ok(Self {
            base_url,
            token: config.token.clone().filter(|t| !t.is_empty()),
            token_path: config.token_path.clone(),
            http,
            tls,
            channel_capacity,
        })
    }

    /// `.../exec?command=..&stdin=true&stdout=true&stderr=true&tty=true`
    pub fn exec_url(&self, target: &Target, command: &[String]) -> Result<Url, TransportError> {
        let mut url = self.pod_url(target, "exec")?;
        {
            let mut query = url.query_pairs_mut();
            for arg in command {
                query.append_pair("command", arg);
            }
            query
                .append_pair("stdin", "true")
                .append_pair("stdout", "true")
                .append_pair("stderr", "true")
                .append_pair("tty", "true");
            if let Some(container) = &target.container {
                query.append_pair("container", container);
            }
        }
        Ok(url)
    }

    /// `.../attach?stdin=false&stdout=<b>&stderr=<b>&tty=false`
    pub fn attach_url(
        &self,
        target: &Target,
        stdout: bool,
        stderr: bool,
    ) -> Result<Url, TransportError> {
        let mut url = self.pod_url(target, "attach")?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("stdin", "false")
                .append_pair("stdout", bool_str(stdout))
                .append_pair("stderr", bool_str(stderr))
                .append_pair("tty", "false");
            if let Some(container) = &target.container {
                query.append_pair("container", container);
            }
        }
        Ok(url)
    }

    /// `.../log?follow=true`
    pub fn log_url(&self, target: &Target) -> Result<Url, TransportError> {
        let mut url = self.pod_url(target, "log")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("follow", "true");
            if let Some(container) = &target.container {
                query.append_pair("container", container);
            }
        }
        Ok(url)
    }

    /// Rewrite `http`/`https` to `ws`/`wss`.
    pub fn websocket_url(url: &Url) -> Result<Url, TransportError> {
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(TransportError::InvalidUrl(format!(
                    "Unsupported scheme: {other}"
                )));
            }
        };
        let mut ws = url.clone();
        ws.set_scheme(scheme)
            .map_err(|()| TransportError::InvalidUrl(url.to_string()))?;
        Ok(ws)
    }

    fn pod_url(&self, target: &Target, subresource: &str) -> Result<Url, TransportError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| TransportError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend([
                "api",
                "v1",
                "namespaces",
                target.namespace.as_str(),
                "pods",
                target.pod.as_str(),
                subresource,
            ]);
        Ok(url)
    }

    async fn bearer_token(&self) -> Result<Option<String>, TransportError> {
        if let Some(token) = &self.token {
            return Ok(Some(token.clone()));
        }
        let Some(path) = &self.token_path else {
            return Ok(None);
        };
        let token = tokio::fs::read_to_string(path).await.map_err(|e| {
            TransportError::Connect(format!("Failed to read token file {}: {e}", path.display()))
        })?;
        let token = token.trim();
        Ok((!token.is_empty()).then(|| token.to_string()))
    }

    async fn open_channels(&self, url: Url, mode: ConnectionMode) -> Result<Transport, TransportError> {
        let url = Self::websocket_url(&url)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        let headers = request.headers_mut();
        headers.insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(CHANNEL_PROTOCOL),
        );
        if let Some(token) = self.bearer_token().await? {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| TransportError::Connect("Invalid token format".into()))?;
            headers.insert("Authorization", value);
        }

        let connector = self.tls.as_ref().map(|tls| Connector::Rustls(Arc::clone(tls)));
        let (socket, response) = connect_async_tls_with_config(request, None, false, connector)
            .await
            .map_err(handshake_error)?;
        debug!(status = %response.status(), url = %url, "Websocket established");

        let (sink, stream) = socket.split();
        let stream = stream.filter_map(|message| future::ready(inbound_frame(message)));
        let sink = sink
            .with(|frame: Vec<u8>| future::ready(Ok::<_, tungstenite::Error>(Message::binary(frame))))
            .sink_map_err(|e| TransportError::Io(e.to_string()));

        Ok(ChannelDemuxer::start(
            stream,
            sink,
            mode.inbound_channels(),
            self.channel_capacity,
        ))
    }

    async fn open_log(&self, url: Url) -> Result<Transport, TransportError> {
        let mut request = self.http.get(url);
        if let Some(token) = self.bearer_token().await? {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = if body.is_empty() {
                status.canonical_reason().unwrap_or("Unknown").to_string()
            } else {
                body
            };
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|e| TransportError::Io(e.to_string()))
        });
        Ok(Transport::from_stream(
            Channel::Stdout,
            body,
            self.channel_capacity,
        ))
    }
}

#[async_trait]
impl Backend for KubeBackend {
    async fn open(&self, request: &OpenRequest) -> Result<Transport, TransportError> {
        let target = &request.target;
        let transport = match request.mode {
            ConnectionMode::Interactive => {
                let url = self.exec_url(target, &request.command)?;
                self.open_channels(url, request.mode).await?
            }
            ConnectionMode::StdoutOnly => {
                let url = self.attach_url(target, true, false)?;
                self.open_channels(url, request.mode).await?
            }
            ConnectionMode::StderrOnly => {
                let url = self.attach_url(target, false, true)?;
                self.open_channels(url, request.mode).await?
            }
            ConnectionMode::CombinedLogs => {
                let url = self.attach_url(target, true, true)?;
                self.open_channels(url, request.mode).await?
            }
            ConnectionMode::FollowLogs => self.open_log(self.log_url(target)?).await?,
        };
        info!(workload = %target, mode = %request.mode, "Remote stream opened");
        Ok(transport)
    }
}

const fn bool_str(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

fn websocket_tls(ca_path: &Path) -> Result<rustls::ClientConfig, TransportError> {
    let mut roots = rustls::RootCertStore::empty();
    let certs = CertificateDer::pem_file_iter(ca_path)
        .map_err(|e| TransportError::Tls(format!("{}: {e}", ca_path.display())))?;
    for cert in certs {
        let cert = cert.map_err(|e| TransportError::Tls(e.to_string()))?;
        roots
            .add(cert)
            .map_err(|e| TransportError::Tls(e.to_string()))?;
    }
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(config)
}

fn inbound_frame(
    message: Result<Message, tungstenite::Error>,
) -> Option<Result<Vec<u8>, TransportError>> {
    match message {
        Ok(Message::Binary(data)) => Some(Ok(data.to_vec())),
        Ok(Message::Close(frame)) => {
            debug!(?frame, "Remote sent close");
            None
        }
        Ok(_) => None,
        Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => None,
        Err(e) => Some(Err(TransportError::Io(e.to_string()))),
    }
}

fn handshake_error(error: tungstenite::Error) -> TransportError {
    match error {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            let message = response
                .body()
                .as_ref()
                .map(|body| String::from_utf8_lossy(body).into_owned())
                .filter(|body| !body.is_empty())
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("Unknown").to_string());
            TransportError::Rejected {
                status: status.as_u16(),
                message,
            }
        }
        other => TransportError::Connect(other.to_string()),
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn backend(api_server: &str) -> KubeBackend {
        let config = ClusterConfig {
            api_server: api_server.into(),
            ..ClusterConfig::default()
        };
        KubeBackend::new(&config, 16).unwrap()
    }

    fn bash() -> Vec<String> {
        vec!["/bin/bash".to_string()]
    }

    #[test]
    fn invalid_api_server_is_rejected() {
        let config = ClusterConfig {
            api_server: "not a url".into(),
            ..ClusterConfig::default()
        };
        let err = KubeBackend::new(&config, 16).unwrap_err();
        assert!(matches!(err, TransportError::InvalidUrl(_)));
    }

    #[test]
    fn exec_url_carries_command_and_tty_flags() {
        let backend = backend("https://cluster:6443");
        let url = backend
            .exec_url(&Target::new("default", "p1"), &bash())
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://cluster:6443/api/v1/namespaces/default/pods/p1/exec\
             ?command=%2Fbin%2Fbash&stdin=true&stdout=true&stderr=true&tty=true"
        );
    }

    #[test]
    fn exec_url_repeats_command_per_argument() {
        let backend = backend("https://cluster:6443");
        let argv = Target::parse_command("sh -c date").unwrap();
        let url = backend
            .exec_url(&Target::new("ns", "p").with_container("app"), &argv)
            .unwrap();
        let commands: Vec<String> = url
            .query_pairs()
            .filter(|(k, _)| k == "command")
            .map(|(_, v)| v.into_owned())
            .collect();
        assert_eq!(commands, argv);
        assert_eq!(
            url.query_pairs().find(|(k, _)| k == "container").unwrap().1,
            "app"
        );
    }

    #[test]
    fn attach_url_selects_streams() {
        let backend = backend("https://cluster:6443");
        let url = backend
            .attach_url(&Target::new("default", "p1"), false, true)
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://cluster:6443/api/v1/namespaces/default/pods/p1/attach\
             ?stdin=false&stdout=false&stderr=true&tty=false"
        );
    }

    #[test]
    fn log_url_follows() {
        let backend = backend("https://cluster:6443/");
        let url = backend
            .log_url(&Target::new("kube-system", "dns-0").with_container("coredns"))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://cluster:6443/api/v1/namespaces/kube-system/pods/dns-0/log\
             ?follow=true&container=coredns"
        );
    }

    #[test]
    fn api_server_path_prefix_is_kept() {
        let backend = backend("https://proxy.local/k8s/clusters/c1");
        let url = backend.log_url(&Target::new("default", "p1")).unwrap();
        assert!(
            url.path()
                .starts_with("/k8s/clusters/c1/api/v1/namespaces/default/pods/p1/log")
        );
    }

    #[test]
    fn websocket_scheme_is_rewritten() {
        let https = Url::parse("https://cluster:6443/api/v1/x?a=b").unwrap();
        assert_eq!(
            KubeBackend::websocket_url(&https).unwrap().as_str(),
            "wss://cluster:6443/api/v1/x?a=b"
        );
        let http = Url::parse("http://127.0.0.1:8001/api").unwrap();
        assert_eq!(
            KubeBackend::websocket_url(&http).unwrap().scheme(),
            "ws"
        );
    }

    #[test]
    fn unsupported_scheme_is_invalid() {
        let ftp = Url::parse("ftp://cluster/api").unwrap();
        assert!(matches!(
            KubeBackend::websocket_url(&ftp),
            Err(TransportError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn token_file_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "sa-token\n").unwrap();
        let config = ClusterConfig {
            token_path: Some(path),
            ..ClusterConfig::default()
        };
        let backend = KubeBackend::new(&config, 16).unwrap();
        assert_eq!(backend.bearer_token().await.unwrap().as_deref(), Some("sa-token"));
    }

    #[tokio::test]
    async fn inline_token_wins_over_file() {
        let config = ClusterConfig {
            token: Some("inline".into()),
            token_path: Some("/nonexistent/token".into()),
            ..ClusterConfig::default()
        };
        let backend = KubeBackend::new(&config, 16).unwrap();
        assert_eq!(backend.bearer_token().await.unwrap().as_deref(), Some("inline"));
    }

    #[test]
    fn handshake_rejection_keeps_status() {
        let response = tungstenite::http::Response::builder()
            .status(403)
            .body(Some(b"forbidden".to_vec()))
            .unwrap();
        let err = handshake_error(tungstenite::Error::Http(response.into()));
        assert_eq!(
            err,
            TransportError::Rejected {
                status: 403,
                message: "forbidden".into()
            }
        );
    }
}
