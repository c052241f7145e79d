//! IMAP connector using async-imap 0.11 with tokio-rustls. Supports
//! implicit TLS and STARTTLS, with LOGIN or XOAUTH2 authentication.

pub mod pool;

use std::sync::Arc;

use async_imap::{Authenticator, Client, Session};
use rustls_native_certs::load_native_certs;
use tokio::net::TcpStream;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::{Credential, ImapEndpoint};
use crate::errors::{SyncError, SyncResult};

pub type ImapStream = tokio_rustls::client::TlsStream<TcpStream>;
pub type ImapSession = Session<ImapStream>;

fn tls_connector() -> SyncResult<TlsConnector> {
    let mut root_store = RootCertStore::empty();
    let certs = load_native_certs()
        .map_err(|e| SyncError::Repo(format!("failed to load native certs: {e}")))?;
    for cert in certs {
        root_store
            .add(&tokio_rustls::rustls::Certificate(cert.0))
            .map_err(|e| SyncError::Repo(format!("failed to add cert to root store: {e}")))?;
    }
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Open an authenticated session against the endpoint.
pub async fn connect(endpoint: &ImapEndpoint, credential: &Credential) -> SyncResult<ImapSession> {
    let addr = (endpoint.host.as_str(), endpoint.port);
    debug!(host = %endpoint.host, port = endpoint.port, starttls = endpoint.starttls, "connecting");

    let connector = tls_connector()?;
    let server_name = ServerName::try_from(endpoint.host.as_str())
        .map_err(|e| SyncError::Repo(format!("invalid server name {}: {e}", endpoint.host)))?;

    let tcp = TcpStream::connect(addr)
        .await
        .map_err(|e| SyncError::Repo(format!("connecting to {}:{}: {e}", endpoint.host, endpoint.port)))?;

    let client = if endpoint.starttls {
        // Greeting and STARTTLS happen in the clear, then the socket
        // is handed to the TLS layer.
        let mut plain = Client::new(tcp);
        plain
            .read_response()
            .await
            .map_err(|e| SyncError::Repo(format!("reading greeting: {e}")))?
            .ok_or_else(|| SyncError::Repo("server closed before greeting".into()))?;
        plain
            .run_command_and_check_ok("STARTTLS", None)
            .await
            .map_err(|e| SyncError::Repo(format!("STARTTLS failed: {e}")))?;
        let tcp = plain.into_inner();
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| SyncError::Repo(format!("TLS handshake: {e}")))?;
        Client::new(tls)
    } else {
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| SyncError::Repo(format!("TLS handshake: {e}")))?;
        let mut client = Client::new(tls);
        client
            .read_response()
            .await
            .map_err(|e| SyncError::Repo(format!("reading greeting: {e}")))?
            .ok_or_else(|| SyncError::Repo("server closed before greeting".into()))?;
        client
    };

    let session = match credential {
        Credential::Password { password } => client
            .login(&endpoint.user, password)
            .await
            .map_err(|(e, _)| SyncError::Repo(format!("login failed for {}: {e}", endpoint.user)))?,
        Credential::OAuth2 { token } => {
            let auth = Xoauth2 {
                user: endpoint.user.clone(),
                access_token: token.clone(),
            };
            client
                .authenticate("XOAUTH2", auth)
                .await
                .map_err(|(e, _)| {
                    SyncError::Repo(format!("XOAUTH2 failed for {}: {e}", endpoint.user))
                })?
        }
    };

    debug!(host = %endpoint.host, user = %endpoint.user, "authenticated");
    Ok(session)
}

struct Xoauth2 {
    user: String,
    access_token: String,
}

impl Authenticator for Xoauth2 {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> String {
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user, self.access_token
        )
    }
}
