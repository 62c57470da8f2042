//! TLS middle stack and certificate loading.
//!
//! The stack attaches to the consumer end of a TCP stub, runs the handshake
//! over that pipe's byte stream and re-exposes cleartext on its own upper
//! pipe.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::channel::{LayerInfoPart, PipeEnd, TlsInfo};
use crate::config::PipeConfig;
use crate::error::{NetError, Result};
use crate::layer::{LayerCore, LayerKind};
use crate::net::relay::spawn_relay;
use crate::resilience::run_with_deadline;

/// Middle layer terminating TLS.
pub struct TlsStack {
    core: LayerCore,
    info: TlsInfo,
}

impl TlsStack {
    /// Server-side handshake over `lower`.
    ///
    /// On failure the stack is disposed, which also tears down the layers
    /// below it.
    pub async fn accept(
        lower: &PipeEnd,
        config: Arc<ServerConfig>,
        timeout: Option<Duration>,
        pipe: &PipeConfig,
    ) -> Result<Self> {
        let core = LayerCore::middle(LayerKind::TlsStack, lower, false, pipe)?;
        let transport = lower_stream(&core)?;

        let acceptor = TlsAcceptor::from(config);
        let tls = run_with_deadline("tls handshake", timeout, core.shutdown(), async move {
            acceptor
                .accept(transport)
                .await
                .map_err(|e| NetError::Tls(e.to_string()))
        })
        .await?;

        let (_, session) = tls.get_ref();
        let info = TlsInfo {
            owner: core.id(),
            is_server: true,
            server_name: session.server_name().map(str::to_string),
            alpn_protocol: session.alpn_protocol().map(<[u8]>::to_vec),
            protocol_version: session.protocol_version().map(|v| format!("{v:?}")),
        };
        Self::finish(core, info, tls)
    }

    /// Client-side handshake over `lower`, verifying `server_name`.
    pub async fn connect(
        lower: &PipeEnd,
        config: Arc<ClientConfig>,
        server_name: &str,
        timeout: Option<Duration>,
        pipe: &PipeConfig,
    ) -> Result<Self> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| NetError::Tls(format!("invalid server name '{server_name}': {e}")))?;
        let core = LayerCore::middle(LayerKind::TlsStack, lower, false, pipe)?;
        let transport = lower_stream(&core)?;

        let connector = TlsConnector::from(config);
        let tls = run_with_deadline("tls handshake", timeout, core.shutdown(), async move {
            connector
                .connect(name, transport)
                .await
                .map_err(|e| NetError::Tls(e.to_string()))
        })
        .await?;

        let (_, session) = tls.get_ref();
        let info = TlsInfo {
            owner: core.id(),
            is_server: false,
            server_name: Some(server_name.to_string()),
            alpn_protocol: session.alpn_protocol().map(<[u8]>::to_vec),
            protocol_version: session.protocol_version().map(|v| format!("{v:?}")),
        };
        Self::finish(core, info, tls)
    }

    fn finish<S>(core: LayerCore, info: TlsInfo, tls: S) -> Result<Self>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let upper = core.upper();
        upper.set_layer_info(LayerInfoPart::Tls(info.clone()), true);
        let cleartext = upper.take_stream()?;
        spawn_relay(
            "tls relay",
            core.id(),
            tls,
            cleartext,
            core.shutdown().clone(),
            upper.end().clone(),
        );
        tracing::debug!(
            layer = %core.id(),
            server = info.is_server,
            version = info.protocol_version.as_deref().unwrap_or("unknown"),
            "TLS handshake complete"
        );
        Ok(Self { core, info })
    }

    pub fn core(&self) -> &LayerCore {
        &self.core
    }

    pub fn info(&self) -> &TlsInfo {
        &self.info
    }
}

impl std::fmt::Debug for TlsStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsStack")
            .field("layer", &self.core.id())
            .field("info", &self.info)
            .finish()
    }
}

fn lower_stream(core: &LayerCore) -> Result<tokio::io::DuplexStream> {
    core.lower()
        .ok_or(NetError::InvalidState("TLS stack has no lower layer"))?
        .take_stream()
}

/// Load a PEM certificate chain and private key into a server config.
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let certs = read_pem(cert_path, |reader| {
        rustls_pemfile::certs(reader).collect::<std::io::Result<Vec<_>>>()
    })?;
    let key = read_pem(key_path, |reader| rustls_pemfile::private_key(reader))?.ok_or_else(|| {
        NetError::Tls(format!("no private key found in {}", key_path.display()))
    })?;
    server_config(certs, key)
}

/// Parse in-memory PEM data into a server config.
pub fn server_config_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Arc<ServerConfig>> {
    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| NetError::Tls(format!("invalid certificate PEM: {e}")))?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| NetError::Tls(format!("invalid key PEM: {e}")))?
        .ok_or_else(|| NetError::Tls("no private key in PEM data".to_string()))?;
    server_config(certs, key)
}

fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>> {
    if certs.is_empty() {
        return Err(NetError::Tls("certificate chain is empty".to_string()));
    }
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| NetError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| NetError::Tls(e.to_string()))?;
    Ok(Arc::new(config))
}

fn read_pem<T, F>(path: &Path, parse: F) -> Result<T>
where
    F: FnOnce(&mut BufReader<File>) -> std::io::Result<T>,
{
    let file = File::open(path)
        .map_err(|e| NetError::Tls(format!("cannot open {}: {e}", path.display())))?;
    parse(&mut BufReader::new(file))
        .map_err(|e| NetError::Tls(format!("cannot parse {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_are_tls_errors() {
        let result = load_server_config(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem"));
        assert!(matches!(result, Err(NetError::Tls(_))));
    }

    #[test]
    fn pem_without_key_is_rejected() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let result = server_config_from_pem(cert.cert.pem().as_bytes(), b"");
        assert!(matches!(result, Err(NetError::Tls(_))));

        let ok = server_config_from_pem(
            cert.cert.pem().as_bytes(),
            cert.key_pair.serialize_pem().as_bytes(),
        );
        assert!(ok.is_ok());
    }
}
