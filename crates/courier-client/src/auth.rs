// CONNECT assembly: credentials, nonce signing and capability flags.
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use courier_transport::ServerAddr;
use courier_wire::{ConnectInfo, PROTOCOL_VERSION, ServerInfo};

use crate::config::Options;
use crate::error::{Error, Result};

pub const LANG: &str = "rust";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Answers the server's nonce challenge. Key material stays with the implementor.
pub trait Signer: Send + Sync {
    fn sign(&self, nonce: &[u8]) -> anyhow::Result<Vec<u8>>;

    /// User JWT presented alongside the signature.
    fn jwt(&self) -> Option<String> {
        None
    }

    /// Public key the server verifies the signature against.
    fn public_key(&self) -> Option<String> {
        None
    }
}

/// Builds the CONNECT body for `server`.
///
/// Explicit credentials on `options` win over user info embedded in the URL.
/// A configured signer only contributes when the server sent a nonce.
pub fn build_connect_info(
    options: &Options,
    info: &ServerInfo,
    server: &ServerAddr,
) -> Result<ConnectInfo> {
    let mut connect = ConnectInfo {
        verbose: options.verbose,
        pedantic: options.pedantic,
        tls_required: options.tls_required || server.tls_required() || info.tls_required,
        name: options.name.clone(),
        lang: LANG.to_string(),
        version: VERSION.to_string(),
        protocol: PROTOCOL_VERSION,
        echo: !options.no_echo,
        headers: true,
        no_responders: true,
        ..ConnectInfo::default()
    };

    if options.user.is_some() || options.token.is_some() {
        connect.user = options.user.clone();
        connect.pass = options.password.clone();
        connect.auth_token = options.token.clone();
    } else {
        connect.user = server.user().map(str::to_string);
        connect.pass = server.password().map(str::to_string);
        connect.auth_token = server.token().map(str::to_string);
    }

    if let (Some(nonce), Some(signer)) = (info.nonce.as_deref(), options.signer.as_ref()) {
        let signature = signer
            .sign(nonce.as_bytes())
            .map_err(|err| Error::Authorization(format!("signing nonce failed: {err:#}")))?;
        connect.sig = Some(URL_SAFE_NO_PAD.encode(signature));
        connect.jwt = signer.jwt();
        connect.nkey = signer.public_key();
    }
    Ok(connect)
}

/// Classifies an `-ERR` received during or after the handshake.
pub(crate) fn classify_server_error(message: &str) -> ServerErrorKind {
    let lower = message.to_ascii_lowercase();
    // Covers "Authorization Violation" and the "... Authentication Expired" family.
    if lower.contains("authorization violation") || lower.contains("authentication") {
        ServerErrorKind::Authorization
    } else if lower.contains("stale connection") {
        ServerErrorKind::Stale
    } else if lower.contains("permissions violation") {
        ServerErrorKind::Permissions
    } else {
        ServerErrorKind::Other
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ServerErrorKind {
    Authorization,
    Stale,
    Permissions,
    Other,
}
