use anyhow::Result;
use courier_test_harness::tls::{insecure_client_config, self_signed, trusting_client_config};
use courier_transport::{ServerAddr, TlsOptions, Transport, TransportError, connect_tcp};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Accepts one plain greeting, then upgrades and echoes a line back.
async fn echo_server(config: Arc<rustls::ServerConfig>) -> Result<(ServerAddr, tokio::task::JoinHandle<Result<()>>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = ServerAddr::parse(&format!("tls://{}", listener.local_addr()?))?;
    let task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await?;
        stream.write_all(b"HELLO\r\n").await?;
        let acceptor = tokio_rustls::TlsAcceptor::from(config);
        let mut tls = acceptor.accept(stream).await?;
        let mut buf = [0u8; 5];
        tls.read_exact(&mut buf).await?;
        tls.write_all(&buf).await?;
        tls.flush().await?;
        Ok(())
    });
    Ok((addr, task))
}

async fn read_greeting(stream: &mut tokio::net::TcpStream) -> Result<()> {
    let mut greeting = [0u8; 7];
    stream.read_exact(&mut greeting).await?;
    assert_eq!(&greeting, b"HELLO\r\n");
    Ok(())
}

#[tokio::test]
async fn upgrade_after_plaintext_greeting() -> Result<()> {
    let material = self_signed()?;
    let (addr, server) = echo_server(material.server_config.clone()).await?;

    let mut stream = connect_tcp(&addr, Duration::from_secs(2)).await?;
    read_greeting(&mut stream).await?;
    let mut options = TlsOptions::with_config(trusting_client_config(&material.cert_der)?);
    options.server_name = Some("localhost".to_string());
    let mut transport = Transport::upgrade(stream, addr.host(), &options).await?;
    assert!(transport.is_tls());

    transport.write_all(b"ping!").await?;
    transport.flush().await?;
    let mut echoed = [0u8; 5];
    transport.read_exact(&mut echoed).await?;
    assert_eq!(&echoed, b"ping!");
    server.await??;
    Ok(())
}

#[tokio::test]
async fn insecure_config_skips_verification() -> Result<()> {
    let material = self_signed()?;
    let (addr, server) = echo_server(material.server_config.clone()).await?;

    let mut stream = connect_tcp(&addr, Duration::from_secs(2)).await?;
    read_greeting(&mut stream).await?;
    let options = TlsOptions::with_config(insecure_client_config()?);
    let mut transport = Transport::upgrade(stream, addr.host(), &options).await?;
    transport.write_all(b"abcde").await?;
    let mut echoed = [0u8; 5];
    transport.read_exact(&mut echoed).await?;
    assert_eq!(&echoed, b"abcde");
    server.await??;
    Ok(())
}

#[tokio::test]
async fn untrusted_certificate_fails_upgrade() -> Result<()> {
    let material = self_signed()?;
    let (addr, _server) = echo_server(material.server_config.clone()).await?;

    let mut stream = connect_tcp(&addr, Duration::from_secs(2)).await?;
    read_greeting(&mut stream).await?;
    let err = Transport::upgrade(stream, addr.host(), &TlsOptions::default())
        .await
        .expect_err("self-signed cert is not in the public roots");
    assert!(matches!(err, TransportError::Tls(_)), "{err:?}");
    Ok(())
}
