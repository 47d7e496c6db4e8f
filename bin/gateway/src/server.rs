//! Inbound listeners

use anyhow::Result;
use gateway_proxy::SharedGateway;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::tokio::TokioIo;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

/// Accept plain HTTP connections until the listener fails
pub async fn accept_http_connections(listener: TcpListener, gateway: Arc<SharedGateway>) -> Result<()> {
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let gateway = gateway.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let gateway = gateway.clone();
                async move { gateway.serve(req, peer_addr, "http").await }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Error serving HTTP connection from {}: {}", peer_addr, e);
            }
        });
    }
}

/// Accept HTTPS connections with TLS
pub async fn accept_https_connections(listener: TcpListener, tls_acceptor: TlsAcceptor, gateway: Arc<SharedGateway>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let tls_acceptor = tls_acceptor.clone();
                let gateway = gateway.clone();

                tokio::task::spawn(async move {
                    match tls_acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            let io = TokioIo::new(tls_stream);
                            let service = service_fn(move |req| {
                                let gateway = gateway.clone();
                                async move { gateway.serve(req, peer_addr, "https").await }
                            });

                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                debug!("Error serving HTTPS connection from {}: {}", peer_addr, e);
                            }
                        }
                        Err(e) => {
                            debug!("TLS error from {}: {}", peer_addr, e);
                        }
                    }
                });
            }
            Err(e) => {
                warn!("Error accepting HTTPS connection: {}", e);
            }
        }
    }
}
