use std::net::SocketAddr;

use tokio::net::{lookup_host, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::tasks;

/// Handle to an in-flight resolve-and-connect attempt. Dropping it does
/// nothing; [`BootstrapHandle::cancel`] reaps the attempt and suppresses the
/// failure callback.
pub struct BootstrapHandle {
    token: CancellationToken,
}

impl BootstrapHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

/// Resolve `host:port` off the main loop, then try each resulting address
/// in order until one connects. The first successful connect wins and is
/// handed to `on_connected`; once every address has failed, `on_failure`
/// runs exactly once. A single task owns the whole sequence, so the
/// worker-exit/last-connect race cannot double- or zero-notify.
pub fn resolve_and_connect<C, F>(host: String, port: u16, on_connected: C, on_failure: F) -> BootstrapHandle
where
    C: FnOnce(TcpStream, SocketAddr) + Send + 'static,
    F: FnOnce() + Send + 'static,
{
    let token = CancellationToken::new();
    let child = token.clone();
    tasks::spawn(async move {
        tokio::select! {
            biased;
            _ = child.cancelled() => {
                debug!("bootstrap for {}:{} cancelled", host, port);
            }
            connected = try_connect_each(&host, port, on_connected) => {
                if !connected {
                    on_failure();
                }
            }
        }
    });
    BootstrapHandle { token }
}

async fn try_connect_each<C>(host: &str, port: u16, on_connected: C) -> bool
where
    C: FnOnce(TcpStream, SocketAddr),
{
    // getaddrinfo runs on the resolver threadpool, not the actor loop.
    let addresses: Vec<SocketAddr> = match lookup_host((host, port)).await {
        Ok(addresses) => addresses.collect(),
        Err(err) => {
            warn!("DNS lookup for {}:{} failed: {}", host, port, err);
            return false;
        }
    };
    if addresses.is_empty() {
        warn!("DNS lookup for {}:{} gave no addresses", host, port);
        return false;
    }

    for address in addresses {
        match TcpStream::connect(address).await {
            Ok(stream) => {
                on_connected(stream, address);
                return true;
            }
            Err(err) => {
                debug!("connect to {} failed: {}", address, err);
            }
        }
    }
    false
}
