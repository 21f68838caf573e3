//! Host name resolution on a dedicated thread.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::mpsc;
use std::thread::JoinHandle;

use ice_core::{IceError, Result};
use parking_lot::Mutex;

type Callback = Box<dyn FnOnce(Result<Vec<SocketAddr>>) + Send>;

struct Request {
    host: String,
    port: u16,
    callback: Callback,
}

/// Resolves host names without blocking the async runtime.
///
/// Lookups run one at a time on a single OS thread. Numeric hosts are
/// answered immediately on the calling thread.
pub struct EndpointHostResolver {
    sender: Mutex<Option<mpsc::Sender<Request>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for EndpointHostResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointHostResolver")
            .field("destroyed", &self.sender.lock().is_none())
            .finish()
    }
}

fn run(rx: mpsc::Receiver<Request>) {
    while let Ok(request) = rx.recv() {
        let result = (request.host.as_str(), request.port)
            .to_socket_addrs()
            .map_err(|e| IceError::Dns {
                host: request.host.clone(),
                reason: e.to_string(),
            })
            .and_then(|addrs| {
                let addrs: Vec<SocketAddr> = addrs.collect();
                if addrs.is_empty() {
                    Err(IceError::Dns {
                        host: request.host.clone(),
                        reason: "no addresses found".to_string(),
                    })
                } else {
                    Ok(addrs)
                }
            });
        tracing::debug!(
            target: "ice::network",
            host = %request.host,
            ok = result.is_ok(),
            "resolved host"
        );
        (request.callback)(result);
    }
}

impl EndpointHostResolver {
    /// Starts the resolver thread.
    pub fn new() -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("ice-host-resolver".to_string())
            .spawn(move || run(rx))?;
        Ok(Self {
            sender: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Resolves `host:port` and delivers the addresses to `callback`.
    ///
    /// An empty host means the loopback address for clients and every
    /// interface for object adapters.
    pub fn resolve<F>(&self, host: &str, port: u16, oa_endpoint: bool, callback: F)
    where
        F: FnOnce(Result<Vec<SocketAddr>>) + Send + 'static,
    {
        if host.is_empty() {
            let ip = if oa_endpoint {
                Ipv4Addr::UNSPECIFIED
            } else {
                Ipv4Addr::LOCALHOST
            };
            callback(Ok(vec![SocketAddr::new(IpAddr::V4(ip), port)]));
            return;
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            callback(Ok(vec![SocketAddr::new(ip, port)]));
            return;
        }

        let request = Request {
            host: host.to_string(),
            port,
            callback: Box::new(callback),
        };
        let sender = self.sender.lock().clone();
        match sender {
            Some(tx) => {
                if let Err(mpsc::SendError(request)) = tx.send(request) {
                    (request.callback)(Err(IceError::CommunicatorDestroyed));
                }
            }
            None => (request.callback)(Err(IceError::CommunicatorDestroyed)),
        }
    }

    /// Resolves the address an acceptor should bind to.
    pub async fn resolve_bind_address(&self, host: &str, port: u16) -> Result<SocketAddr> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.resolve(host, port, true, move |result| {
            let _ = tx.send(result);
        });
        let addrs = rx.await.map_err(|_| IceError::CommunicatorDestroyed)??;
        addrs.into_iter().next().ok_or_else(|| IceError::Dns {
            host: host.to_string(),
            reason: "no addresses found".to_string(),
        })
    }

    /// Stops the resolver thread and waits for it to exit.
    ///
    /// Requests submitted afterwards fail with `CommunicatorDestroyed`.
    pub fn destroy(&self) {
        self.sender.lock().take();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for EndpointHostResolver {
    fn drop(&mut self) {
        self.sender.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;
    use std::time::Duration;

    #[test]
    fn test_numeric_host_bypasses_thread() {
        let resolver = EndpointHostResolver::new().unwrap();
        let (tx, rx) = channel();
        resolver.resolve("10.1.2.3", 99, false, move |r| tx.send(r).unwrap());
        let addrs = rx.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(addrs, vec!["10.1.2.3:99".parse().unwrap()]);
        resolver.destroy();
    }

    #[test]
    fn test_empty_host() {
        let resolver = EndpointHostResolver::new().unwrap();
        let (tx, rx) = channel();
        let tx2 = tx.clone();
        resolver.resolve("", 1, false, move |r| tx.send(r).unwrap());
        resolver.resolve("", 1, true, move |r| tx2.send(r).unwrap());
        let client = rx.recv().unwrap().unwrap();
        let server = rx.recv().unwrap().unwrap();
        assert!(client[0].ip().is_loopback());
        assert!(server[0].ip().is_unspecified());
        resolver.destroy();
    }

    #[test]
    fn test_localhost_on_resolver_thread() {
        let resolver = EndpointHostResolver::new().unwrap();
        let (tx, rx) = channel();
        resolver.resolve("localhost", 5, false, move |r| {
            let name = std::thread::current().name().map(str::to_string);
            tx.send((r, name)).unwrap();
        });
        let (result, thread) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(!result.unwrap().is_empty());
        assert_eq!(thread.as_deref(), Some("ice-host-resolver"));
        resolver.destroy();
    }

    #[test]
    fn test_resolve_after_destroy() {
        let resolver = EndpointHostResolver::new().unwrap();
        resolver.destroy();
        let (tx, rx) = channel();
        resolver.resolve("localhost", 5, false, move |r| tx.send(r).unwrap());
        assert!(matches!(
            rx.recv().unwrap(),
            Err(IceError::CommunicatorDestroyed)
        ));
    }
}
