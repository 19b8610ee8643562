//! Reverse TCP tunnel from a build VM back to this machine.
//!
//! An SSH session is opened to the VM and a remote port forward is
//! requested. Every connection the VM makes to that port arrives as a
//! forwarded channel and is relayed to `forward_host:forward_port` by its own
//! task.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rand::Rng;
use russh::client::{self, Msg, Session};
use russh::{Channel, Disconnect};
use russh_keys::key;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Buffer size for copying between the channel and the local socket
const CHUNK_SIZE: usize = 1024;

/// Ports already taken on the VM (SSH and VNC)
const RESERVED_PORTS: [u16; 2] = [22, 5900];

#[derive(Debug, Clone, PartialEq)]
pub struct TunnelSession {
    pub vm_host: String,
    pub vm_ssh_port: u16,
    pub vm_user: String,
    pub vm_password: String,
    pub remote_port: u16,
    pub forward_host: String,
    pub forward_port: u16,
}

/// Port to listen on inside the VM.
///
/// An explicit choice wins. Otherwise the forwarded port is reused unless it
/// collides with a port the VM already serves, in which case a random port
/// in `[10000, 65000)` is picked.
pub fn pick_remote_port<R: Rng>(forward_port: u16, explicit: Option<u16>, rng: &mut R) -> u16 {
    match explicit {
        Some(port) => port,
        None if RESERVED_PORTS.contains(&forward_port) => rng.gen_range(10000..65000),
        None => forward_port,
    }
}

struct TunnelHandler {
    forward_host: String,
    forward_port: u16,
}

#[async_trait]
impl client::Handler for TunnelHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Build VMs are ephemeral and have no stable host key
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Forwarded connection to {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );
        let host = self.forward_host.clone();
        let port = self.forward_port;
        tokio::spawn(async move {
            if let Err(e) = forward(channel.into_stream(), &host, port).await {
                debug!("Tunnel connection closed with error: {}", e);
            }
        });
        Ok(())
    }
}

/// Connect to the local service and relay a forwarded connection to it.
///
/// When the service is unreachable the tunnel side is shut down and the
/// connection is dropped; other forwarded connections are unaffected.
async fn forward<T>(mut tunnel: T, host: &str, port: u16) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let socket = match TcpStream::connect((host, port)).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("Failed to connect to {}:{}: {}", host, port, e);
            let _ = tunnel.shutdown().await;
            return Ok(());
        }
    };
    pipe(tunnel, socket).await
}

/// Copy bytes both ways until either side reaches end of stream, then shut
/// down both writers
async fn pipe<T, L>(tunnel: T, local: L) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
    L: AsyncRead + AsyncWrite + Unpin,
{
    let (tunnel_rx, mut tunnel_tx) = tokio::io::split(tunnel);
    let (local_rx, mut local_tx) = tokio::io::split(local);
    let mut tunnel_rx = BufReader::with_capacity(CHUNK_SIZE, tunnel_rx);
    let mut local_rx = BufReader::with_capacity(CHUNK_SIZE, local_rx);

    let result = tokio::select! {
        copied = tokio::io::copy_buf(&mut tunnel_rx, &mut local_tx) => {
            copied.map(|n| debug!("Tunnel closed after {} bytes inbound", n))
                .context("Failed to relay tunnel data to the local socket")
        }
        copied = tokio::io::copy_buf(&mut local_rx, &mut tunnel_tx) => {
            copied.map(|n| debug!("Local socket closed after {} bytes outbound", n))
                .context("Failed to relay local data into the tunnel")
        }
    };

    let _ = local_tx.shutdown().await;
    let _ = tunnel_tx.shutdown().await;
    result
}

/// Run the tunnel until Ctrl+C
pub async fn relay(session: &TunnelSession) -> Result<()> {
    let config = Arc::new(client::Config {
        inactivity_timeout: None,
        ..Default::default()
    });
    let handler = TunnelHandler {
        forward_host: session.forward_host.clone(),
        forward_port: session.forward_port,
    };

    let mut handle = match client::connect(
        config,
        (session.vm_host.as_str(), session.vm_ssh_port),
        handler,
    )
    .await
    {
        Ok(handle) => handle,
        Err(e) => bail!("Failed to connect to remote host: {}", e),
    };

    let authenticated = handle
        .authenticate_password(&session.vm_user, &session.vm_password)
        .await
        .context("Failed to connect to remote host")?;
    if !authenticated {
        bail!("Failed to connect to remote host: authentication rejected");
    }

    let reply = handle
        .tcpip_forward("", u32::from(session.remote_port))
        .await
        .context("The remote host refused the port forward")?;
    debug!("Port forward reply: {:?}", reply);
    info!(
        "Tunnel {}:{} -> {}:{} open",
        session.vm_host, session.remote_port, session.forward_host, session.forward_port
    );

    println!(
        "Forwarding remote port {} to port {} on {}. Press ctrl+C to close the tunnel.",
        session.remote_port, session.forward_port, session.forward_host
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    println!("\nTunnel closed");

    let _ = handle
        .disconnect(Disconnect::ByApplication, "", "English")
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    /// Local service echoing every connection back to itself
    async fn echo_server() -> (u16, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut rx, mut tx) = socket.split();
                    let _ = tokio::io::copy(&mut rx, &mut tx).await;
                });
            }
        });
        (port, task)
    }

    fn spawn_forward<T>(tunnel: T, port: u16) -> JoinHandle<Result<()>>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        tokio::spawn(async move { forward(tunnel, "127.0.0.1", port).await })
    }

    #[test]
    fn test_remote_port_reuses_forward_port() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(pick_remote_port(8000, None, &mut rng), 8000);
        assert_eq!(pick_remote_port(3000, None, &mut rng), 3000);
    }

    #[test]
    fn test_remote_port_avoids_vm_ports() {
        let mut rng = StdRng::seed_from_u64(7);
        for forward in [22, 5900] {
            for _ in 0..100 {
                let port = pick_remote_port(forward, None, &mut rng);
                assert!((10000..65000).contains(&port), "port {} out of range", port);
            }
        }
    }

    #[test]
    fn test_explicit_remote_port_wins() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(pick_remote_port(22, Some(2222), &mut rng), 2222);
        assert_eq!(pick_remote_port(8000, Some(9000), &mut rng), 9000);
    }

    #[tokio::test]
    async fn test_unreachable_vm_fails_the_relay() {
        let session = TunnelSession {
            vm_host: "127.0.0.1".to_string(),
            vm_ssh_port: 9,
            vm_user: "odevio".to_string(),
            vm_password: "secret".to_string(),
            remote_port: 8000,
            forward_host: "localhost".to_string(),
            forward_port: 8000,
        };

        let err = relay(&session).await.unwrap_err();
        assert!(err
            .to_string()
            .starts_with("Failed to connect to remote host"));
    }

    #[tokio::test]
    async fn test_forward_relays_both_directions() {
        let (port, server) = echo_server().await;
        let (mut vm, tunnel) = duplex(64);
        let task = spawn_forward(tunnel, port);

        vm.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut reply = [0u8; 18];
        timeout(WAIT, vm.read_exact(&mut reply)).await.unwrap().unwrap();
        assert_eq!(&reply, b"GET / HTTP/1.1\r\n\r\n");

        vm.shutdown().await.unwrap();
        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn test_forward_delivers_large_payloads_in_full() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(&payload).await.unwrap();
        });

        let (mut vm, tunnel) = duplex(CHUNK_SIZE);
        let task = spawn_forward(tunnel, port);

        let mut received = Vec::new();
        timeout(WAIT, vm.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.len(), expected.len());
        assert!(received == expected);

        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_local_close_ends_the_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let (mut vm, tunnel) = duplex(64);
        let task = spawn_forward(tunnel, port);

        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
        let mut rest = Vec::new();
        timeout(WAIT, vm.read_to_end(&mut rest)).await.unwrap().unwrap();
        assert!(rest.is_empty());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tunnel_eof_ends_the_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            socket.read_to_end(&mut received).await.unwrap();
            received
        });

        let (mut vm, tunnel) = duplex(64);
        let task = spawn_forward(tunnel, port);

        vm.write_all(b"bye").await.unwrap();
        vm.shutdown().await.unwrap();

        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
        let received = timeout(WAIT, server).await.unwrap().unwrap();
        assert_eq!(received, b"bye");
    }

    #[tokio::test]
    async fn test_unreachable_local_service_drops_only_that_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_port = listener.local_addr().unwrap().port();
        drop(listener);

        let (mut vm, tunnel) = duplex(64);
        let task = spawn_forward(tunnel, closed_port);

        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
        let mut rest = Vec::new();
        timeout(WAIT, vm.read_to_end(&mut rest)).await.unwrap().unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_connections_are_independent() {
        let (port, server) = echo_server().await;
        let (mut first, first_tunnel) = duplex(64);
        let (mut second, second_tunnel) = duplex(64);
        let first_task = spawn_forward(first_tunnel, port);
        let second_task = spawn_forward(second_tunnel, port);

        second.write_all(b"second").await.unwrap();
        first.write_all(b"first").await.unwrap();

        let mut reply = [0u8; 6];
        timeout(WAIT, second.read_exact(&mut reply)).await.unwrap().unwrap();
        assert_eq!(&reply, b"second");
        let mut reply = [0u8; 5];
        timeout(WAIT, first.read_exact(&mut reply)).await.unwrap().unwrap();
        assert_eq!(&reply, b"first");

        // Closing one connection leaves the other usable
        first.shutdown().await.unwrap();
        timeout(WAIT, first_task).await.unwrap().unwrap().unwrap();
        second.write_all(b"again!").await.unwrap();
        let mut reply = [0u8; 6];
        timeout(WAIT, second.read_exact(&mut reply)).await.unwrap().unwrap();
        assert_eq!(&reply, b"again!");

        second.shutdown().await.unwrap();
        timeout(WAIT, second_task).await.unwrap().unwrap().unwrap();
        server.abort();
    }
}
