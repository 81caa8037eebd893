//! One request/response exchange against one upstream.
//!
//! A probe's wire transport matches the client's. Probes report a payload or
//! an error; they never synthesize replies, and timeouts surface as errors so
//! the parent handler accounts the failure from the exit signal alone.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::anyhow;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use crate::reply::Transport;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_REPLY_SIZE: usize = 4096;

pub async fn exchange(
    transport: Transport,
    endpoint: SocketAddr,
    query: &[u8],
) -> anyhow::Result<Vec<u8>> {
    match transport {
        Transport::Udp => exchange_udp(endpoint, query).await,
        Transport::Tcp => exchange_tcp(endpoint, query).await,
    }
}

/// Send one datagram from an ephemeral socket and wait for one datagram from
/// exactly that endpoint; datagrams from any other source are ignored.
async fn exchange_udp(endpoint: SocketAddr, query: &[u8]) -> anyhow::Result<Vec<u8>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.send_to(query, endpoint).await?;

    tokio::time::timeout(PROBE_TIMEOUT, async {
        let mut buf = vec![0u8; MAX_REPLY_SIZE];
        loop {
            let (len, from) = socket.recv_from(&mut buf).await?;
            if from == endpoint {
                return Ok(buf[..len].to_vec());
            }
        }
    })
    .await
    .map_err(|_| anyhow!("no reply from {} within {:?}", endpoint, PROBE_TIMEOUT))?
}

/// Connect, write the query with a 2-byte big-endian length prefix, read one
/// length-prefixed reply.
async fn exchange_tcp(endpoint: SocketAddr, query: &[u8]) -> anyhow::Result<Vec<u8>> {
    tokio::time::timeout(PROBE_TIMEOUT, async {
        let mut stream = TcpStream::connect(endpoint).await?;
        stream.write_all(&(query.len() as u16).to_be_bytes()).await?;
        stream.write_all(query).await?;

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;
        Ok(payload)
    })
    .await
    .map_err(|_| anyhow!("no reply from {} within {:?}", endpoint, PROBE_TIMEOUT))?
}
