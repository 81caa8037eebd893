//! Reply delivery back to the client.
//!
//! A query handler answers through a `ReplyHandle` and never learns whether
//! the client spoke UDP or TCP. The UDP variant sends one datagram from the
//! listener socket; the TCP variant enqueues the payload to the connection's
//! writer task, which owns the length-prefix framing. Delivery is
//! fire-and-forget on both: a vanished client is not an error.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

impl Transport {
    pub fn name(self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
        }
    }
}

#[derive(Clone)]
pub enum ReplyHandle {
    Udp {
        socket: Arc<UdpSocket>,
        client: SocketAddr,
    },
    Tcp {
        queue: mpsc::Sender<Vec<u8>>,
    },
}

impl ReplyHandle {
    pub fn udp(socket: Arc<UdpSocket>, client: SocketAddr) -> Self {
        ReplyHandle::Udp { socket, client }
    }

    pub fn tcp(queue: mpsc::Sender<Vec<u8>>) -> Self {
        ReplyHandle::Tcp { queue }
    }

    /// Which wire transport the client used; probes match it.
    pub fn transport(&self) -> Transport {
        match self {
            ReplyHandle::Udp { .. } => Transport::Udp,
            ReplyHandle::Tcp { .. } => Transport::Tcp,
        }
    }

    /// Push reply bytes toward the client, ignoring the outcome.
    pub async fn deliver(&self, payload: Vec<u8>) {
        match self {
            ReplyHandle::Udp { socket, client } => {
                let _ = socket.send_to(&payload, *client).await;
            }
            ReplyHandle::Tcp { queue } => {
                let _ = queue.send(payload).await;
            }
        }
    }
}
