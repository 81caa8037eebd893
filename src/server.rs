//! Client-facing listeners.
//!
//! Both adapters do the same thing once framing is stripped: hand the raw
//! query and a reply handle to a fresh query handler and move on. The UDP
//! loop never blocks on a query. The TCP side runs one reader and one writer
//! task per connection; reader, writer, and the connection's in-flight
//! handlers share a failure domain, so a vanished client cannot strand
//! handlers probing on its behalf.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::fsm::{HandlerContext, QueryFsm};
use crate::reply::ReplyHandle;

const MAX_UDP_QUERY_SIZE: usize = 4096;

/// Per-connection cap on replies queued toward a slow client.
const TCP_REPLY_QUEUE: usize = 32;

pub async fn run_udp(socket: Arc<UdpSocket>, ctx: Arc<HandlerContext>) {
    let mut buf = vec![0u8; MAX_UDP_QUERY_SIZE];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, client)) => {
                let handle = ReplyHandle::udp(socket.clone(), client);
                QueryFsm::start(handle, buf[..len].to_vec(), ctx.clone());
            }
            Err(e) => error!("UDP recv error: {}", e),
        }
    }
}

pub async fn run_tcp(listener: TcpListener, ctx: Arc<HandlerContext>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, ctx).await {
                        debug!("TCP client {} gone: {}", peer, e);
                    }
                });
            }
            Err(e) => error!("TCP accept error: {}", e),
        }
    }
}

/// Read length-prefixed queries off one client connection, one handler per
/// query. Replies flow back through the writer task with the same framing.
///
/// The connection's handlers live in a task set owned here, so however the
/// read loop ends, whatever is still probing is aborted with it. The writer
/// dying on a dead client drops its receiver; `tx.closed()` then stops the
/// read loop, closing the failure domain in the other direction.
async fn serve_connection(stream: TcpStream, ctx: Arc<HandlerContext>) -> anyhow::Result<()> {
    let (mut reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::channel::<Vec<u8>>(TCP_REPLY_QUEUE);
    tokio::spawn(write_replies(writer, rx));

    let mut handlers = JoinSet::new();
    loop {
        while handlers.try_join_next().is_some() {}

        let mut len_buf = [0u8; 2];
        let read = tokio::select! {
            read = reader.read_exact(&mut len_buf) => read,
            _ = tx.closed() => break,
        };
        match read {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 {
            break;
        }

        let mut query = vec![0u8; len];
        reader.read_exact(&mut query).await?;
        handlers.spawn(QueryFsm::task(ReplyHandle::tcp(tx.clone()), query, ctx.clone()));
    }
    Ok(())
}

async fn write_replies(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(payload) = rx.recv().await {
        if writer
            .write_all(&(payload.len() as u16).to_be_bytes())
            .await
            .is_err()
        {
            break;
        }
        if writer.write_all(&payload).await.is_err() {
            break;
        }
    }
}
