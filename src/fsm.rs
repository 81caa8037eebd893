//! Per-query handler: decode, route, race probes, deliver the first good
//! reply, then drain the losers for accounting.
//!
//! One handler task per client query, fire-and-forget. Probes run as child
//! tasks in a `JoinSet` so whatever is still in flight when the handler
//! returns is aborted with it, and they report through a single mailbox so
//! the handler sees a totally-ordered event sequence: a probe posts at most
//! one reply, then always an exit signal.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::dns::wire;
use crate::metrics::Metrics;
use crate::probe;
use crate::reply::ReplyHandle;
use crate::router::Router;

/// Ceiling on the wait for the first reply.
pub const GLOBAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Upstream amplification cap: at most this many probes per query.
pub const MAX_PROBES: usize = 2;

/// Shared collaborators every query handler needs.
pub struct HandlerContext {
    pub router: Router,
    pub metrics: Arc<Metrics>,
}

enum ProbeEvent {
    Reply {
        slot: usize,
        endpoint: SocketAddr,
        payload: Vec<u8>,
    },
    Exited {
        slot: usize,
        endpoint: SocketAddr,
    },
}

pub struct QueryFsm {
    reply: ReplyHandle,
    raw: Vec<u8>,
    ctx: Arc<HandlerContext>,
}

impl QueryFsm {
    /// Spawn a handler for one client query. The caller hears back only
    /// through the reply handle.
    pub fn start(reply: ReplyHandle, raw: Vec<u8>, ctx: Arc<HandlerContext>) {
        tokio::spawn(Self::task(reply, raw, ctx));
    }

    /// The same handler as an unspawned future, for callers that tie handler
    /// lifetime to a scope of their own. The TCP adapter runs these in a
    /// per-connection task set so a dead connection takes its in-flight
    /// queries down with it.
    pub fn task(
        reply: ReplyHandle,
        raw: Vec<u8>,
        ctx: Arc<HandlerContext>,
    ) -> impl std::future::Future<Output = ()> {
        QueryFsm { reply, raw, ctx }.run()
    }

    async fn run(mut self) {
        let metrics = self.ctx.metrics.clone();

        // Execute: decode, route, spawn probes.
        let msg = match wire::decode(&self.raw) {
            Ok(msg) => msg,
            Err(e) => {
                // Without a valid request there is no id to answer with.
                debug!("dropping undecodable query: {}", e);
                return;
            }
        };
        let pool = self.ctx.router.upstreams_from_questions(&msg.questions);
        if pool.is_empty() {
            warn!("no upstreams for {}", msg);
            metrics.record_no_upstreams();
            self.reply.deliver(msg.to_servfail()).await;
            return;
        }

        let picked = take_upstreams(&pool);
        let transport = self.reply.transport();
        let query = Arc::new(std::mem::take(&mut self.raw));
        let (tx, mut rx) = mpsc::channel(picked.len() * 2);
        let mut probes = JoinSet::new();
        let mut live: HashMap<usize, SocketAddr> = HashMap::new();
        let send_time = Instant::now();

        for (slot, endpoint) in picked.into_iter().enumerate() {
            live.insert(slot, endpoint);
            let tx = tx.clone();
            let query = Arc::clone(&query);
            probes.spawn(async move {
                if let Ok(payload) = probe::exchange(transport, endpoint, &query).await {
                    let _ = tx.send(ProbeEvent::Reply { slot, endpoint, payload }).await;
                }
                let _ = tx.send(ProbeEvent::Exited { slot, endpoint }).await;
            });
        }
        drop(tx);

        // WaitForFirstReply: the first payload that decodes wins. Probes that
        // exit without a reply, or reply with bytes we cannot parse, come off
        // the live set as failures.
        let deadline = tokio::time::Instant::now() + GLOBAL_TIMEOUT;
        let drain_budget = loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(ProbeEvent::Reply { slot, endpoint, payload }) if live.contains_key(&slot) => {
                        if wire::decode(&payload).is_ok() {
                            let elapsed = send_time.elapsed();
                            live.remove(&slot);
                            metrics.record_success(endpoint);
                            metrics.record_latency(endpoint, elapsed.as_micros() as u64);
                            debug!(
                                "{} answered by {} in {:?} over {}",
                                msg, endpoint, elapsed, transport.name()
                            );
                            self.reply.deliver(payload).await;
                            break elapsed;
                        }
                        debug!("undecodable reply from {}", endpoint);
                        live.remove(&slot);
                        metrics.record_failure(endpoint);
                        if live.is_empty() {
                            metrics.record_upstreams_failed();
                            return;
                        }
                    }
                    Some(ProbeEvent::Exited { slot, endpoint }) if live.contains_key(&slot) => {
                        live.remove(&slot);
                        metrics.record_failure(endpoint);
                        if live.is_empty() {
                            warn!("every upstream failed for {}", msg);
                            metrics.record_upstreams_failed();
                            return;
                        }
                    }
                    // event for a slot already retired
                    Some(_) => {}
                    None => {
                        for endpoint in live.values() {
                            metrics.record_failure(*endpoint);
                        }
                        metrics.record_upstreams_failed();
                        return;
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("giving up on {} after {:?}", msg, GLOBAL_TIMEOUT);
                    for endpoint in live.values() {
                        metrics.record_failure(*endpoint);
                    }
                    metrics.record_upstreams_failed();
                    return;
                }
            }
        };

        // DrainLosers: losers get no more time than the winner took. Their
        // replies are accounting only and are never delivered.
        let drain_deadline = tokio::time::Instant::now() + drain_budget;
        while !live.is_empty() {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(ProbeEvent::Reply { slot, endpoint, .. }) if live.contains_key(&slot) => {
                        live.remove(&slot);
                        metrics.record_success(endpoint);
                        metrics.record_latency(endpoint, send_time.elapsed().as_micros() as u64);
                    }
                    Some(ProbeEvent::Exited { slot, endpoint }) if live.contains_key(&slot) => {
                        live.remove(&slot);
                        metrics.record_failure(endpoint);
                    }
                    Some(_) => {}
                    None => break,
                },
                _ = tokio::time::sleep_until(drain_deadline) => {
                    for endpoint in live.values() {
                        metrics.record_failure(*endpoint);
                    }
                    break;
                }
            }
        }
        // Terminated: dropping the JoinSet aborts any probe still in flight.
    }
}

/// Pick the probes for one query: the whole pool when it holds at most
/// `MAX_PROBES` entries, otherwise `MAX_PROBES` uniform samples drawn with
/// replacement. Duplicate pool entries are deliberate sampling weights.
pub fn take_upstreams(pool: &[SocketAddr]) -> Vec<SocketAddr> {
    if pool.len() <= MAX_PROBES {
        return pool.to_vec();
    }
    let mut rng = rand::thread_rng();
    (0..MAX_PROBES)
        .map(|_| pool[rng.gen_range(0..pool.len())])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ForwardConfig};
    use crate::dns::types::{DnsClass, Rcode, RecordType};
    use crate::dns::wire::{encode_query, write_name};
    use crate::zones::ZoneCache;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, UdpSocket};

    fn ctx_with_public(pool: &[SocketAddr]) -> Arc<HandlerContext> {
        let metrics = Arc::new(Metrics::new());
        let config = Config {
            forward: ForwardConfig {
                mesos_resolvers: Vec::new(),
                resolvers: pool.iter().map(|a| a.to_string()).collect(),
                zone_servers_file: None,
            },
            ..Config::default()
        };
        let apexes: Vec<String> = Vec::new();
        let router = Router::new(&config, Vec::new(), ZoneCache::new(&apexes), metrics.clone());
        Arc::new(HandlerContext { router, metrics })
    }

    /// Mock upstream that answers every datagram after `delay`, echoing the
    /// query with QR set and `tag` stamped into the last header byte.
    async fn spawn_udp_upstream(delay: Duration, tag: u8) -> SocketAddr {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                let mut reply = buf[..len].to_vec();
                reply[2] |= 0x80;
                reply[11] = tag;
                let socket = socket.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = socket.send_to(&reply, peer).await;
                });
            }
        });
        addr
    }

    /// Mock upstream whose replies are not DNS messages.
    async fn spawn_garbage_upstream() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((_, peer)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(b"xx", peer).await;
            }
        });
        addr
    }

    /// Mock upstream that receives and never answers.
    async fn spawn_silent_upstream() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                if socket.recv_from(&mut buf).await.is_err() {
                    break;
                }
            }
        });
        addr
    }

    async fn spawn_tcp_upstream(delay: Duration, tag: u8) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut len_buf = [0u8; 2];
                    if stream.read_exact(&mut len_buf).await.is_err() {
                        return;
                    }
                    let len = u16::from_be_bytes(len_buf) as usize;
                    let mut query = vec![0u8; len];
                    if stream.read_exact(&mut query).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(delay).await;
                    query[2] |= 0x80;
                    query[11] = tag;
                    let _ = stream.write_all(&(query.len() as u16).to_be_bytes()).await;
                    let _ = stream.write_all(&query).await;
                });
            }
        });
        addr
    }

    async fn udp_client() -> (ReplyHandle, UdpSocket) {
        let listener = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let handle = ReplyHandle::udp(listener, client.local_addr().unwrap());
        (handle, client)
    }

    async fn recv_reply(client: &UdpSocket, within: Duration) -> Option<Vec<u8>> {
        let mut buf = [0u8; 512];
        match tokio::time::timeout(within, client.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => Some(buf[..len].to_vec()),
            _ => None,
        }
    }

    async fn wait_until(within: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + within;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[test]
    fn take_upstreams_keeps_small_pools_whole() {
        let a: SocketAddr = "10.0.0.1:53".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:53".parse().unwrap();
        assert_eq!(take_upstreams(&[a]), vec![a]);
        assert_eq!(take_upstreams(&[a, b]), vec![a, b]);
        // duplicates in a small pool survive untouched
        assert_eq!(take_upstreams(&[a, a]), vec![a, a]);
    }

    #[test]
    fn take_upstreams_samples_two_from_larger_pools() {
        let pool: Vec<SocketAddr> = (1..=5)
            .map(|i| format!("10.0.0.{}:53", i).parse().unwrap())
            .collect();
        for _ in 0..50 {
            let picked = take_upstreams(&pool);
            assert_eq!(picked.len(), 2);
            assert!(picked.iter().all(|p| pool.contains(p)));
        }

        let x: SocketAddr = "10.0.0.9:53".parse().unwrap();
        assert_eq!(take_upstreams(&vec![x; 5]), vec![x, x]);
    }

    #[tokio::test]
    async fn first_reply_wins_and_loser_is_drained() {
        let fast = spawn_udp_upstream(Duration::from_millis(150), 0xA1).await;
        let slow = spawn_udp_upstream(Duration::from_millis(210), 0xB2).await;
        let ctx = ctx_with_public(&[fast, slow]);
        let (handle, client) = udp_client().await;

        let query = encode_query(0x5151, "race.example.com", RecordType::A);
        QueryFsm::start(handle, query, ctx.clone());

        let reply = recv_reply(&client, Duration::from_secs(2)).await.expect("winner reply");
        assert_eq!(reply[11], 0xA1);
        assert_eq!(u16::from_be_bytes([reply[0], reply[1]]), 0x5151);

        // the slower upstream answers inside the drain window
        let metrics = ctx.metrics.clone();
        assert!(
            wait_until(Duration::from_secs(2), || {
                metrics.successes(fast) == 1 && metrics.successes(slow) == 1
            })
            .await
        );
        assert_eq!(ctx.metrics.failures(fast), 0);
        assert_eq!(ctx.metrics.failures(slow), 0);
        assert_eq!(ctx.metrics.latency(fast).count, 1);
        assert!(ctx.metrics.latency(fast).min_us >= 100_000);

        // at most one delivery per query
        assert!(recv_reply(&client, Duration::from_millis(300)).await.is_none());
    }

    #[tokio::test]
    async fn slow_loser_is_abandoned_after_the_drain_window() {
        let fast = spawn_udp_upstream(Duration::from_millis(20), 0xA1).await;
        let slow = spawn_udp_upstream(Duration::from_millis(500), 0xB2).await;
        let ctx = ctx_with_public(&[fast, slow]);
        let (handle, client) = udp_client().await;

        QueryFsm::start(handle, encode_query(1, "race.example.com", RecordType::A), ctx.clone());

        assert!(recv_reply(&client, Duration::from_secs(2)).await.is_some());
        let metrics = ctx.metrics.clone();
        assert!(
            wait_until(Duration::from_secs(2), || {
                metrics.successes(fast) == 1 && metrics.failures(slow) == 1
            })
            .await
        );
        assert_eq!(ctx.metrics.successes(slow), 0);
    }

    #[tokio::test]
    async fn empty_pool_yields_exactly_one_servfail() {
        let ctx = ctx_with_public(&[]);
        let (handle, client) = udp_client().await;

        let query = encode_query(0x0F0F, "unroutable.example.com", RecordType::Aaaa);
        QueryFsm::start(handle, query, ctx.clone());

        let reply = recv_reply(&client, Duration::from_secs(1)).await.expect("servfail");
        let msg = wire::decode(&reply).unwrap();
        assert_eq!(msg.header.id, 0x0F0F);
        assert_eq!(msg.header.rcode(), Rcode::ServFail);
        assert_eq!(msg.questions.len(), 1);
        assert_eq!(msg.questions[0].name, "unroutable.example.com");

        assert_eq!(ctx.metrics.no_upstreams_available(), 1);
        assert!(recv_reply(&client, Duration::from_millis(200)).await.is_none());
    }

    #[tokio::test]
    async fn undecodable_upstream_replies_count_as_failures() {
        let a = spawn_garbage_upstream().await;
        let b = spawn_garbage_upstream().await;
        let ctx = ctx_with_public(&[a, b]);
        let (handle, client) = udp_client().await;

        QueryFsm::start(handle, encode_query(2, "bad.example.com", RecordType::A), ctx.clone());

        let metrics = ctx.metrics.clone();
        assert!(
            wait_until(Duration::from_secs(2), || {
                metrics.failures(a) == 1 && metrics.failures(b) == 1 && metrics.upstreams_failed() == 1
            })
            .await
        );
        assert!(recv_reply(&client, Duration::from_millis(200)).await.is_none());
    }

    #[tokio::test]
    async fn unanswered_probes_time_out_without_a_reply() {
        let silent = spawn_silent_upstream().await;
        let ctx = ctx_with_public(&[silent]);
        let (handle, client) = udp_client().await;

        QueryFsm::start(handle, encode_query(3, "void.example.com", RecordType::A), ctx.clone());

        // nothing may reach the client, before or after the give-up point
        assert!(recv_reply(&client, GLOBAL_TIMEOUT + Duration::from_millis(500)).await.is_none());
        let metrics = ctx.metrics.clone();
        assert!(
            wait_until(Duration::from_secs(1), || {
                metrics.failures(silent) == 1 && metrics.upstreams_failed() == 1
            })
            .await
        );
    }

    #[tokio::test]
    async fn duplicate_pool_entries_probe_the_same_upstream_twice() {
        let x = spawn_udp_upstream(Duration::from_millis(100), 0xC3).await;
        let ctx = ctx_with_public(&[x, x, x, x, x]);
        let (handle, client) = udp_client().await;

        QueryFsm::start(handle, encode_query(4, "weighted.example.com", RecordType::A), ctx.clone());

        let reply = recv_reply(&client, Duration::from_secs(2)).await.expect("reply");
        assert_eq!(reply[11], 0xC3);

        let metrics = ctx.metrics.clone();
        assert!(wait_until(Duration::from_secs(2), || metrics.successes(x) == 2).await);
        assert!(recv_reply(&client, Duration::from_millis(200)).await.is_none());
    }

    #[tokio::test]
    async fn only_the_first_question_routes() {
        let upstream = spawn_udp_upstream(Duration::from_millis(10), 0xD4).await;
        let ctx = ctx_with_public(&[upstream]);
        let (handle, client) = udp_client().await;

        let mut raw = encode_query(5, "first.example.com", RecordType::A);
        raw[5] = 2;
        write_name(&mut raw, "second.mesos");
        raw.extend_from_slice(&RecordType::A.to_u16().to_be_bytes());
        raw.extend_from_slice(&DnsClass::In.to_u16().to_be_bytes());

        QueryFsm::start(handle, raw, ctx.clone());

        assert!(recv_reply(&client, Duration::from_secs(2)).await.is_some());
        assert_eq!(ctx.metrics.ignored_questions(), 1);
    }

    #[tokio::test]
    async fn tcp_clients_race_tcp_probes() {
        let upstream = spawn_tcp_upstream(Duration::from_millis(20), 0xE5).await;
        let ctx = ctx_with_public(&[upstream]);
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);

        QueryFsm::start(
            ReplyHandle::tcp(tx),
            encode_query(6, "stream.example.com", RecordType::A),
            ctx.clone(),
        );

        let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .expect("tcp reply");
        assert_eq!(payload[2] & 0x80, 0x80);
        assert_eq!(payload[11], 0xE5);
        assert_eq!(ctx.metrics.successes(upstream), 1);
    }

    #[tokio::test]
    async fn undecodable_client_queries_are_dropped_silently() {
        let ctx = ctx_with_public(&[]);
        let (handle, client) = udp_client().await;

        QueryFsm::start(handle, vec![0xDE, 0xAD], ctx.clone());

        assert!(recv_reply(&client, Duration::from_millis(300)).await.is_none());
        assert_eq!(ctx.metrics.no_upstreams_available(), 0);
        assert_eq!(ctx.metrics.upstreams_failed(), 0);
    }

    #[tokio::test]
    async fn questionless_queries_get_servfail() {
        // a configured pool does not matter: with no question to route by,
        // the router has no upstreams to offer
        let ctx = ctx_with_public(&["192.0.2.1:53".parse().unwrap()]);
        let (handle, client) = udp_client().await;

        // valid header, qdcount 0
        let raw = vec![0, 9, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        QueryFsm::start(handle, raw, ctx.clone());

        let reply = recv_reply(&client, Duration::from_secs(1)).await.expect("servfail");
        let msg = wire::decode(&reply).unwrap();
        assert_eq!(msg.header.id, 0x0009);
        assert_eq!(msg.header.rcode(), Rcode::ServFail);
        assert!(msg.questions.is_empty());
        assert_eq!(ctx.metrics.no_upstreams_available(), 1);
    }
}
