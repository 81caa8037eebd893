//! Question -> upstream-pool routing.
//!
//! Three pools: service discovery (`*.mesos`), the authoritative-zone servers
//! (`*.zk`, `*.spartan`, and any name the zone cache claims), and the public
//! resolvers for everything else. Pools keep their configured order and any
//! duplicate entries; duplicates weight the per-query sampling downstream.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tracing::debug;

use crate::config::Config;
use crate::dns::wire::Question;
use crate::metrics::Metrics;
use crate::zones::ZoneCache;

pub const DNS_PORT: u16 = 53;

pub struct Router {
    mesos: Vec<SocketAddr>,
    zone: Vec<SocketAddr>,
    public: Vec<SocketAddr>,
    zones: ZoneCache,
    metrics: Arc<Metrics>,
}

impl Router {
    pub fn new(
        config: &Config,
        zone_servers: Vec<SocketAddr>,
        zones: ZoneCache,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            mesos: normalize_all(&config.forward.mesos_resolvers),
            zone: zone_servers,
            public: normalize_all(&config.forward.resolvers),
            zones,
            metrics,
        }
    }

    /// Map a request's questions to an ordered upstream list. Only the first
    /// question routes; the rest are counted and dropped. An empty result is
    /// a valid return.
    pub fn upstreams_from_questions(&self, questions: &[Question]) -> Vec<SocketAddr> {
        if questions.len() > 1 {
            self.metrics.add_ignored_questions(questions.len() as u64 - 1);
        }
        let Some(question) = questions.first() else {
            return Vec::new();
        };

        let name = question.name.to_lowercase();
        let name = name.trim_end_matches('.');
        let tld = name.rsplit('.').next().unwrap_or("");

        let pool = match tld {
            "mesos" => &self.mesos,
            "zk" | "spartan" => &self.zone,
            _ if self.zones.get_authority(name) => &self.zone,
            _ => &self.public,
        };
        pool.clone()
    }
}

/// Normalize one configured resolver entry: an IPv4 address with an optional
/// port, defaulting to 53. Anything that does not parse is dropped.
pub fn normalize(entry: &str) -> Option<SocketAddr> {
    if let Ok(addr) = entry.parse::<SocketAddr>() {
        return addr.is_ipv4().then_some(addr);
    }
    match entry.parse::<IpAddr>() {
        Ok(ip @ IpAddr::V4(_)) => Some(SocketAddr::new(ip, DNS_PORT)),
        _ => None,
    }
}

fn normalize_all(entries: &[String]) -> Vec<SocketAddr> {
    entries
        .iter()
        .filter_map(|entry| {
            let addr = normalize(entry);
            if addr.is_none() {
                debug!("dropping unparseable resolver entry '{}'", entry);
            }
            addr
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForwardConfig;
    use crate::dns::types::{DnsClass, RecordType};

    fn question(name: &str) -> Question {
        Question {
            name: name.to_string(),
            qtype: RecordType::A,
            qclass: DnsClass::In,
        }
    }

    fn router(mesos: &[&str], zone: &[&str], public: &[&str], apexes: &[&str]) -> (Router, Arc<Metrics>) {
        let config = Config {
            forward: ForwardConfig {
                mesos_resolvers: mesos.iter().map(|s| s.to_string()).collect(),
                resolvers: public.iter().map(|s| s.to_string()).collect(),
                zone_servers_file: None,
            },
            ..Config::default()
        };
        let zone_servers = zone.iter().map(|s| s.parse().unwrap()).collect();
        let zones = ZoneCache::new(&apexes.iter().map(|s| s.to_string()).collect::<Vec<_>>());
        let metrics = Arc::new(Metrics::new());
        (
            Router::new(&config, zone_servers, zones, metrics.clone()),
            metrics,
        )
    }

    #[test]
    fn mesos_suffix_routes_to_discovery_pool() {
        let (router, _) = router(&["10.2.0.1:61053"], &["10.1.0.1:53"], &["8.8.8.8"], &[]);
        let upstreams = router.upstreams_from_questions(&[question("leader.mesos")]);
        assert_eq!(upstreams, vec!["10.2.0.1:61053".parse().unwrap()]);
    }

    #[test]
    fn zk_and_spartan_route_to_zone_pool() {
        let (router, _) = router(&[], &["10.1.0.1:53", "10.1.0.2:53"], &["8.8.8.8"], &[]);
        let zone: Vec<SocketAddr> = vec![
            "10.1.0.1:53".parse().unwrap(),
            "10.1.0.2:53".parse().unwrap(),
        ];
        assert_eq!(router.upstreams_from_questions(&[question("node-1.zk")]), zone);
        assert_eq!(router.upstreams_from_questions(&[question("ready.SPARTAN")]), zone);
    }

    #[test]
    fn authoritative_names_route_to_zone_pool() {
        let (router, _) = router(&[], &["10.1.0.1:53"], &["8.8.8.8"], &["dc1.directory"]);
        assert_eq!(
            router.upstreams_from_questions(&[question("web.dc1.directory")]),
            vec!["10.1.0.1:53".parse::<SocketAddr>().unwrap()]
        );
    }

    #[test]
    fn other_names_route_to_public_pool_with_duplicates() {
        let (router, _) = router(&[], &["10.1.0.1:53"], &["8.8.8.8", "4.2.2.1", "8.8.8.8"], &[]);
        let upstreams = router.upstreams_from_questions(&[question("example.com")]);
        assert_eq!(
            upstreams,
            vec![
                "8.8.8.8:53".parse().unwrap(),
                "4.2.2.1:53".parse().unwrap(),
                "8.8.8.8:53".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn extra_questions_are_counted_and_dropped() {
        let (router, metrics) = router(&["10.2.0.1:61053"], &["10.1.0.1:53"], &["8.8.8.8"], &[]);
        let upstreams = router.upstreams_from_questions(&[
            question("foo.mesos"),
            question("bar.zk"),
            question("baz"),
        ]);
        // routed by the first question only
        assert_eq!(upstreams, vec!["10.2.0.1:61053".parse().unwrap()]);
        assert_eq!(metrics.ignored_questions(), 2);
    }

    #[test]
    fn no_questions_yields_no_upstreams() {
        let (router, metrics) = router(&[], &[], &["8.8.8.8"], &[]);
        assert!(router.upstreams_from_questions(&[]).is_empty());
        assert_eq!(metrics.ignored_questions(), 0);
    }

    #[test]
    fn empty_pool_is_a_valid_result() {
        let (router, _) = router(&[], &["10.1.0.1:53"], &["8.8.8.8"], &[]);
        assert!(router.upstreams_from_questions(&[question("leader.mesos")]).is_empty());
    }

    #[test]
    fn normalize_defaults_the_port() {
        assert_eq!(normalize("8.8.8.8"), Some("8.8.8.8:53".parse().unwrap()));
        assert_eq!(normalize("1.2.3.4:5353"), Some("1.2.3.4:5353".parse().unwrap()));
        assert_eq!(normalize("not-an-ip"), None);
        assert_eq!(normalize("fd01::1"), None);
    }

    #[test]
    fn normalize_is_idempotent() {
        for entry in ["8.8.8.8", "1.2.3.4:5353"] {
            let once = normalize(entry).unwrap();
            let twice = normalize(&once.to_string()).unwrap();
            assert_eq!(once, twice);
        }
    }
}
