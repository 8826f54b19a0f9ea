//! Choosing which configured server receives a release
//!
//! Servers are written as `[user@]host[:port][=weight]`, e.g. `deploy@web1:2222=3`. Selectors
//! are owned by the caller, so a long-lived caller keeps rotating across invocations.

use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::SshSession;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    pub session: SshSession,
    pub weight: u32,
}

impl ServerSpec {
    pub fn parse(spec: &str) -> Result<Self, common::Error> {
        let re = regex::Regex::new(
            r"^(?:(?P<user>[^@=]+)@)?(?P<host>\[[^\]]+\]|[^:@=\[\]]+)(?::(?P<port>\d+))?(?:=(?P<weight>\d+))?$",
        )
        .map_err(|err| common::Error::Config(format!("server pattern: {}", err)))?;
        let captures = re.captures(spec.trim()).ok_or_else(|| {
            common::Error::Config(format!(
                "invalid server {:?}, expected [user@]host[:port][=weight]",
                spec
            ))
        })?;
        let number = |name: &str| -> Result<Option<u32>, common::Error> {
            captures
                .name(name)
                .map(|m| {
                    m.as_str().parse::<u32>().map_err(|err| {
                        common::Error::Config(format!("invalid {} in {:?}: {}", name, spec, err))
                    })
                })
                .transpose()
        };
        let port = number("port")?
            .map(|port| {
                u16::try_from(port).map_err(|_| {
                    common::Error::Config(format!("port out of range in {:?}", spec))
                })
            })
            .transpose()?;
        Ok(Self {
            session: SshSession {
                user: captures.name("user").map(|m| m.as_str().to_string()),
                host: captures["host"].to_string(),
                port,
            },
            weight: number("weight")?.unwrap_or(1),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionStrategy {
    #[default]
    RoundRobin,
    Weighted,
}

impl std::str::FromStr for SelectionStrategy {
    type Err = common::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_start_matches(':').to_ascii_lowercase().as_str() {
            "round-robin" | "round_robin" | "roundrobin" => Ok(SelectionStrategy::RoundRobin),
            "weighted" => Ok(SelectionStrategy::Weighted),
            _ => Err(common::Error::Config(format!(
                "invalid server selection {:?}, expected round-robin or weighted",
                s
            ))),
        }
    }
}

pub trait ServerSelector: Send + Sync {
    fn select<'a>(&self, servers: &'a [ServerSpec]) -> Option<&'a ServerSpec>;
}

/// Cycles through the servers in order.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl ServerSelector for RoundRobin {
    fn select<'a>(&self, servers: &'a [ServerSpec]) -> Option<&'a ServerSpec> {
        if servers.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % servers.len();
        servers.get(index)
    }
}

/// Picks a server at random, proportionally to its weight. Zero-weight servers are never picked.
#[derive(Debug, Default)]
pub struct Weighted;

impl Weighted {
    fn pick(servers: &[ServerSpec], mut ticket: u64) -> Option<&ServerSpec> {
        for server in servers {
            let weight = u64::from(server.weight);
            if ticket < weight {
                return Some(server);
            }
            ticket -= weight;
        }
        None
    }
}

impl ServerSelector for Weighted {
    fn select<'a>(&self, servers: &'a [ServerSpec]) -> Option<&'a ServerSpec> {
        let total: u64 = servers.iter().map(|server| u64::from(server.weight)).sum();
        if total == 0 {
            return None;
        }
        let ticket = rand::thread_rng().gen_range(0..total);
        Self::pick(servers, ticket)
    }
}

pub fn selector(strategy: SelectionStrategy) -> Box<dyn ServerSelector> {
    match strategy {
        SelectionStrategy::RoundRobin => Box::<RoundRobin>::default(),
        SelectionStrategy::Weighted => Box::new(Weighted),
    }
}
