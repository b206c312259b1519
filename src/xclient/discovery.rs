//! Server discovery.
//!
//! [`Discovery`] is what [`XClient`](super::XClient) asks for an address
//! before each dial. [`MultiServerDiscovery`] serves a fixed list held in
//! memory; backends that talk to a registry implement the same trait.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{RpcError, Result};

/// How one server is picked from the list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SelectMode {
    /// Uniformly at random.
    #[default]
    Random,
    /// In turn, from a random starting point.
    RoundRobin,
}

/// Source of server addresses (`protocol@addr`).
pub trait Discovery: Send + Sync {
    /// Reload the list from its source.
    fn refresh(&self) -> Result<()>;

    /// Replace the list.
    fn update(&self, servers: Vec<String>) -> Result<()>;

    /// Pick one server.
    fn get(&self, mode: SelectMode) -> Result<String>;

    /// Every known server.
    fn get_all(&self) -> Result<Vec<String>>;
}

struct State {
    servers: Vec<String>,
    /// Next round-robin position, not yet reduced modulo the list length.
    index: usize,
    rng: StdRng,
}

/// Discovery over a list of servers supplied by the caller.
pub struct MultiServerDiscovery {
    state: Mutex<State>,
}

impl MultiServerDiscovery {
    /// Discovery over `servers`.
    pub fn new(servers: Vec<String>) -> Self {
        let mut rng = StdRng::from_os_rng();
        let index = rng.random_range(0..i32::MAX as usize);
        Self {
            state: Mutex::new(State { servers, index, rng }),
        }
    }
}

impl Discovery for MultiServerDiscovery {
    /// Nothing to reload; the list only changes through `update`.
    fn refresh(&self) -> Result<()> {
        Ok(())
    }

    fn update(&self, servers: Vec<String>) -> Result<()> {
        tracing::debug!(count = servers.len(), "rpc discovery: servers updated");
        self.state.lock().servers = servers;
        Ok(())
    }

    fn get(&self, mode: SelectMode) -> Result<String> {
        let mut state = self.state.lock();
        let n = state.servers.len();
        if n == 0 {
            return Err(RpcError::NoServers);
        }
        let picked = match mode {
            SelectMode::Random => state.rng.random_range(0..n),
            SelectMode::RoundRobin => {
                let picked = state.index % n;
                state.index = (picked + 1) % n;
                picked
            }
        };
        Ok(state.servers[picked].clone())
    }

    fn get_all(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().servers.clone())
    }
}

impl std::fmt::Debug for MultiServerDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiServerDiscovery")
            .field("servers", &self.state.lock().servers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn servers(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("tcp@127.0.0.1:{}", 9000 + i)).collect()
    }

    #[test]
    fn test_empty_list_has_no_servers() {
        let d = MultiServerDiscovery::new(Vec::new());
        assert!(matches!(d.get(SelectMode::Random), Err(RpcError::NoServers)));
        assert!(matches!(d.get(SelectMode::RoundRobin), Err(RpcError::NoServers)));
        assert!(d.get_all().unwrap().is_empty());
    }

    #[test]
    fn test_round_robin_visits_every_server_in_turn() {
        let d = MultiServerDiscovery::new(servers(3));
        let picks: Vec<_> = (0..6).map(|_| d.get(SelectMode::RoundRobin).unwrap()).collect();

        let first_cycle: HashSet<_> = picks[..3].iter().collect();
        assert_eq!(first_cycle.len(), 3);
        assert_eq!(picks[..3], picks[3..]);
    }

    #[test]
    fn test_random_stays_in_list() {
        let list = servers(4);
        let d = MultiServerDiscovery::new(list.clone());
        for _ in 0..50 {
            assert!(list.contains(&d.get(SelectMode::Random).unwrap()));
        }
    }

    #[test]
    fn test_update_replaces_list() {
        let d = MultiServerDiscovery::new(servers(2));
        d.refresh().unwrap();
        d.update(vec!["unix@/tmp/only.sock".into()]).unwrap();
        assert_eq!(d.get(SelectMode::RoundRobin).unwrap(), "unix@/tmp/only.sock");
        assert_eq!(d.get_all().unwrap().len(), 1);
    }
}
