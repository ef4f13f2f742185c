//! 🌲 Topology: which forests exist, and which host to call for each one.
//!
//! A database is split into forests. Each forest lives on a host, sometimes
//! with a separate request host, an alternate (failover) host, or an open
//! replica. [`Topology::discover`] asks the server for the forest list once,
//! picks a preferred host per forest, and builds exactly one [`HostClient`]
//! per distinct host. The caller's own host reuses the caller's client.
//!
//! The map is a snapshot. Forests that move mid-job are the next job's problem.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info};

use crate::clients::HostClient;
use crate::error::{Error, Result};
use crate::services::internal;

/// 🌳 One forest as the server describes it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForestInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "updates_allowed_flag")]
    pub updates_allowed: bool,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub request_host: String,
    #[serde(default)]
    pub alternate_host: String,
    #[serde(default)]
    pub open_replica_host: String,
}

/// 🔓 The server says `"all"` (or a bool, depending on its mood). Anything else means read-only-ish.
fn updates_allowed_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Bool(b) => b,
        serde_json::Value::String(s) => s.eq_ignore_ascii_case("all") || s.eq_ignore_ascii_case("true"),
        _ => false,
    })
}

impl ForestInfo {
    /// 🎯 The host to send this forest's traffic to.
    ///
    /// Precedence: request host, then alternate, then open replica, then host.
    /// Empty strings do not count.
    pub fn preferred_host(&self) -> &str {
        [
            &self.request_host,
            &self.alternate_host,
            &self.open_replica_host,
            &self.host,
        ]
        .into_iter()
        .find(|h| !h.is_empty())
        .map(String::as_str)
        .unwrap_or_default()
    }
}

/// 🎛️ How workers get spread over the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Spread {
    /// 🌳 Round-robin over forests (each worker gets its forest's preferred host).
    ByForest,
    /// 🖥️ Round-robin over distinct hosts.
    ByHost,
}

/// 🗺️ The forest map plus one client per distinct host.
#[derive(Debug)]
pub struct Topology {
    primary: Arc<HostClient>,
    forests: Vec<ForestInfo>,
    clients_by_host: BTreeMap<String, Arc<HostClient>>,
}

impl Topology {
    /// 🔭 Ask the server for the forest list and wire up a client per host.
    pub async fn discover(client: Arc<HostClient>) -> Result<Self> {
        let forests = internal::forest_info(&client, None).await?;
        info!(
            "🌲 discovered {} forest(s) for database '{}'",
            forests.len(),
            client.database().unwrap_or("<default>")
        );
        Self::from_forests(client, forests)
    }

    /// 🧱 Build a topology from a forest list you already have.
    pub fn from_forests(client: Arc<HostClient>, forests: Vec<ForestInfo>) -> Result<Self> {
        let mut clients_by_host: BTreeMap<String, Arc<HostClient>> = BTreeMap::new();
        for forest in &forests {
            let host = forest.preferred_host();
            if host.is_empty() {
                return Err(Error::Topology(format!(
                    "forest '{}' ({}) has no host of any kind. A forest on no host is just a list of wishes.",
                    forest.name, forest.id
                )));
            }
            if clients_by_host.contains_key(host) {
                continue;
            }
            let host_client = if host == client.host() {
                Arc::clone(&client)
            } else {
                debug!("📡 new client for host '{}'", host);
                Arc::new(client.for_host(host)?)
            };
            clients_by_host.insert(host.to_string(), host_client);
        }
        Ok(Self {
            primary: client,
            forests,
            clients_by_host,
        })
    }

    pub fn forests(&self) -> &[ForestInfo] {
        &self.forests
    }

    /// 🖥️ Distinct hosts, sorted.
    pub fn hosts(&self) -> Vec<&str> {
        self.clients_by_host.keys().map(String::as_str).collect()
    }

    pub fn client_for(&self, host: &str) -> Option<&Arc<HostClient>> {
        self.clients_by_host.get(host)
    }

    /// 🎯 The client for a forest's preferred host.
    pub fn client_for_forest(&self, forest: &ForestInfo) -> Result<Arc<HostClient>> {
        self.client_for(forest.preferred_host())
            .cloned()
            .ok_or_else(|| {
                Error::Topology(format!(
                    "no client for host '{}' of forest '{}'",
                    forest.preferred_host(),
                    forest.name
                ))
            })
    }

    /// 🏠 The client the topology was discovered through.
    pub fn primary(&self) -> &Arc<HostClient> {
        &self.primary
    }

    /// 🎡 One client per worker, round-robin over forests or hosts.
    ///
    /// With no forests at all every worker falls back to the primary client.
    pub(crate) fn assign(&self, workers: usize, spread: Spread) -> Result<Vec<Arc<HostClient>>> {
        let pool: Vec<Arc<HostClient>> = match spread {
            Spread::ByForest => self
                .forests
                .iter()
                .map(|f| self.client_for_forest(f))
                .collect::<Result<_>>()?,
            Spread::ByHost => self.clients_by_host.values().cloned().collect(),
        };
        if pool.is_empty() {
            return Ok(vec![Arc::clone(&self.primary); workers]);
        }
        Ok((0..workers).map(|i| Arc::clone(&pool[i % pool.len()])).collect())
    }
}
