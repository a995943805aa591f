//! Immutable snapshots of the cluster topology.
//!
//! A [`Configuration`] is decoded from one JSON document of the bucket's streaming
//! configuration feed. It is never changed after construction: every topology update
//! produces a new snapshot which replaces the previous one wholesale.
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::error::ErrorKind;
use crate::{Result, VbkvError};

/// the node locator whose partition map this client knows how to route with
pub const VBUCKET_LOCATOR: &str = "vbucket";

/// One cluster node as described by the configuration feed.
///
/// Two descriptors are equal when their direct address, couch address and status
/// match. The version and the admin/proxy addresses do not take part in change
/// detection.
#[derive(Debug, Clone, Eq)]
pub struct NodeDescriptor {
    /// `host:port` of the REST admin interface
    pub admin_address: String,
    /// `host:port` of the proxy (moxi) port
    pub proxy_address: String,
    /// `host:port` of the binary protocol port
    pub direct_address: String,
    /// base URL of the view API, absent on older servers
    pub couch_address: Option<String>,
    /// health as reported by the cluster, e.g. `healthy`
    pub status: String,
    /// server version
    pub version: String,
}

impl PartialEq for NodeDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.direct_address == other.direct_address
            && self.couch_address == other.couch_address
            && self.status == other.status
    }
}

impl NodeDescriptor {
    /// the admin host and port, if the admin address carries a port
    pub fn admin_endpoint(&self) -> Option<(String, u16)> {
        let (host, port) = self.admin_address.rsplit_once(':')?;
        let port = port.parse().ok()?;
        Some((host.to_string(), port))
    }
}

/// One partition ("vbucket") of the keyspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// index of the owning node in [`Configuration::nodes`], `None` while unassigned
    pub owner: Option<usize>,
    /// indices of the replica nodes, `None` for unassigned replica slots
    pub replicas: Vec<Option<usize>>,
}

impl Partition {
    fn from_row(row: &[i32]) -> Self {
        let index = |i: &i32| if *i < 0 { None } else { Some(*i as usize) };
        Partition {
            owner: row.first().and_then(index),
            replicas: row.iter().skip(1).map(index).collect(),
        }
    }
}

/// Where a key is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// the partition id, written into the request header
    pub partition: u16,
    /// the index of the owning node in [`Configuration::nodes`]
    pub node: usize,
}

/// Why a key could not be routed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    /// the bucket does not use the partition map locator
    #[error("node locator '{0}' is not supported")]
    UnsupportedLocator(String),
    /// the partition has no owner in this snapshot
    #[error("partition {0} has no owner")]
    NoOwner(u16),
}

impl RoutingError {
    /// the error kind an operation is failed with when it cannot be routed
    pub fn kind(&self) -> ErrorKind {
        match self {
            RoutingError::UnsupportedLocator(_) => ErrorKind::NotSupported,
            RoutingError::NoOwner(_) => ErrorKind::TemporaryFail,
        }
    }
}

/// A snapshot of the cluster topology for one bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    /// name of the bucket, also the SASL identity
    pub bucket_name: String,
    /// `membase`, `memcached`, ...
    pub bucket_type: String,
    /// SASL password of the bucket, `None` when the feed omits it
    pub sasl_password: Option<String>,
    /// routing strategy identifier
    pub node_locator: String,
    /// number of replicas per partition
    pub num_replicas: Option<u32>,
    /// hash algorithm advertised by the cluster, informational only
    pub hash_algorithm: Option<String>,
    /// partition id -> owner, the length is a power of two
    pub partition_map: Vec<Partition>,
    /// where partitions are moving to, only present during a rebalance
    pub partition_map_forward: Option<Vec<Partition>>,
    /// nodes sorted by direct address, never empty
    pub nodes: Vec<NodeDescriptor>,
}

impl Configuration {
    /// Builds a snapshot from one decoded feed document.
    ///
    /// Returns `Ok(None)` for top-level values that are not objects, those are skipped
    /// silently.
    ///
    /// # Errors
    /// [`VbkvError::Json`] if a required field is missing or has the wrong type,
    /// [`VbkvError::InvalidConfiguration`] if the node list is empty or the partition map
    /// is not a power of two in size
    pub fn from_json(json: Value) -> Result<Option<Configuration>> {
        if !json.is_object() {
            return Ok(None);
        }
        let doc: BucketDocument = serde_json::from_value(json)?;

        if doc.nodes.is_empty() {
            return Err(VbkvError::InvalidConfiguration("empty list of nodes".to_string()));
        }
        let mut nodes: Vec<NodeDescriptor> = doc.nodes.into_iter().map(NodeDescriptor::from).collect();
        nodes.sort_by(|a, b| a.direct_address.cmp(&b.direct_address));

        let mut config = Configuration {
            bucket_name: doc.name,
            bucket_type: doc.bucket_type,
            sasl_password: doc.sasl_password,
            node_locator: doc.node_locator,
            num_replicas: None,
            hash_algorithm: None,
            partition_map: Vec::new(),
            partition_map_forward: None,
            nodes,
        };

        if config.node_locator == VBUCKET_LOCATOR {
            let server_map = doc.server_map.ok_or_else(|| {
                VbkvError::InvalidConfiguration("vbucket locator without vBucketServerMap".to_string())
            })?;
            let map = to_partitions(&server_map.vbucket_map);
            if !map.len().is_power_of_two() || map.len() > u16::MAX as usize + 1 {
                return Err(VbkvError::InvalidConfiguration(format!(
                    "partition map size {} is not a power of two",
                    map.len()
                )));
            }
            let forward = server_map.vbucket_map_forward.as_deref().map(to_partitions);
            if let Some(forward) = &forward {
                if forward.len() != map.len() {
                    return Err(VbkvError::InvalidConfiguration(format!(
                        "forward map size {} does not match partition map size {}",
                        forward.len(),
                        map.len()
                    )));
                }
            }
            config.num_replicas = Some(server_map.num_replicas);
            config.hash_algorithm = Some(server_map.hash_algorithm);
            config.partition_map = map;
            config.partition_map_forward = forward;
        }

        Ok(Some(config))
    }

    /// the partition `key` hashes to: `CRC32(key) & (partitions - 1)`
    pub fn partition_of(&self, key: &[u8]) -> std::result::Result<u16, RoutingError> {
        if self.partition_map.is_empty() {
            return Err(RoutingError::UnsupportedLocator(self.node_locator.clone()));
        }
        let mask = (self.partition_map.len() - 1) as u32;
        Ok((crc32fast::hash(key) & mask) as u16)
    }

    /// Routes `key` to its partition and the node that currently owns it.
    pub fn locate(&self, key: &[u8]) -> std::result::Result<Route, RoutingError> {
        let partition = self.partition_of(key)?;
        let node = self.owner(&self.partition_map, partition)?;
        Ok(Route { partition, node })
    }

    /// Like [`locate`](Configuration::locate), but prefers the forward map when the
    /// snapshot was taken mid-rebalance. Used when replaying redirected requests.
    pub fn locate_forward(&self, key: &[u8]) -> std::result::Result<Route, RoutingError> {
        let partition = self.partition_of(key)?;
        let node = match &self.partition_map_forward {
            Some(forward) => self.owner(forward, partition)?,
            None => self.owner(&self.partition_map, partition)?,
        };
        Ok(Route { partition, node })
    }

    fn owner(&self, map: &[Partition], partition: u16) -> std::result::Result<usize, RoutingError> {
        map.get(partition as usize)
            .and_then(|p| p.owner)
            .filter(|owner| *owner < self.nodes.len())
            .ok_or(RoutingError::NoOwner(partition))
    }
}

fn to_partitions(rows: &[Vec<i32>]) -> Vec<Partition> {
    rows.iter().map(|row| Partition::from_row(row)).collect()
}

/// replaces the trailing `:port` of an admin `host:port` with `port`
fn with_port(admin: &str, port: u16) -> String {
    match admin.rsplit_once(':') {
        Some((host, old)) if !old.is_empty() && old.bytes().all(|b| b.is_ascii_digit()) => {
            format!("{}:{}", host, port)
        }
        _ => admin.to_string(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BucketDocument {
    name: String,
    bucket_type: String,
    #[serde(default)]
    sasl_password: Option<String>,
    node_locator: String,
    #[serde(rename = "vBucketServerMap", default)]
    server_map: Option<ServerMapDocument>,
    nodes: Vec<NodeDocument>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMapDocument {
    num_replicas: u32,
    hash_algorithm: String,
    #[serde(rename = "vBucketMap")]
    vbucket_map: Vec<Vec<i32>>,
    #[serde(rename = "vBucketMapForward", default)]
    vbucket_map_forward: Option<Vec<Vec<i32>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeDocument {
    hostname: String,
    ports: PortsDocument,
    #[serde(default)]
    couch_api_base: Option<String>,
    status: String,
    #[serde(default)]
    version: String,
}

#[derive(Debug, Deserialize)]
struct PortsDocument {
    proxy: u16,
    direct: u16,
}

impl From<NodeDocument> for NodeDescriptor {
    fn from(node: NodeDocument) -> Self {
        NodeDescriptor {
            proxy_address: with_port(&node.hostname, node.ports.proxy),
            direct_address: with_port(&node.hostname, node.ports.direct),
            admin_address: node.hostname,
            couch_address: node.couch_api_base,
            status: node.status,
            version: node.version,
        }
    }
}
