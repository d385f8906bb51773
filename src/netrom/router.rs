//! The NET/ROM routing table.
//!
//! Built up from overheard NODES broadcasts: every sender becomes a
//! neighbor with a direct route, and each record it advertises becomes a
//! candidate route through it. Route quality is the advertised quality
//! scaled by the neighbor quality; obsolescence decays once per prune
//! cycle until a fresh broadcast resets it.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::config::NetworkConfig;
use crate::netrom::{NetRomNodes, NodeDestination};
use crate::AX25Call;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub call: AX25Call,
    /// Device port the neighbor was heard on.
    pub port: u16,
    pub quality: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub dest: AX25Call,
    pub next_hop: AX25Call,
    pub quality: u8,
    pub obsolescence: i32,
}

#[derive(Debug, Clone)]
pub struct Destination {
    pub node_call: AX25Call,
    pub node_alias: String,
    /// Routes keyed by the neighbor they go through.
    routes: HashMap<AX25Call, Route>,
}

impl Destination {
    fn new(node_call: AX25Call, node_alias: String) -> Self {
        Self {
            node_call,
            node_alias,
            routes: HashMap::new(),
        }
    }

    /// Best quality first.
    pub fn sorted_routes(&self) -> Vec<&Route> {
        let mut routes: Vec<&Route> = self.routes.values().collect();
        routes.sort_by(|a, b| b.quality.cmp(&a.quality));
        routes
    }
}

#[derive(Debug)]
pub struct RoutingTable {
    node_alias: String,
    pub our_calls: Vec<AX25Call>,
    neighbors: HashMap<AX25Call, Neighbor>,
    destinations: HashMap<AX25Call, Destination>,
    default_obs: i32,
    default_quality: u8,
    min_quality: u8,
    min_obs: i32,
}

impl RoutingTable {
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            node_alias: config.node_alias.clone(),
            our_calls: Vec::new(),
            neighbors: HashMap::new(),
            destinations: HashMap::new(),
            default_obs: config.default_obs,
            default_quality: config.default_quality,
            min_quality: config.min_quality,
            min_obs: config.min_obs,
        }
    }

    pub fn neighbor(&self, call: &AX25Call) -> Option<&Neighbor> {
        self.neighbors.get(call)
    }

    pub fn destination(&self, call: &AX25Call) -> Option<&Destination> {
        self.destinations.get(call)
    }

    /// Candidate next hops for `dest` with the port each is heard on,
    /// best quality first. An unknown destination that happens to be a
    /// direct neighbor gets that single hop.
    pub fn route(&self, dest: &AX25Call) -> Vec<(AX25Call, u16)> {
        let with_port = |call: &AX25Call| self.neighbors.get(call).map(|n| (n.call, n.port));
        match self.destinations.get(dest) {
            Some(destination) => destination
                .sorted_routes()
                .iter()
                .filter_map(|r| with_port(&r.next_hop))
                .collect(),
            None => with_port(dest).into_iter().collect(),
        }
    }

    /// Fold one overheard NODES broadcast into the table.
    pub fn update_routes(&mut self, heard_from: &AX25Call, heard_on_port: u16, nodes: &NetRomNodes) {
        let neighbor_quality = self
            .neighbors
            .entry(*heard_from)
            .or_insert(Neighbor {
                call: *heard_from,
                port: heard_on_port,
                quality: self.default_quality,
            })
            .quality;

        // whoever we heard is reachable directly
        let direct = self
            .destinations
            .entry(*heard_from)
            .or_insert_with(|| Destination::new(*heard_from, nodes.sending_alias.clone()));
        direct.routes.insert(
            *heard_from,
            Route {
                dest: *heard_from,
                next_hop: *heard_from,
                quality: self.default_quality,
                obsolescence: self.default_obs,
            },
        );

        for advertised in &nodes.destinations {
            let quality = if self.our_calls.contains(&advertised.best_neighbor) {
                // best path goes through us: a trivial loop
                0
            } else {
                // advertised quality scaled by the neighbor quality:
                // (q * nq + 128) / 256
                let product = u32::from(advertised.quality) * u32::from(neighbor_quality);
                ((product + 128) / 256).min(255) as u8
            };

            if quality <= self.min_quality {
                log::debug!(
                    "route to {} via {} below minimum quality ({})",
                    advertised.dest_node,
                    heard_from,
                    quality
                );
                continue;
            }

            let dest = self
                .destinations
                .entry(advertised.dest_node)
                .or_insert_with(|| {
                    Destination::new(advertised.dest_node, advertised.dest_alias.clone())
                });
            dest.routes.insert(
                *heard_from,
                Route {
                    dest: advertised.dest_node,
                    next_hop: *heard_from,
                    quality,
                    obsolescence: self.default_obs,
                },
            );
        }
    }

    /// Age every route; drop the ones nothing has refreshed.
    pub fn prune_routes(&mut self) {
        let mut dead_destinations = Vec::new();
        for (call, destination) in self.destinations.iter_mut() {
            destination.routes.retain(|neighbor, route| {
                route.obsolescence -= 1;
                if route.obsolescence <= 0 {
                    log::info!("dropping stale route to {call} via {neighbor}");
                    false
                } else {
                    true
                }
            });
            if destination.routes.is_empty() {
                dead_destinations.push(*call);
            }
        }
        for call in dead_destinations {
            log::info!("no routes left to {call}, forgetting it");
            self.destinations.remove(&call);
            self.neighbors.remove(&call);
        }
    }

    /// The advertisement we would broadcast right now: each destination's
    /// best route that is fresh enough to be worth repeating.
    pub fn get_nodes(&self) -> NetRomNodes {
        let mut destinations = Vec::new();
        for destination in self.destinations.values() {
            let best = destination
                .sorted_routes()
                .into_iter()
                .find(|route| route.obsolescence >= self.min_obs);
            match best {
                Some(route) => destinations.push(NodeDestination {
                    dest_node: destination.node_call,
                    dest_alias: destination.node_alias.clone(),
                    best_neighbor: route.next_hop,
                    quality: route.quality,
                }),
                None => log::debug!(
                    "not advertising {}, all routes below obsolescence threshold",
                    destination.node_call
                ),
            }
        }
        NetRomNodes {
            sending_alias: self.node_alias.clone(),
            destinations,
        }
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error("snapshot timestamp: {0}")]
    Timestamp(#[from] time::error::Format),
    #[error("snapshot call: {0}")]
    Call(#[from] crate::CallParseError),
}

/// On-disk form of the routing snapshot, `nodes.json`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodesSnapshot {
    node_alias: String,
    created_at: String,
    destinations: Vec<SnapshotDestination>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotDestination {
    node_call: String,
    node_alias: String,
    best_neighbor: String,
    quality: u8,
}

/// Persist the current advertisement. Callers snapshot under the routing
/// lock and write after dropping it; this function only sees the copy.
pub fn save_nodes(nodes: &NetRomNodes, path: &Path) -> Result<(), SnapshotError> {
    let snapshot = NodesSnapshot {
        node_alias: nodes.sending_alias.clone(),
        created_at: OffsetDateTime::now_utc().format(&Rfc3339)?,
        destinations: nodes
            .destinations
            .iter()
            .map(|d| SnapshotDestination {
                node_call: d.dest_node.to_string(),
                node_alias: d.dest_alias.clone(),
                best_neighbor: d.best_neighbor.to_string(),
                quality: d.quality,
            })
            .collect(),
    };
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, &snapshot)?;
    Ok(())
}

/// Load a previous snapshot. A missing file is an empty table with a
/// zero timestamp, not an error.
pub fn load_nodes(path: &Path) -> Result<(NetRomNodes, OffsetDateTime), SnapshotError> {
    if !path.exists() {
        return Ok((
            NetRomNodes {
                sending_alias: String::new(),
                destinations: Vec::new(),
            },
            OffsetDateTime::UNIX_EPOCH,
        ));
    }
    let snapshot: NodesSnapshot = serde_json::from_reader(BufReader::new(File::open(path)?))?;
    let created_at = OffsetDateTime::parse(&snapshot.created_at, &Rfc3339)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH);
    let mut destinations = Vec::new();
    for d in snapshot.destinations {
        destinations.push(NodeDestination {
            dest_node: AX25Call::parse(&d.node_call)?,
            dest_alias: d.node_alias,
            best_neighbor: AX25Call::parse(&d.best_neighbor)?,
            quality: d.quality,
        });
    }
    Ok((
        NetRomNodes {
            sending_alias: snapshot.node_alias,
            destinations,
        },
        created_at,
    ))
}
