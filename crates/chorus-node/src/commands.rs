//! Operator commands read from standard input.

use std::path::PathBuf;
use std::str::FromStr;

use chorus_protocols::{QueryType, UNLIMITED_HOPS};

use crate::error::NodeError;

pub const REGISTRY_HELP: &str = "\
listpeers                          list registered peers
buildoverlay <min> <max>           build an overlay over the registered peers
exportoverlay <path>               write the overlay as CSV
importoverlay <path>               load an overlay and map it onto the registered peers
connectpeers                       send every peer its connection list
checkpeers                         ask every peer for its neighbours and compare
flood <metric> <hop-limit>         start a bounded flood query
randomwalk <metric> <hop-limit>    start a random walk query
gossiptype0 <metric> <hop-limit>   start a distance-table gossip query
gossiptype1 <metric> <hop-limit>   start a location-table gossip query
print-results                      print collected query results as JSON
export-results <path>              write collected query results as CSV
clear-results                      forget collected query results
shutdown                           stop every peer and the registry
help                               show this text

A hop limit of -1 means unlimited.";

pub const PEER_HELP: &str = "\
neighbors       list overlay neighbours
devices         list attached devices
gossip-tables   print the distance and location tables
help            show this text";

/// A registry command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryCommand {
    ListPeers,
    BuildOverlay { min_degree: usize, max_degree: usize },
    ExportOverlay(PathBuf),
    ImportOverlay(PathBuf),
    ConnectPeers,
    CheckPeers,
    Query {
        query_type: QueryType,
        metric: String,
        hop_limit: i32,
    },
    PrintResults,
    ExportResults(PathBuf),
    ClearResults,
    Shutdown,
    Help,
}

impl FromStr for RegistryCommand {
    type Err = NodeError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let command = match words.as_slice() {
            ["listpeers"] => RegistryCommand::ListPeers,
            ["buildoverlay", min, max] => RegistryCommand::BuildOverlay {
                min_degree: number(min)?,
                max_degree: number(max)?,
            },
            ["exportoverlay", path] => RegistryCommand::ExportOverlay(PathBuf::from(path)),
            ["importoverlay", path] => RegistryCommand::ImportOverlay(PathBuf::from(path)),
            ["connectpeers"] => RegistryCommand::ConnectPeers,
            ["checkpeers"] => RegistryCommand::CheckPeers,
            [kind @ ("flood" | "randomwalk" | "gossiptype0" | "gossiptype1"), metric, hops] => {
                let query_type = match *kind {
                    "flood" => QueryType::Flood,
                    "randomwalk" => QueryType::RandomWalk,
                    "gossiptype0" => QueryType::GossipDistance,
                    _ => QueryType::GossipLocation,
                };
                RegistryCommand::Query {
                    query_type,
                    metric: metric.to_string(),
                    hop_limit: hop_limit(hops)?,
                }
            }
            ["print-results"] => RegistryCommand::PrintResults,
            ["export-results", path] => RegistryCommand::ExportResults(PathBuf::from(path)),
            ["clear-results"] => RegistryCommand::ClearResults,
            ["shutdown"] => RegistryCommand::Shutdown,
            ["help"] => RegistryCommand::Help,
            [] => return Err(NodeError::Command("empty command".into())),
            _ => {
                return Err(NodeError::Command(format!(
                    "unrecognized command '{}', try 'help'",
                    line.trim()
                )))
            }
        };
        Ok(command)
    }
}

/// A peer command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerCommand {
    Neighbors,
    Devices,
    GossipTables,
    Help,
}

impl FromStr for PeerCommand {
    type Err = NodeError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        match line.trim() {
            "neighbors" => Ok(PeerCommand::Neighbors),
            "devices" => Ok(PeerCommand::Devices),
            "gossip-tables" => Ok(PeerCommand::GossipTables),
            "help" => Ok(PeerCommand::Help),
            other => Err(NodeError::Command(format!(
                "unrecognized command '{}', try 'help'",
                other
            ))),
        }
    }
}

fn number(raw: &str) -> Result<usize, NodeError> {
    raw.parse()
        .map_err(|_| NodeError::Command(format!("expected a number, got '{}'", raw)))
}

fn hop_limit(raw: &str) -> Result<i32, NodeError> {
    match raw.parse::<i32>() {
        Ok(n) if n == UNLIMITED_HOPS || n > 0 => Ok(n),
        _ => Err(NodeError::Command(format!(
            "hop limit must be positive or {}, got '{}'",
            UNLIMITED_HOPS, raw
        ))),
    }
}
