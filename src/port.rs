//! Addressing of output port values.
//!
//! A port of depth `d` holds a tree of nested lists `d` levels deep. Leaves
//! are addressed by an index tuple of at most `d` components; a shorter tuple
//! addresses a subtree.

use crate::error::{Error, Result};
use crate::model::{OutputPort, PortData, PortValue};
use std::fmt;

/// A port name plus an optional index into its value tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coordinate {
    pub name: String,
    pub index: Vec<usize>,
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.index.is_empty() {
            let parts: Vec<String> = self.index.iter().map(|i| i.to_string()).collect();
            write!(f, ":{}", parts.join(","))?;
        }
        Ok(())
    }
}

/// Parse `NAME[:I1,I2,...]`.
pub fn parse_coordinate(spec: &str) -> Result<Coordinate> {
    let malformed = || Error::MalformedCoordinate {
        spec: spec.to_string(),
    };
    let (name, rest) = spec.split_once(':').unwrap_or((spec, ""));
    if name.is_empty() {
        return Err(malformed());
    }
    let index = if rest.trim().is_empty() {
        Vec::new()
    } else {
        rest.split(',')
            .map(|part| part.trim().parse::<usize>().map_err(|_| malformed()))
            .collect::<Result<Vec<_>>>()?
    };
    Ok(Coordinate {
        name: name.to_string(),
        index,
    })
}

/// Walk `index` into the port's value tree and return the addressed node.
pub fn subtree<'a>(port: &'a OutputPort, index: &[usize]) -> Result<&'a PortData> {
    if index.len() > port.depth {
        return Err(Error::IndexTooDeep {
            port: port.name.clone(),
            index: index.to_vec(),
            depth: port.depth,
        });
    }
    let mut node = &port.data;
    for (level, &i) in index.iter().enumerate() {
        node = match node {
            PortData::List(items) => items.get(i).ok_or_else(|| Error::IndexOutOfRange {
                port: port.name.clone(),
                index: index[..=level].to_vec(),
                len: items.len(),
            })?,
            // A value sitting above the declared depth has no children.
            PortData::Value(_) => {
                return Err(Error::IndexOutOfRange {
                    port: port.name.clone(),
                    index: index[..=level].to_vec(),
                    len: 0,
                })
            }
        };
    }
    Ok(node)
}

/// Resolve `index` to a single value. Partial indices yield the first leaf of
/// the addressed subtree.
pub fn resolve<'a>(port: &'a OutputPort, index: &[usize]) -> Result<&'a PortValue> {
    let node = subtree(port, index)?;
    first_leaf(node).ok_or_else(|| {
        let mut at = index.to_vec();
        at.push(0);
        Error::IndexOutOfRange {
            port: port.name.clone(),
            index: at,
            len: 0,
        }
    })
}

fn first_leaf(node: &PortData) -> Option<&PortValue> {
    match node {
        PortData::Value(v) => Some(v),
        PortData::List(items) => items.iter().find_map(first_leaf),
    }
}

/// Every leaf index of the port, depth first.
pub fn index_space(port: &OutputPort) -> Vec<Vec<usize>> {
    fn walk(node: &PortData, prefix: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
        match node {
            PortData::Value(_) => out.push(prefix.clone()),
            PortData::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    prefix.push(i);
                    walk(item, prefix, out);
                    prefix.pop();
                }
            }
        }
    }
    let mut out = Vec::new();
    walk(&port.data, &mut Vec::new(), &mut out);
    out
}

/// Sum of payload sizes over every leaf of the port.
pub fn total_size(port: &OutputPort) -> u64 {
    fn walk(node: &PortData) -> u64 {
        match node {
            PortData::Value(v) => v.size(),
            PortData::List(items) => items.iter().map(walk).sum(),
        }
    }
    walk(&port.data)
}

/// Find a port by name.
pub fn find<'a>(ports: &'a [OutputPort], name: &str) -> Result<&'a OutputPort> {
    ports
        .iter()
        .find(|p| p.name == name)
        .ok_or_else(|| Error::NoSuchPort {
            name: name.to_string(),
        })
}
