//! Partitioning of an object's byte range across servers.
//!
//! A distribution walks a `(length, offset)` range and yields strides, each
//! covering at most one block. The variant decides which server owns a
//! given block.

use serde::{Deserialize, Serialize};

/// Hard cap on any configured block size.
pub const STRIPE_CAP: u64 = 4 << 20; // 4 MiB

pub const DEFAULT_BLOCK_SIZE: u64 = STRIPE_CAP;

/// One contiguous piece of a distributed byte range.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Stride {
    pub index: usize,
    pub length: u64,
    pub offset: u64,
    pub block: u64,
}

/// Iterator-style strategy mapping a byte range onto servers.
/// `reset` scopes the walk; `next_stride` yields pieces until the range
/// is exhausted.
pub trait Distribution: Send {
    fn reset(&mut self, length: u64, offset: u64);
    fn next_stride(&mut self) -> Option<Stride>;
    fn spec(&self) -> DistributionSpec;
}

/// Serialized form of a distribution; the tag selects the variant on
/// deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DistributionSpec {
    RoundRobin { block_size: u64, start_index: usize },
    SingleServer { index: usize, block_size: u64 },
    Weighted { weights: Vec<u64>, block_size: u64 },
}

/// Instantiate the variant a spec names, validated against `server_count`.
pub fn from_spec(
    spec: &DistributionSpec,
    server_count: usize,
) -> crate::Result<Box<dyn Distribution>> {
    if server_count == 0 {
        return Err(crate::Error::InvalidArgument(
            "distribution requires at least one server",
        ));
    }
    match spec {
        DistributionSpec::RoundRobin {
            block_size,
            start_index,
        } => {
            if *start_index >= server_count {
                return Err(crate::Error::InvalidArgument(
                    "start index out of server range",
                ));
            }
            Ok(Box::new(
                RoundRobin::new(server_count)
                    .block_size(*block_size)
                    .start_index(*start_index),
            ))
        }
        DistributionSpec::SingleServer { index, block_size } => {
            if *index >= server_count {
                return Err(crate::Error::InvalidArgument(
                    "server index out of server range",
                ));
            }
            Ok(Box::new(
                SingleServer::new(server_count, *index).block_size(*block_size),
            ))
        }
        DistributionSpec::Weighted { weights, block_size } => {
            if weights.len() != server_count {
                return Err(crate::Error::InvalidArgument(
                    "one weight per server is required",
                ));
            }
            if weights.iter().sum::<u64>() == 0 {
                return Err(crate::Error::InvalidArgument(
                    "weights must not sum to zero",
                ));
            }
            Ok(Box::new(
                Weighted::new(weights.clone()).block_size(*block_size),
            ))
        }
    }
}

fn clamp_block_size(block_size: u64) -> u64 {
    block_size.clamp(1, STRIPE_CAP)
}

/// Walk state shared by all variants: the remaining range and the block
/// decomposition at the current position.
struct Walk {
    block_size: u64,
    remaining: u64,
    offset: u64,
}

impl Walk {
    fn new(block_size: u64) -> Self {
        Self {
            block_size,
            remaining: 0,
            offset: 0,
        }
    }

    fn reset(&mut self, length: u64, offset: u64) {
        self.remaining = length;
        self.offset = offset;
    }

    /// Advance up to the next block boundary, returning the covered piece.
    fn advance(&mut self) -> Option<(u64, u64, u64)> {
        if self.remaining == 0 {
            return None;
        }
        let block = self.offset / self.block_size;
        let within = self.offset % self.block_size;
        let length = (self.block_size - within).min(self.remaining);
        let offset = self.offset;

        self.offset += length;
        self.remaining -= length;
        Some((block, length, offset))
    }
}

/// Blocks cycle through all servers, starting at a configurable index.
pub struct RoundRobin {
    server_count: usize,
    start_index: usize,
    walk: Walk,
}

impl RoundRobin {
    pub fn new(server_count: usize) -> Self {
        Self {
            server_count: server_count.max(1),
            start_index: 0,
            walk: Walk::new(DEFAULT_BLOCK_SIZE),
        }
    }

    pub fn block_size(mut self, block_size: u64) -> Self {
        self.walk.block_size = clamp_block_size(block_size);
        self
    }

    pub fn start_index(mut self, start_index: usize) -> Self {
        self.start_index = start_index % self.server_count;
        self
    }
}

impl Distribution for RoundRobin {
    fn reset(&mut self, length: u64, offset: u64) {
        self.walk.reset(length, offset);
    }

    fn next_stride(&mut self) -> Option<Stride> {
        let (block, length, offset) = self.walk.advance()?;
        let index = (self.start_index as u64 + block) % self.server_count as u64;
        Some(Stride {
            index: index as usize,
            length,
            offset,
            block,
        })
    }

    fn spec(&self) -> DistributionSpec {
        DistributionSpec::RoundRobin {
            block_size: self.walk.block_size,
            start_index: self.start_index,
        }
    }
}

/// Every block goes to one chosen server.
pub struct SingleServer {
    index: usize,
    walk: Walk,
}

impl SingleServer {
    pub fn new(server_count: usize, index: usize) -> Self {
        Self {
            index: index.min(server_count.max(1) - 1),
            walk: Walk::new(DEFAULT_BLOCK_SIZE),
        }
    }

    pub fn block_size(mut self, block_size: u64) -> Self {
        self.walk.block_size = clamp_block_size(block_size);
        self
    }
}

impl Distribution for SingleServer {
    fn reset(&mut self, length: u64, offset: u64) {
        self.walk.reset(length, offset);
    }

    fn next_stride(&mut self) -> Option<Stride> {
        let (block, length, offset) = self.walk.advance()?;
        Some(Stride {
            index: self.index,
            length,
            offset,
            block,
        })
    }

    fn spec(&self) -> DistributionSpec {
        DistributionSpec::SingleServer {
            index: self.index,
            block_size: self.walk.block_size,
        }
    }
}

/// Blocks are spread proportionally to per-server integer weights.
pub struct Weighted {
    weights: Vec<u64>,
    total: u64,
    walk: Walk,
}

impl Weighted {
    pub fn new(weights: Vec<u64>) -> Self {
        let total = weights.iter().sum::<u64>().max(1);
        Self {
            weights,
            total,
            walk: Walk::new(DEFAULT_BLOCK_SIZE),
        }
    }

    pub fn block_size(mut self, block_size: u64) -> Self {
        self.walk.block_size = clamp_block_size(block_size);
        self
    }

    /// Map a block onto the server whose weight bucket contains it. Ties
    /// at identical boundaries resolve to the lower server index.
    fn index_for(&self, block: u64) -> usize {
        let mut slot = block % self.total;
        for (index, weight) in self.weights.iter().enumerate() {
            if slot < *weight {
                return index;
            }
            slot -= weight;
        }
        0
    }
}

impl Distribution for Weighted {
    fn reset(&mut self, length: u64, offset: u64) {
        self.walk.reset(length, offset);
    }

    fn next_stride(&mut self) -> Option<Stride> {
        let (block, length, offset) = self.walk.advance()?;
        Some(Stride {
            index: self.index_for(block),
            length,
            offset,
            block,
        })
    }

    fn spec(&self) -> DistributionSpec {
        DistributionSpec::Weighted {
            weights: self.weights.clone(),
            block_size: self.walk.block_size,
        }
    }
}
