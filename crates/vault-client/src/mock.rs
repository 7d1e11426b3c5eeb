//! Mock VaultClient for unit testing
//!
//! Simulates a set of Vault nodes in memory. Each node follows Shamir unseal
//! semantics: accepted shares raise `progress`, and reaching the threshold
//! unseals the node and resets progress. Every call is recorded so tests can
//! assert on how many submissions were made.

use crate::error::VaultError;
use crate::models::SealStatus;
use crate::vault_trait::VaultClientTrait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// One simulated Vault node
#[derive(Debug, Clone, Default)]
pub struct MockNode {
    pub sealed: bool,
    pub threshold: u32,
    pub progress: u32,
    /// Shares that Vault answers with 400
    pub rejected_shares: HashSet<String>,
    /// Seal-status and unseal calls fail with a connection error
    pub unreachable: bool,
    /// Seal-status answers, but unseal calls fail with a connection error
    pub drop_submissions: bool,
    /// Seal-status returns a malformed body
    pub malformed_status: bool,
}

/// A call made against the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    SealStatus(String),
    Submit { address: String, share: String },
}

/// Mock VaultClient for testing
#[derive(Clone, Default)]
pub struct MockVaultClient {
    pub(crate) nodes: Arc<Mutex<HashMap<String, MockNode>>>,
    pub(crate) calls: Arc<Mutex<Vec<MockCall>>>,
}

impl MockVaultClient {
    /// Create a mock with no nodes. Unknown addresses are unreachable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a node (for test setup)
    pub fn add_node(&self, address: impl Into<String>, node: MockNode) {
        self.nodes.lock().unwrap().insert(address.into(), node);
    }

    /// Add a sealed node requiring `threshold` shares
    pub fn add_sealed(&self, address: impl Into<String>, threshold: u32) {
        self.add_node(address, MockNode {
            sealed: true,
            threshold,
            ..MockNode::default()
        });
    }

    /// Add an unsealed node
    pub fn add_unsealed(&self, address: impl Into<String>, threshold: u32) {
        self.add_node(address, MockNode {
            sealed: false,
            threshold,
            ..MockNode::default()
        });
    }

    /// Add a node that cannot be reached
    pub fn add_unreachable(&self, address: impl Into<String>) {
        self.add_node(address, MockNode {
            sealed: true,
            unreachable: true,
            ..MockNode::default()
        });
    }

    /// Current state of a node
    pub fn node(&self, address: &str) -> Option<MockNode> {
        self.nodes.lock().unwrap().get(address).cloned()
    }

    /// All recorded calls, in order
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Shares submitted to one node, in order
    pub fn submissions(&self, address: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|call| match call {
                MockCall::Submit { address: a, share } if a == address => Some(share.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of unseal calls across every node
    pub fn total_submissions(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| matches!(call, MockCall::Submit { .. }))
            .count()
    }

    fn status_of(node: &MockNode) -> SealStatus {
        if node.sealed {
            SealStatus::sealed(node.threshold, node.progress)
        } else {
            SealStatus::unsealed(node.threshold)
        }
    }
}

#[async_trait::async_trait]
impl VaultClientTrait for MockVaultClient {
    async fn seal_status(&self, address: &str) -> Result<SealStatus, VaultError> {
        self.calls.lock().unwrap().push(MockCall::SealStatus(address.to_string()));

        let nodes = self.nodes.lock().unwrap();
        let node = nodes
            .get(address)
            .ok_or_else(|| VaultError::Connection(format!("no route to {}", address)))?;
        if node.unreachable {
            return Err(VaultError::Connection(format!("timed out connecting to {}", address)));
        }
        if node.malformed_status {
            return Err(VaultError::Protocol(format!("malformed seal status from {}", address)));
        }
        Ok(Self::status_of(node))
    }

    async fn submit_key_share(&self, address: &str, share: &str) -> Result<SealStatus, VaultError> {
        self.calls.lock().unwrap().push(MockCall::Submit {
            address: address.to_string(),
            share: share.to_string(),
        });

        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes
            .get_mut(address)
            .ok_or_else(|| VaultError::Connection(format!("no route to {}", address)))?;
        if node.unreachable || node.drop_submissions {
            return Err(VaultError::Connection(format!("connection reset by {}", address)));
        }
        if node.rejected_shares.contains(share) {
            return Err(VaultError::RejectedShare("400 Bad Request - invalid key".to_string()));
        }
        if node.sealed {
            node.progress += 1;
            if node.progress >= node.threshold {
                node.sealed = false;
                node.progress = 0;
            }
        }
        Ok(Self::status_of(node))
    }
}
