//! Block explorer links keyed by chain id

/// Explorer metadata for a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Explorer {
    pub chain_id: u64,
    pub name: &'static str,
    pub base_url: &'static str,
}

const EXPLORERS: &[Explorer] = &[
    Explorer {
        chain_id: 1,
        name: "Etherscan (Ethereum)",
        base_url: "https://etherscan.io",
    },
    Explorer {
        chain_id: 137,
        name: "Polygonscan (Polygon)",
        base_url: "https://polygonscan.com",
    },
    Explorer {
        chain_id: 42161,
        name: "Arbiscan (Arbitrum)",
        base_url: "https://arbiscan.io",
    },
    Explorer {
        chain_id: 43114,
        name: "Snowtrace (Avalanche)",
        base_url: "https://snowtrace.io",
    },
];

impl Explorer {
    /// Look up the explorer for a chain id reported by the node
    pub fn for_chain(chain_id: u64) -> Option<Self> {
        EXPLORERS.iter().copied().find(|e| e.chain_id == chain_id)
    }

    pub fn tx_url(&self, hash: &str) -> String {
        format!("{}/tx/{}", self.base_url, hash)
    }

    pub fn address_url(&self, address: &str) -> String {
        format!("{}/address/{}", self.base_url, address)
    }
}
