#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    /// Blocks that must confirm on top of a coinbase before its outputs
    /// may be spent. The coinbase's own block counts as the first.
    pub coinbase_maturity: u32,
    /// Height at which the Genesis upgrade activates. Before this height a
    /// bare OP_RETURN output is provably unspendable; from it onward only
    /// OP_FALSE OP_RETURN is.
    pub genesis_activation_height: u32,
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            coinbase_maturity: 100,
            genesis_activation_height: 620_538,
        },
        Network::Testnet => ChainParams {
            network,
            coinbase_maturity: 100,
            genesis_activation_height: 1_344_302,
        },
        Network::Regtest => ChainParams {
            network,
            coinbase_maturity: 100,
            genesis_activation_height: 10_000,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maturity_is_one_hundred_everywhere() {
        for network in [Network::Mainnet, Network::Testnet, Network::Regtest] {
            assert_eq!(chain_params(network).coinbase_maturity, 100);
        }
    }

    #[test]
    fn regtest_genesis_activates_early() {
        assert!(
            chain_params(Network::Regtest).genesis_activation_height
                < chain_params(Network::Mainnet).genesis_activation_height
        );
    }
}
