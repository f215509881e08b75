use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Result;

use chain_multiplex::config::{NodeConfig, Replication, UserConfig};
use chain_multiplex::genesis::{GenesisDoc, GenesisDocSet, GenesisValidator, ScopedGenesisDoc};

pub const ADDRESS_A: &str = "0000000000000000000000000000000000000000";
pub const ADDRESS_B: &str = "1111111111111111111111111111111111111111";

/// Node configuration replicating the given scopes under a temp root.
pub fn plural_config(root: &Path, user_scopes: BTreeMap<String, Vec<String>>) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.root_dir = root.to_path_buf();
    config.user = UserConfig::new(Replication::Plural, user_scopes, None);
    config
}

pub fn two_user_scopes() -> BTreeMap<String, Vec<String>> {
    let mut user_scopes = BTreeMap::new();
    user_scopes.insert(ADDRESS_A.to_string(), vec!["Default".to_string()]);
    user_scopes.insert(
        ADDRESS_B.to_string(),
        vec!["Default".to_string(), "Games".to_string()],
    );
    user_scopes
}

pub fn sample_genesis_doc(chain_id: &str) -> GenesisDoc {
    GenesisDoc {
        chain_id: chain_id.to_string(),
        initial_height: 1,
        genesis_time: None,
        validators: vec![GenesisValidator {
            address: "val-0".to_string(),
            pub_key: "00".repeat(32),
            power: 10,
            name: "genesis".to_string(),
        }],
        app_hash: String::new(),
        app_state: None,
    }
}

/// Builds the genesis doc set covering every configured scope.
pub fn genesis_set_for(config: &NodeConfig) -> GenesisDocSet {
    GenesisDocSet {
        genesis_docs: config
            .user
            .user_scopes
            .iter()
            .flat_map(|(address, scopes)| {
                scopes.iter().map(|scope| ScopedGenesisDoc {
                    user_address: address.clone(),
                    scope: scope.clone(),
                    genesis_doc: sample_genesis_doc(&format!("chain-{scope}")),
                })
            })
            .collect(),
    }
}

/// Writes the genesis set where the node configuration expects it and
/// returns the raw blob the checksum is computed over.
pub fn write_genesis_set(config: &NodeConfig) -> Result<Vec<u8>> {
    let set = genesis_set_for(config);
    let blob = serde_json::to_vec_pretty(&set)?;
    let path = config.genesis_file();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, &blob)?;
    Ok(blob)
}
