use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signer};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::errors::{MultiplexError, MultiplexResult};
use crate::types::{Proposal, Vote, VoteKind};

/// Socket signer dial policy: 50 retries at 100 ms each, 5 s total.
pub const SIGNER_DIAL_RETRIES: usize = 50;
pub const SIGNER_DIAL_INTERVAL: Duration = Duration::from_millis(100);

/// The signer producing consensus votes for one replicated chain.
pub trait PrivValidator: Send + Sync {
    /// Hex-encoded ed25519 public key of the signer.
    fn pub_key(&self) -> MultiplexResult<String>;
    fn sign_vote(&self, chain_id: &str, vote: &mut Vote) -> MultiplexResult<()>;
    fn sign_proposal(&self, chain_id: &str, proposal: &mut Proposal) -> MultiplexResult<()>;
}

#[derive(Serialize, Deserialize)]
struct StoredPvKey {
    address: String,
    pub_key: String,
    priv_key: String,
}

/// The node's own identity key, shared by every replicated chain.
pub struct NodeKey {
    keypair: Keypair,
}

impl NodeKey {
    pub fn load_or_generate(path: &Path) -> MultiplexResult<Self> {
        let keypair = if path.exists() {
            load_pv_key(path)?
        } else {
            let keypair = Keypair::generate(&mut OsRng);
            save_pv_key(path, &keypair)?;
            keypair
        };
        Ok(Self { keypair })
    }

    /// Node identifier: first 20 bytes of the SHA-256 of the public key.
    pub fn id(&self) -> String {
        address_of(&self.keypair.public)
    }

    pub fn pub_key(&self) -> String {
        hex::encode(self.keypair.public.to_bytes())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct SignState {
    height: u64,
    round: u32,
    step: u8,
}

const STEP_PROPOSAL: u8 = 1;
const STEP_PREVOTE: u8 = 2;
const STEP_PRECOMMIT: u8 = 3;

impl SignState {
    fn regresses_to(&self, height: u64, round: u32, step: u8) -> bool {
        (height, round, step) < (self.height, self.round, self.step)
    }
}

/// File-backed private validator: one keypair per replicated chain under
/// the scope's config directory, with the last signed height/round/step
/// tracked in the scope's data directory to refuse double signing.
pub struct FilePv {
    keypair: Keypair,
    address: String,
    state_path: PathBuf,
    state: Mutex<SignState>,
}

impl FilePv {
    pub fn load_or_generate(key_path: &Path, state_path: &Path) -> MultiplexResult<Self> {
        let keypair = if key_path.exists() {
            load_pv_key(key_path)?
        } else {
            let keypair = Keypair::generate(&mut OsRng);
            save_pv_key(key_path, &keypair)?;
            keypair
        };
        let state = if state_path.exists() {
            let raw = fs::read_to_string(state_path)?;
            serde_json::from_str(&raw).map_err(|err| {
                MultiplexError::Crypto(format!("invalid priv validator state file: {err}"))
            })?
        } else {
            let state = SignState::default();
            write_state(state_path, &state)?;
            state
        };
        let address = address_of(&keypair.public);
        Ok(Self {
            keypair,
            address,
            state_path: state_path.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn advance(&self, height: u64, round: u32, step: u8) -> MultiplexResult<()> {
        let mut state = self.state.lock();
        if state.regresses_to(height, round, step) {
            return Err(MultiplexError::Crypto(format!(
                "sign state regression: have {}/{}/{}, asked to sign {height}/{round}/{step}",
                state.height, state.round, state.step
            )));
        }
        *state = SignState { height, round, step };
        write_state(&self.state_path, &state)
    }
}

impl PrivValidator for FilePv {
    fn pub_key(&self) -> MultiplexResult<String> {
        Ok(hex::encode(self.keypair.public.to_bytes()))
    }

    fn sign_vote(&self, chain_id: &str, vote: &mut Vote) -> MultiplexResult<()> {
        let step = match vote.kind {
            VoteKind::Prevote => STEP_PREVOTE,
            VoteKind::Precommit => STEP_PRECOMMIT,
        };
        self.advance(vote.height, vote.round, step)?;
        let signature = self.keypair.sign(&vote.sign_bytes(chain_id));
        vote.signature = signature.to_bytes().to_vec();
        Ok(())
    }

    fn sign_proposal(&self, chain_id: &str, proposal: &mut Proposal) -> MultiplexResult<()> {
        self.advance(proposal.height, proposal.round, STEP_PROPOSAL)?;
        let signature = self.keypair.sign(&proposal.sign_bytes(chain_id));
        proposal.signature = signature.to_bytes().to_vec();
        Ok(())
    }
}

fn address_of(public: &PublicKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(public.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..20])
}

fn load_pv_key(path: &Path) -> MultiplexResult<Keypair> {
    let raw = fs::read_to_string(path)?;
    let stored: StoredPvKey = serde_json::from_str(&raw).map_err(|err| {
        MultiplexError::Crypto(format!("invalid priv validator key file: {err}"))
    })?;
    let secret_bytes = hex::decode(stored.priv_key)
        .map_err(|err| MultiplexError::Crypto(format!("invalid secret key encoding: {err}")))?;
    let public_bytes = hex::decode(stored.pub_key)
        .map_err(|err| MultiplexError::Crypto(format!("invalid public key encoding: {err}")))?;
    let secret = SecretKey::from_bytes(&secret_bytes)
        .map_err(|err| MultiplexError::Crypto(format!("invalid secret key bytes: {err}")))?;
    let public = PublicKey::from_bytes(&public_bytes)
        .map_err(|err| MultiplexError::Crypto(format!("invalid public key bytes: {err}")))?;
    Ok(Keypair { secret, public })
}

fn save_pv_key(path: &Path, keypair: &Keypair) -> MultiplexResult<()> {
    let stored = StoredPvKey {
        address: address_of(&keypair.public),
        pub_key: hex::encode(keypair.public.to_bytes()),
        priv_key: hex::encode(keypair.secret.to_bytes()),
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let encoded = serde_json::to_string_pretty(&stored).map_err(|err| {
        MultiplexError::Crypto(format!("failed to encode priv validator key: {err}"))
    })?;
    fs::write(path, encoded)?;
    Ok(())
}

fn write_state(path: &Path, state: &SignState) -> MultiplexResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let encoded = serde_json::to_string(state).map_err(|err| {
        MultiplexError::Crypto(format!("failed to encode priv validator state: {err}"))
    })?;
    fs::write(path, encoded)?;
    Ok(())
}

/// Client side of an external signing process, speaking line-delimited
/// JSON over a TCP socket.
pub struct SignerClient {
    stream: Mutex<TcpStream>,
    chain_id: String,
}

impl SignerClient {
    pub fn connect(addr: &str, chain_id: &str) -> MultiplexResult<Self> {
        let stream = TcpStream::connect(strip_scheme(addr)).map_err(|err| {
            MultiplexError::Crypto(format!("failed to reach signer at {addr}: {err}"))
        })?;
        Ok(Self {
            stream: Mutex::new(stream),
            chain_id: chain_id.to_string(),
        })
    }

    fn request(&self, request: &serde_json::Value) -> MultiplexResult<serde_json::Value> {
        let mut stream = self.stream.lock();
        let mut line = serde_json::to_string(request).map_err(|err| {
            MultiplexError::Crypto(format!("failed to encode signer request: {err}"))
        })?;
        line.push('\n');
        stream.write_all(line.as_bytes())?;
        stream.flush()?;

        let mut reader = BufReader::new(&mut *stream);
        let mut response = String::new();
        reader.read_line(&mut response)?;
        serde_json::from_str(&response).map_err(|err| {
            MultiplexError::Crypto(format!("invalid signer response: {err}"))
        })
    }

    fn response_field(response: &serde_json::Value, field: &str) -> MultiplexResult<String> {
        response
            .get(field)
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                MultiplexError::Crypto(format!("signer response missing {field}"))
            })
    }
}

impl PrivValidator for SignerClient {
    fn pub_key(&self) -> MultiplexResult<String> {
        let response = self.request(&json!({
            "type": "pub_key",
            "chain_id": self.chain_id,
        }))?;
        Self::response_field(&response, "pub_key")
    }

    fn sign_vote(&self, chain_id: &str, vote: &mut Vote) -> MultiplexResult<()> {
        let response = self.request(&json!({
            "type": "sign_vote",
            "chain_id": chain_id,
            "vote": vote,
        }))?;
        let signature = Self::response_field(&response, "signature")?;
        vote.signature = hex::decode(signature)
            .map_err(|err| MultiplexError::Crypto(format!("invalid vote signature: {err}")))?;
        Ok(())
    }

    fn sign_proposal(&self, chain_id: &str, proposal: &mut Proposal) -> MultiplexResult<()> {
        let response = self.request(&json!({
            "type": "sign_proposal",
            "chain_id": chain_id,
            "proposal": proposal,
        }))?;
        let signature = Self::response_field(&response, "signature")?;
        proposal.signature = hex::decode(signature)
            .map_err(|err| MultiplexError::Crypto(format!("invalid proposal signature: {err}")))?;
        Ok(())
    }
}

/// Retries every signer operation on failure with a fixed interval.
pub struct RetrySignerClient {
    inner: SignerClient,
    retries: usize,
    interval: Duration,
}

impl RetrySignerClient {
    pub fn new(inner: SignerClient, retries: usize, interval: Duration) -> Self {
        Self {
            inner,
            retries,
            interval,
        }
    }

    fn with_retries<T>(
        &self,
        mut operation: impl FnMut(&SignerClient) -> MultiplexResult<T>,
    ) -> MultiplexResult<T> {
        let mut last_err = None;
        for attempt in 0..self.retries {
            match operation(&self.inner) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    debug!(attempt, %err, "signer request failed, retrying");
                    last_err = Some(err);
                    std::thread::sleep(self.interval);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            MultiplexError::Crypto("signer request failed with no attempts".to_string())
        }))
    }
}

impl PrivValidator for RetrySignerClient {
    fn pub_key(&self) -> MultiplexResult<String> {
        self.with_retries(|client| client.pub_key())
    }

    fn sign_vote(&self, chain_id: &str, vote: &mut Vote) -> MultiplexResult<()> {
        self.with_retries(|client| {
            let mut attempt = vote.clone();
            client.sign_vote(chain_id, &mut attempt)?;
            vote.signature = attempt.signature;
            Ok(())
        })
    }

    fn sign_proposal(&self, chain_id: &str, proposal: &mut Proposal) -> MultiplexResult<()> {
        self.with_retries(|client| {
            let mut attempt = proposal.clone();
            client.sign_proposal(chain_id, &mut attempt)?;
            proposal.signature = attempt.signature;
            Ok(())
        })
    }
}

/// Dials an external signing process, retrying the connection with the
/// bounded policy, and verifies it can serve a public key.
pub fn connect_socket_priv_validator(
    listen_addr: &str,
    chain_id: &str,
) -> MultiplexResult<RetrySignerClient> {
    let mut last_err = None;
    for _ in 0..SIGNER_DIAL_RETRIES {
        match SignerClient::connect(listen_addr, chain_id) {
            Ok(client) => {
                client.pub_key()?;
                return Ok(RetrySignerClient::new(
                    client,
                    SIGNER_DIAL_RETRIES,
                    SIGNER_DIAL_INTERVAL,
                ));
            }
            Err(err) => {
                last_err = Some(err);
                std::thread::sleep(SIGNER_DIAL_INTERVAL);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        MultiplexError::Crypto(format!("failed to reach signer at {listen_addr}"))
    }))
}

fn strip_scheme(addr: &str) -> &str {
    addr.strip_prefix("tcp://").unwrap_or(addr)
}
