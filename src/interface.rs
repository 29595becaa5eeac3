use serde::{Deserialize, Serialize};

use miniscript::bitcoin::{bip32::Xpriv, Address, Amount, PrivateKey, Transaction, TxIn};

use crate::session::Session;

/// Safe namespace for pocket mixing passwords.
pub const SAFE_MIXER: &str = "mixer";
/// Safe namespace for per-transaction send passwords (host keys).
pub const SAFE_SEND: &str = "send";

/// Safe key under [`SAFE_MIXER`] for the given pocket.
pub fn pocket_safe_key(pocket: u32) -> String {
    format!("pocket:{}", pocket)
}

pub const GUI_ANNOUNCING: &str = "Announcing";
pub const GUI_NO_MIXING: &str = "Sending with no mixing";

/// Events emitted by the transport connection, inbound to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnect,
    Disconnected,
}

#[derive(Debug)]
pub enum TransportError {
    ChannelNotFound,
    NotConnected,
    Send(String),
}

/// Identity of a channel participant as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub pub_key: String,
    pub trusted: bool,
}

/// A raw record delivered on the lobby channel.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub sender: String,
    pub peer: PeerInfo,
    pub body: String,
}

/// The lobby transport. Implementations own connection handling and both
/// encryption paths; the coordinator only frames and routes messages.
pub trait Transport {
    /// Stable identifier of this node on the channel, used to drop echoes
    /// of its own posts.
    fn fingerprint(&self) -> String;
    fn open_channel(&mut self, name: &str) -> Result<(), TransportError>;
    fn close_channel(&mut self, name: &str) -> Result<(), TransportError>;
    /// Broadcast under the symmetric channel key.
    fn post_encrypted(&mut self, channel: &str, body: String) -> Result<(), TransportError>;
    /// End-to-end encrypted unicast to a known peer key.
    fn post_dh(&mut self, channel: &str, peer: &str, body: String) -> Result<(), TransportError>;
    fn try_receive(&mut self, channel: &str) -> Result<Option<Delivery>, TransportError>;
}

#[derive(Debug, Clone)]
pub struct Recipient {
    pub address: Address,
    pub amount: Amount,
}

/// A prior output known to the wallet, keyed `"<txid>:<vout>"`.
#[derive(Debug, Clone)]
pub struct WalletOutput {
    pub address: Option<Address>,
    pub value: Amount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    KeyHash,
    Multisig,
    Pubkey,
}

/// Wallet-side record for one of our addresses: its derivation path tail
/// (branch first) and script kind.
#[derive(Debug, Clone)]
pub struct WalletAddress {
    pub path: Vec<u32>,
    pub kind: AddressKind,
}

/// The wallet/keystore collaborator. Candidate transaction construction,
/// signing, broadcast and key storage all live behind this seam.
pub trait Wallet {
    /// Build an unsigned transaction spending from `pocket` to `recipients`,
    /// sending the remainder minus `fee` to `change`.
    fn prepare(
        &mut self,
        pocket: u32,
        recipients: &[Recipient],
        change: &Address,
        fee: Amount,
    ) -> Result<Transaction, String>;

    /// Sign the inputs of `tx` that appear in `inputs` with `keys`.
    /// Returns false when the signer refuses.
    fn sign_my_inputs(&self, inputs: &[TxIn], tx: &mut Transaction, keys: &[PrivateKey]) -> bool;

    fn broadcast_tx(&mut self, tx: &Transaction, task: &Task) -> Result<(), String>;

    /// Send the task's original transaction without mixing.
    fn send_fallback(&mut self, kind: &str, task: &Task) -> Result<(), String>;

    fn output(&self, outpoint: &str) -> Option<WalletOutput>;
    fn confirmed_balance(&self, pocket: u32) -> Amount;
    fn wallet_address(&self, address: &Address) -> Option<WalletAddress>;
    fn derive_hd_private_key(&self, path: &[u32], root: &Xpriv) -> Result<PrivateKey, String>;

    fn change_address(&mut self, pocket: u32, label: &str) -> Result<Address, String>;
    fn free_address(&mut self, pocket: u32, label: &str) -> Result<Address, String>;

    /// Keystore decryption of an encrypted blob under a safe password.
    fn decrypt(&self, blob: &str, password: &str) -> Result<String, String>;
}

/// The password safe. May return empty for any key at any time: entries
/// expire with the user's security context.
pub trait Safe {
    fn get(&self, namespace: &str, key: &str) -> Option<String>;
}

/// Sink for mixer state strings shown to the user.
pub trait GuiBus {
    fn post(&mut self, state: &str);
}

/// Persistence for the identity store; called after every durable update.
pub trait IdentityStore {
    fn save(&mut self, identity: &Identity) -> Result<(), String>;
}

/// The CoinJoin transaction primitive: merges a peer transaction into the
/// session's joint transaction and advances the session state.
pub trait JoinEngine {
    /// Process a peer transaction for `session`. Returns the updated joint
    /// transaction when the protocol step produced one to forward.
    fn process(
        &mut self,
        session: &mut Session,
        tx: Transaction,
        peer: &PeerInfo,
    ) -> Result<Option<Transaction>, String>;

    /// Install our signed inputs into the session's joint transaction.
    fn add_signatures(&mut self, session: &mut Session, tx: Transaction) -> Result<(), String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub settings: Settings,
    pub pockets: Vec<Pocket>,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// When set, announce timeouts never fall back to an unmixed send.
    pub hard_mixing: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MixingOptions {
    pub budget: Amount,
    pub spent: Amount,
}

/// Decrypted pocket roots, held in memory only while the security context
/// is live.
#[derive(Debug, Clone)]
pub struct PocketKeys {
    pub master: Xpriv,
    pub change: Xpriv,
}

/// A numbered HD subdivision of the wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pocket {
    pub index: u32,
    pub mixing: bool,
    /// Encrypted base58 master xpriv, if the pocket carries key material.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_key: Option<String>,
    pub mixing_options: MixingOptions,
    #[serde(skip)]
    pub cached_keys: Option<PocketKeys>,
}

impl Pocket {
    pub fn has_key_material(&self) -> bool {
        self.master_key.is_some()
    }

    /// Drop the in-memory key copies and stop mixing on this pocket.
    pub fn demote(&mut self) {
        self.cached_keys = None;
        self.mixing = false;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Announce,
    Paired,
    Finish,
    Finished,
}

/// Persisted user intent to mix; consumed by an initiator session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub state: TaskState,
    /// Consensus hex of the prepared transaction.
    pub tx: String,
    pub total: Amount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change: Option<Amount>,
    pub fee: Amount,
    #[serde(default)]
    pub timeout: u64,
    #[serde(default)]
    pub start: u64,
    #[serde(default)]
    pub ping: u64,
    /// Encrypted JSON blob of the host input keys.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priv_keys: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}
