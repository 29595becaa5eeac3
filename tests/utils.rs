use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    str::FromStr,
    sync::Once,
};

use pairmix::{
    channel::MixMessage,
    interface::{
        AddressKind, Delivery, Identity, IdentityStore, JoinEngine, PeerInfo, Recipient, Safe,
        Settings, Task, TaskState, Transport, TransportError, Wallet, WalletAddress, WalletOutput,
    },
    miniscript::bitcoin::{
        absolute,
        bip32::Xpriv,
        consensus::encode::serialize_hex,
        secp256k1::{Secp256k1, SecretKey},
        transaction::Version,
        Address, Amount, CompressedPublicKey, Network, OutPoint, PrivateKey, Transaction, TxIn,
        TxOut, Txid,
    },
    mixer::Mixer,
    session::{Session, SessionState},
};

static INIT: Once = Once::new();

pub fn setup_logger() {
    INIT.call_once(|| {
        env_logger::builder()
            // Ensures output is only printed in test mode
            .is_test(true)
            .filter_level(log::LevelFilter::Debug)
            .init();
    });
}

/// Deterministic regtest address derived from a one-byte seed.
pub fn addr(seed: u8) -> Address {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(&[seed; 32]).unwrap();
    Address::p2wpkh(&CompressedPublicKey(sk.public_key(&secp)), Network::Regtest)
}

pub fn fake_txid(n: usize) -> Txid {
    Txid::from_str(&format!("{:064x}", 0xfeed_0000 + n)).unwrap()
}

/// A v2 transaction with `n` inputs spending distinct fake outpoints.
pub fn tx_with_inputs(n: usize) -> Transaction {
    let input = (0..n)
        .map(|i| TxIn {
            previous_output: OutPoint {
                txid: fake_txid(i),
                vout: i as u32,
            },
            ..Default::default()
        })
        .collect();
    Transaction {
        version: Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input,
        output: vec![TxOut {
            value: Amount::from_sat(1_000_000),
            script_pubkey: addr(9).script_pubkey(),
        }],
    }
}

pub fn wif(seed: u8) -> String {
    PrivateKey::from_slice(&[seed; 32], Network::Regtest)
        .unwrap()
        .to_wif()
}

pub fn xpriv(seed: u8) -> String {
    Xpriv::new_master(Network::Regtest, &[seed; 32])
        .unwrap()
        .to_string()
}

pub fn task(total: u64, change: Option<u64>, fee: u64, timeout: u64) -> Task {
    Task {
        state: TaskState::Announce,
        tx: serialize_hex(&tx_with_inputs(1)),
        total: Amount::from_sat(total),
        change: change.map(Amount::from_sat),
        fee: Amount::from_sat(fee),
        timeout,
        start: 0,
        ping: 0,
        priv_keys: None,
        session: None,
    }
}

pub fn delivery(sender: &str, msg: &MixMessage) -> Delivery {
    Delivery {
        sender: sender.into(),
        peer: PeerInfo {
            pub_key: sender.into(),
            trusted: true,
        },
        body: msg.to_string().unwrap(),
    }
}

#[derive(Debug, Default)]
pub struct MockTransport {
    pub id: String,
    pub opened: Vec<String>,
    pub closed: Vec<String>,
    pub broadcasts: Vec<(String, String)>,
    pub dms: Vec<(String, String, String)>,
    pub inbox: VecDeque<Delivery>,
}

impl Transport for MockTransport {
    fn fingerprint(&self) -> String {
        self.id.clone()
    }

    fn open_channel(&mut self, name: &str) -> Result<(), TransportError> {
        self.opened.push(name.into());
        Ok(())
    }

    fn close_channel(&mut self, name: &str) -> Result<(), TransportError> {
        self.closed.push(name.into());
        Ok(())
    }

    fn post_encrypted(&mut self, channel: &str, body: String) -> Result<(), TransportError> {
        self.broadcasts.push((channel.into(), body));
        Ok(())
    }

    fn post_dh(&mut self, channel: &str, peer: &str, body: String) -> Result<(), TransportError> {
        self.dms.push((channel.into(), peer.into(), body));
        Ok(())
    }

    fn try_receive(&mut self, _channel: &str) -> Result<Option<Delivery>, TransportError> {
        Ok(self.inbox.pop_front())
    }
}

#[derive(Debug)]
pub struct MockWallet {
    pub balances: HashMap<u32, Amount>,
    pub outputs: HashMap<String, WalletOutput>,
    pub addresses: HashMap<String, WalletAddress>,
    pub prepared: Option<Transaction>,
    pub sign_ok: bool,
    pub broadcasts: Vec<Transaction>,
    pub fallbacks: Vec<Task>,
    pub derived: RefCell<Vec<Vec<u32>>>,
}

impl Default for MockWallet {
    fn default() -> Self {
        MockWallet {
            balances: HashMap::new(),
            outputs: HashMap::new(),
            addresses: HashMap::new(),
            prepared: None,
            sign_ok: true,
            broadcasts: Vec::new(),
            fallbacks: Vec::new(),
            derived: RefCell::new(Vec::new()),
        }
    }
}

impl MockWallet {
    /// Register a keyhash wallet address behind `outpoint` with the given
    /// derivation path.
    pub fn know_output(&mut self, outpoint: &str, address: Address, path: Vec<u32>) {
        self.outputs.insert(
            outpoint.into(),
            WalletOutput {
                address: Some(address.clone()),
                value: Amount::from_sat(1_000_000),
            },
        );
        self.addresses.insert(
            address.to_string(),
            WalletAddress {
                path,
                kind: AddressKind::KeyHash,
            },
        );
    }
}

impl Wallet for MockWallet {
    fn prepare(
        &mut self,
        _pocket: u32,
        _recipients: &[Recipient],
        _change: &Address,
        _fee: Amount,
    ) -> Result<Transaction, String> {
        self.prepared.clone().ok_or_else(|| "no utxo".to_string())
    }

    fn sign_my_inputs(
        &self,
        _inputs: &[TxIn],
        _tx: &mut Transaction,
        _keys: &[PrivateKey],
    ) -> bool {
        self.sign_ok
    }

    fn broadcast_tx(&mut self, tx: &Transaction, _task: &Task) -> Result<(), String> {
        self.broadcasts.push(tx.clone());
        Ok(())
    }

    fn send_fallback(&mut self, _kind: &str, task: &Task) -> Result<(), String> {
        self.fallbacks.push(task.clone());
        Ok(())
    }

    fn output(&self, outpoint: &str) -> Option<WalletOutput> {
        self.outputs.get(outpoint).cloned()
    }

    fn confirmed_balance(&self, pocket: u32) -> Amount {
        self.balances.get(&pocket).copied().unwrap_or(Amount::ZERO)
    }

    fn wallet_address(&self, address: &Address) -> Option<WalletAddress> {
        self.addresses.get(&address.to_string()).cloned()
    }

    fn derive_hd_private_key(&self, path: &[u32], _root: &Xpriv) -> Result<PrivateKey, String> {
        self.derived.borrow_mut().push(path.to_vec());
        PrivateKey::from_slice(&[0x22; 32], Network::Regtest).map_err(|e| e.to_string())
    }

    fn change_address(&mut self, _pocket: u32, _label: &str) -> Result<Address, String> {
        Ok(addr(31))
    }

    fn free_address(&mut self, _pocket: u32, _label: &str) -> Result<Address, String> {
        Ok(addr(32))
    }

    fn decrypt(&self, blob: &str, _password: &str) -> Result<String, String> {
        Ok(blob.to_string())
    }
}

#[derive(Debug, Default)]
pub struct MockSafe {
    pub entries: HashMap<(String, String), String>,
}

impl MockSafe {
    pub fn put(&mut self, namespace: &str, key: &str, password: &str) {
        self.entries
            .insert((namespace.into(), key.into()), password.into());
    }
}

impl Safe for MockSafe {
    fn get(&self, namespace: &str, key: &str) -> Option<String> {
        self.entries
            .get(&(namespace.to_string(), key.to_string()))
            .cloned()
    }
}

#[derive(Debug, Default)]
pub struct MockGui {
    pub states: Vec<String>,
}

impl pairmix::interface::GuiBus for MockGui {
    fn post(&mut self, state: &str) {
        self.states.push(state.into());
    }
}

#[derive(Debug, Default)]
pub struct MockStore {
    pub saves: usize,
    pub last: Option<Identity>,
}

impl IdentityStore for MockStore {
    fn save(&mut self, identity: &Identity) -> Result<(), String> {
        self.saves += 1;
        self.last = Some(identity.clone());
        Ok(())
    }
}

/// Protocol stand-in: each processed message merges the peer transaction
/// and moves the session one state forward.
#[derive(Debug, Default)]
pub struct StepEngine {
    pub calls: usize,
    pub fail: bool,
}

impl JoinEngine for StepEngine {
    fn process(
        &mut self,
        session: &mut Session,
        tx: Transaction,
        _peer: &PeerInfo,
    ) -> Result<Option<Transaction>, String> {
        if self.fail {
            return Err("scripted protocol failure".into());
        }
        self.calls += 1;
        session.tx = tx;
        let next = match session.state {
            SessionState::Announce => SessionState::Accepted,
            SessionState::Accepted => SessionState::Paired,
            SessionState::Paired => SessionState::Sign,
            SessionState::Sign => SessionState::Finished,
            s => s,
        };
        session.state = next;
        Ok(match next {
            SessionState::Accepted | SessionState::Paired => Some(session.tx.clone()),
            _ => None,
        })
    }

    fn add_signatures(&mut self, session: &mut Session, tx: Transaction) -> Result<(), String> {
        session.tx = tx;
        Ok(())
    }
}

pub type TestMixer = Mixer<MockTransport, MockWallet, MockSafe, MockGui, StepEngine, MockStore>;

pub fn mixer(identity: Identity) -> TestMixer {
    setup_logger();
    let transport = MockTransport {
        id: "self-fingerprint".into(),
        ..Default::default()
    };
    Mixer::new(
        "test",
        Network::Regtest,
        transport,
        MockWallet::default(),
        MockSafe::default(),
        MockGui::default(),
        StepEngine::default(),
        MockStore::default(),
        identity,
    )
}

pub fn identity(tasks: Vec<Task>, pockets: Vec<pairmix::interface::Pocket>) -> Identity {
    Identity {
        settings: Settings::default(),
        pockets,
        tasks,
    }
}
