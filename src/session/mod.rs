use std::collections::HashMap;
use std::fmt;

use miniscript::bitcoin::{Amount, Transaction};

use crate::{
    interface::{PeerInfo, Task},
    scheduler::TimerHandle,
};

/// Cap on buffered candidate replies during the announce phase.
pub const RECEIVED_CAP: usize = 32;

/// States of a mix session, ordered; `Cancelled` is reachable from any
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Announce,
    Accepted,
    Paired,
    Sign,
    Finished,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Finished | SessionState::Cancelled)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Announce => "announce",
            SessionState::Accepted => "accepted",
            SessionState::Paired => "paired",
            SessionState::Sign => "sign",
            SessionState::Finished => "finished",
            SessionState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Guest,
}

/// One CoinJoin in flight. An initiator session carries the persisted task
/// it was started from; a guest session carries the pocket it spends from.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub role: Role,
    pub state: SessionState,
    /// Our prepared half, immutable after construction.
    pub my_tx: Transaction,
    /// The evolving joint transaction.
    pub tx: Transaction,
    pub my_amount: Amount,
    pub fee: Amount,
    pub peer: Option<PeerInfo>,
    pub pocket: Option<u32>,
    pub task: Option<Task>,
    /// Candidate replies raced during announce; one is chosen at the tick.
    pub received: Vec<(PeerInfo, Transaction)>,
    pub timer: Option<TimerHandle>,
}

impl Session {
    pub fn initiator(
        id: String,
        my_tx: Transaction,
        my_amount: Amount,
        fee: Amount,
        task: Task,
    ) -> Self {
        Session {
            id,
            role: Role::Initiator,
            state: SessionState::Announce,
            tx: my_tx.clone(),
            my_tx,
            my_amount,
            fee,
            peer: None,
            pocket: None,
            task: Some(task),
            received: Vec::new(),
            timer: None,
        }
    }

    pub fn guest(
        id: String,
        my_tx: Transaction,
        my_amount: Amount,
        fee: Amount,
        peer: PeerInfo,
        pocket: u32,
    ) -> Self {
        Session {
            id,
            role: Role::Guest,
            state: SessionState::Accepted,
            tx: my_tx.clone(),
            my_tx,
            my_amount,
            fee,
            peer: Some(peer),
            pocket: Some(pocket),
            task: None,
            received: Vec::new(),
            timer: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn cancel(&mut self) {
        if !self.state.is_terminal() {
            self.state = SessionState::Cancelled;
        }
    }

    /// Buffer a candidate reply; returns false when the cap is hit and the
    /// arrival is dropped.
    pub fn push_received(&mut self, peer: PeerInfo, tx: Transaction) -> bool {
        if self.received.len() >= RECEIVED_CAP {
            log::debug!(
                "Session({}).push_received(): buffer full, dropping reply",
                self.id
            );
            return false;
        }
        self.received.push((peer, tx));
        true
    }
}

/// The set of live sessions, keyed by session id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn insert(&mut self, session: Session) {
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<Session> {
        self.sessions.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
