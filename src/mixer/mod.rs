mod error;
pub use error::Error;

use rand::{thread_rng, Rng};

use miniscript::bitcoin::{
    consensus::encode::{deserialize_hex, serialize_hex},
    transaction::Version,
    Amount, Network, Transaction,
};

use crate::{
    channel::{Channel, Incoming, MixMessage},
    interface::{
        pocket_safe_key, Delivery, GuiBus, Identity, IdentityStore, JoinEngine, PeerInfo,
        Recipient, Safe, Task, TaskState, Transport, TransportEvent, Wallet, GUI_ANNOUNCING,
        GUI_NO_MIXING, SAFE_MIXER,
    },
    scheduler::{RetryScheduler, TimerHandle, RETRY_SECS},
    session::{Role, Session, SessionRegistry, SessionState},
    signer, utils,
};

/// Default announce timeout in seconds for tasks that carry none.
pub const DEFAULT_TIMEOUT: u64 = 60;

/// Fixed fee a guest contributes on top of the announced amount.
pub const GUEST_FEE: Amount = Amount::from_sat(50_000);

/// The coordinator service: owns the lobby channel, the live sessions and
/// their retry timers, and drives both sides of the matchmaking protocol.
///
/// All entry points ([`Mixer::handle_transport_event`], [`Mixer::poll`],
/// [`Mixer::poll_timers`]) must be called from a single logical executor;
/// no session is mutated outside of them.
#[derive(Debug)]
pub struct Mixer<T, W, S, G, E, P>
where
    T: Transport,
    W: Wallet,
    S: Safe,
    G: GuiBus,
    E: JoinEngine,
    P: IdentityStore,
{
    pub name: String,
    pub channel: Channel<T>,
    pub wallet: W,
    pub safe: S,
    pub gui: G,
    pub engine: E,
    pub store: P,
    pub identity: Identity,
    pub registry: SessionRegistry,
    pub scheduler: RetryScheduler,
    pub guest_fee: Amount,
}

impl<T, W, S, G, E, P> Mixer<T, W, S, G, E, P>
where
    T: Transport,
    W: Wallet,
    S: Safe,
    G: GuiBus,
    E: JoinEngine,
    P: IdentityStore,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        network: Network,
        transport: T,
        wallet: W,
        safe: S,
        gui: G,
        engine: E,
        store: P,
        identity: Identity,
    ) -> Self {
        Mixer {
            name: name.into(),
            channel: Channel::new(transport, network),
            wallet,
            safe,
            gui,
            engine,
            store,
            identity,
            registry: SessionRegistry::new(),
            scheduler: RetryScheduler::new(),
            guest_fee: GUEST_FEE,
        }
    }

    /// Override the fixed guest-side fee.
    pub fn guest_fee(mut self, fee: Amount) -> Self {
        self.guest_fee = fee;
        self
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                log::info!("Mixer({}).handle_transport_event(): transport up", self.name);
                self.check_mixing();
                self.resume_tasks();
            }
            TransportEvent::Disconnect | TransportEvent::Disconnected => {
                log::info!(
                    "Mixer({}).handle_transport_event(): transport down, dropping {} session(s)",
                    self.name,
                    self.registry.len()
                );
                // in-flight sessions are lost; their tasks stay persisted and
                // re-announce on the next resume
                self.registry.clear();
                self.scheduler.clear();
                self.channel.reset();
            }
        }
    }

    /// Drain and dispatch every pending message on the channel.
    pub fn poll(&mut self) {
        loop {
            match self.channel.try_receive() {
                Ok(Some(incoming)) => self.dispatch(incoming),
                Ok(None) => return,
                Err(e) => {
                    log::error!("Mixer({}).poll(): receive failed: {:?}", self.name, e);
                    return;
                }
            }
        }
    }

    /// Run every retry tick that is due now.
    pub fn poll_timers(&mut self) {
        self.poll_timers_at(utils::now());
    }

    pub fn poll_timers_at(&mut self, now: u64) {
        for (id, handle) in self.scheduler.due(now) {
            // a handle the session no longer holds was cancelled or superseded
            let live = self
                .registry
                .get(&id)
                .map(|s| s.timer == Some(handle))
                .unwrap_or(false);
            if live {
                self.check_announce(&id, now);
            }
        }
    }

    pub fn dispatch(&mut self, incoming: Incoming) {
        let Incoming { msg, sender, peer } = incoming;
        match msg {
            MixMessage::Open { id, amount } => self.on_open(sender, peer, id, amount),
            MixMessage::Join { id, tx, initial } => self.on_join(sender, peer, id, tx, initial),
            MixMessage::Finish { id } => self.on_finish(sender, id),
        }
    }

    /// Parse and dispatch a raw delivery, for embedders that route records
    /// themselves instead of polling the channel.
    pub fn dispatch_delivery(&mut self, delivery: Delivery) {
        use std::str::FromStr;
        match MixMessage::from_str(&delivery.body) {
            Ok(msg) => self.dispatch(Incoming {
                msg,
                sender: delivery.sender,
                peer: delivery.peer,
            }),
            Err(e) => log::debug!(
                "Mixer({}).dispatch_delivery(): drop malformed message: {:?}",
                self.name,
                e
            ),
        }
    }

    /// Demote mixing pockets whose security context expired, then open or
    /// close the channel depending on whether anything is left to mix.
    pub fn check_mixing(&mut self) {
        let mut dirty = false;
        for pocket in self.identity.pockets.iter_mut() {
            if pocket.mixing && pocket.has_key_material() {
                let key = pocket_safe_key(pocket.index);
                if self.safe.get(SAFE_MIXER, &key).is_none() {
                    log::warn!(
                        "Mixer({}).check_mixing(): security context expired on pocket {}",
                        self.name,
                        pocket.index
                    );
                    pocket.demote();
                    dirty = true;
                }
            }
        }
        if dirty {
            if let Err(e) = self.store.save(&self.identity) {
                log::error!("Mixer({}).check_mixing(): store save failed: {}", self.name, e);
            }
        }
        let active =
            self.identity.pockets.iter().any(|p| p.mixing) || !self.identity.tasks.is_empty();
        if active {
            if let Err(e) = self.channel.ensure_open() {
                log::error!("Mixer({}).check_mixing(): channel open failed: {:?}", self.name, e);
            }
        } else if let Err(e) = self.channel.close() {
            log::error!("Mixer({}).check_mixing(): channel close failed: {:?}", self.name, e);
        }
    }

    /// Start every persisted mixer task, in order.
    pub fn resume_tasks(&mut self) {
        for i in 0..self.identity.tasks.len() {
            let task = self.identity.tasks[i].clone();
            let updated = self.start_task(task);
            self.identity.tasks[i] = updated;
        }
        if !self.identity.tasks.is_empty() {
            if let Err(e) = self.store.save(&self.identity) {
                log::error!("Mixer({}).resume_tasks(): store save failed: {}", self.name, e);
            }
        }
    }

    /// Start a task according to its state and hand back the updated task.
    /// Only announce-state tasks spawn a session; the other states are
    /// accepted as no-ops.
    pub fn start_task(&mut self, mut task: Task) -> Task {
        match task.state {
            TaskState::Announce => {
                if let Some(id) = &task.session {
                    if self.registry.contains(id) {
                        // already live, resuming must not duplicate it
                        return task;
                    }
                }
                let my_tx = match decode_task_tx(&task.tx) {
                    Ok(tx) => tx,
                    Err(e) => {
                        log::error!(
                            "Mixer({}).start_task(): unusable task transaction: {:?}",
                            self.name,
                            e
                        );
                        return task;
                    }
                };
                if task.timeout == 0 {
                    task.timeout = DEFAULT_TIMEOUT;
                }
                let now = utils::now();
                if task.start == 0 {
                    task.start = now;
                    task.ping = now;
                }
                // announce the change amount half of the time so the amount
                // does not give away which side initiated
                let amount = match task.change {
                    Some(change) if thread_rng().gen_bool(0.5) => change,
                    _ => task.total,
                };
                let id = utils::random_id();
                task.session = Some(id.clone());
                let session = Session::initiator(id.clone(), my_tx, amount, task.fee, task.clone());
                self.registry.insert(session);
                self.announce(&id);
                task
            }
            // in-flight sessions are not reconstructed across restarts
            TaskState::Paired | TaskState::Finish | TaskState::Finished => task,
        }
    }

    /// Post the announcement for a session and arm its retry tick.
    fn announce(&mut self, id: &str) {
        let now = utils::now();
        if let Err(e) = self.channel.ensure_open() {
            log::error!("Mixer({}).announce(): channel open failed: {:?}", self.name, e);
        }
        let Some(session) = self.registry.get_mut(id) else {
            return;
        };
        let msg = MixMessage::Open {
            id: session.id.clone(),
            amount: session.my_amount,
        };
        match self.channel.post_encrypted(&msg) {
            Ok(()) => log::info!(
                "Mixer({}).announce(): session {} announcing {}",
                self.name,
                session.id,
                session.my_amount
            ),
            // retries subsume the loss
            Err(e) => log::error!("Mixer({}).announce(): send failed: {:?}", self.name, e),
        }
        arm(&mut self.scheduler, session, now);
        self.gui.post(GUI_ANNOUNCING);
    }

    /// One retry tick for an initiator session: time the session out,
    /// pick a buffered reply, re-announce, or catch a lost peer.
    fn check_announce(&mut self, id: &str, now: u64) {
        enum Outcome {
            Idle,
            Process(PeerInfo, Transaction),
            Fallback(Task),
            Restart(Task, Option<String>),
        }

        let outcome = {
            let Some(session) = self.registry.get_mut(id) else {
                return;
            };
            session.timer = None;
            let Some(task) = session.task.clone() else {
                // guest sessions carry no announcement to re-check
                return;
            };
            let expired = now.saturating_sub(task.start) > task.timeout;
            if expired && !self.identity.settings.hard_mixing {
                log::info!(
                    "Mixer({}).check_announce(): session {} timed out, sending without mix",
                    self.name,
                    session.id
                );
                session.cancel();
                Outcome::Fallback(task)
            } else if session.state == SessionState::Announce && !session.received.is_empty() {
                // the race is over: one candidate wins, the rest are dropped
                let pick = thread_rng().gen_range(0..session.received.len());
                let (peer, tx) = session.received.swap_remove(pick);
                session.received.clear();
                arm(&mut self.scheduler, session, now);
                Outcome::Process(peer, tx)
            } else if session.state == SessionState::Announce {
                let msg = MixMessage::Open {
                    id: session.id.clone(),
                    amount: session.my_amount,
                };
                if let Err(e) = self.channel.post_encrypted(&msg) {
                    log::error!(
                        "Mixer({}).check_announce(): resend failed: {:?}",
                        self.name,
                        e
                    );
                }
                self.gui.post(GUI_ANNOUNCING);
                arm(&mut self.scheduler, session, now);
                Outcome::Idle
            } else if !session.is_terminal() {
                if now.saturating_sub(task.ping) > task.timeout / 10 {
                    log::warn!(
                        "Mixer({}).check_announce(): session {} lost its peer, re-announcing",
                        self.name,
                        session.id
                    );
                    session.cancel();
                    let mut task = task.clone();
                    let old = task.session.take();
                    task.state = TaskState::Announce;
                    task.ping = now;
                    Outcome::Restart(task, old)
                } else {
                    arm(&mut self.scheduler, session, now);
                    Outcome::Idle
                }
            } else {
                Outcome::Idle
            }
        };

        match outcome {
            Outcome::Idle => {
                self.check_delete(id);
                self.check_mixing();
            }
            Outcome::Fallback(task) => {
                self.gui.post(GUI_NO_MIXING);
                if let Err(e) = self.wallet.send_fallback("mixer", &task) {
                    log::error!(
                        "Mixer({}).check_announce(): fallback send failed: {}",
                        self.name,
                        e
                    );
                }
                // the funds moved unmixed; a later resume must not announce
                // this task again
                self.identity.tasks.retain(|t| t.session != task.session);
                if let Err(e) = self.store.save(&self.identity) {
                    log::error!(
                        "Mixer({}).check_announce(): store save failed: {}",
                        self.name,
                        e
                    );
                }
                self.check_delete(id);
                self.check_mixing();
            }
            Outcome::Process(peer, tx) => self.process_message(id, tx, peer),
            Outcome::Restart(task, old) => {
                self.check_delete(id);
                let updated = self.start_task(task);
                if let Some(slot) = self
                    .identity
                    .tasks
                    .iter_mut()
                    .find(|t| t.session == old)
                {
                    *slot = updated;
                }
                if let Err(e) = self.store.save(&self.identity) {
                    log::error!(
                        "Mixer({}).check_announce(): store save failed: {}",
                        self.name,
                        e
                    );
                }
                self.check_mixing();
            }
        }
    }

    fn on_open(&mut self, sender: String, peer: PeerInfo, id: String, amount: Amount) {
        if sender == self.channel.fingerprint() {
            return;
        }
        if !peer.trusted {
            log::debug!(
                "Mixer({}).on_open(): opening {} from untrusted peer, ignoring",
                self.name,
                id
            );
            return;
        }
        if self.registry.contains(&id) {
            // our own announcement, or one already answered
            log::debug!("Mixer({}).on_open(): id {} already known", self.name, id);
            return;
        }
        if let Err(e) = self.evaluate_opening(peer, id, amount) {
            log::error!(
                "Mixer({}).on_open(): fail to answer opening: {:?}",
                self.name,
                e
            );
        }
    }

    /// Guest-side matchmaking: answer an opening when some mixing pocket can
    /// cover the announced amount plus our fee.
    fn evaluate_opening(&mut self, peer: PeerInfo, id: String, amount: Amount) -> Result<(), Error> {
        let need = amount + self.guest_fee;
        let Some(pocket) = self.find_mixing_pocket(need) else {
            log::debug!(
                "Mixer({}).evaluate_opening(): no mixing pocket holds {}",
                self.name,
                need
            );
            return Ok(());
        };
        let change = self
            .wallet
            .change_address(pocket, "mixing")
            .map_err(Error::Wallet)?;
        let destination = self
            .wallet
            .free_address(pocket, "mixing")
            .map_err(Error::Wallet)?;
        let recipients = [Recipient {
            address: destination,
            amount,
        }];
        let tx = self
            .wallet
            .prepare(pocket, &recipients, &change, self.guest_fee)
            .map_err(Error::Wallet)?;
        let my_tx = version_fixed(tx);
        let session = Session::guest(
            id.clone(),
            my_tx.clone(),
            amount,
            self.guest_fee,
            peer.clone(),
            pocket,
        );
        self.registry.insert(session);
        log::info!(
            "Mixer({}).evaluate_opening(): joining {} for {} from pocket {}",
            self.name,
            id,
            amount,
            pocket
        );
        let reply = MixMessage::Join {
            id,
            tx: my_tx,
            initial: true,
        };
        self.channel.post_dh(&peer.pub_key, &reply)?;
        Ok(())
    }

    /// First mixing pocket whose confirmed balance covers `need`, scanning
    /// in index order.
    fn find_mixing_pocket(&self, need: Amount) -> Option<u32> {
        self.identity
            .pockets
            .iter()
            .find(|p| p.mixing && self.wallet.confirmed_balance(p.index) >= need)
            .map(|p| p.index)
    }

    fn on_join(&mut self, sender: String, peer: PeerInfo, id: String, tx: Transaction, initial: bool) {
        if sender == self.channel.fingerprint() {
            return;
        }
        let buffer = match self.registry.get_mut(&id) {
            None => {
                log::debug!("Mixer({}).on_join(): unknown id {}, dropping", self.name, id);
                return;
            }
            Some(session) => initial && session.state == SessionState::Announce,
        };
        if buffer {
            // candidates race until the next tick picks one
            if let Some(session) = self.registry.get_mut(&id) {
                session.push_received(peer, tx);
            }
        } else {
            self.process_message(&id, tx, peer);
        }
    }

    fn on_finish(&mut self, sender: String, id: String) {
        if sender == self.channel.fingerprint() {
            return;
        }
        let known = match self.registry.get_mut(&id) {
            Some(session) => {
                log::info!(
                    "Mixer({}).on_finish(): peer finished session {}",
                    self.name,
                    id
                );
                session.cancel();
                true
            }
            None => false,
        };
        if known {
            self.check_delete(&id);
            self.check_mixing();
        }
    }

    /// Feed a peer transaction to the protocol engine and react to the
    /// state it leaves the session in.
    fn process_message(&mut self, id: &str, tx: Transaction, peer: PeerInfo) {
        let now = utils::now();
        let (snapshot, sid) = {
            let Some(session) = self.registry.get_mut(id) else {
                log::debug!(
                    "Mixer({}).process_message(): unknown session {}",
                    self.name,
                    id
                );
                return;
            };
            let prev = session.state;
            if session.peer.is_none() {
                session.peer = Some(peer.clone());
            }
            let mut updated = None;
            let mut advanced = false;
            match self.engine.process(session, tx, &peer) {
                Ok(u) => {
                    updated = u;
                    advanced = true;
                }
                Err(e) => {
                    log::error!(
                        "Mixer({}).process_message(): protocol error on {}: {}",
                        self.name,
                        session.id,
                        e
                    );
                    session.cancel();
                }
            }
            match session.state {
                SessionState::Accepted | SessionState::Paired => {
                    if let Some(joint) = updated.take() {
                        if let Some(p) = &session.peer {
                            let msg = MixMessage::Join {
                                id: session.id.clone(),
                                tx: joint,
                                initial: false,
                            };
                            if let Err(e) = self.channel.post_dh(&p.pub_key, &msg) {
                                log::error!(
                                    "Mixer({}).process_message(): forward failed: {:?}",
                                    self.name,
                                    e
                                );
                            }
                        }
                    }
                }
                SessionState::Sign => {
                    // our signatures go in, the counterparty's next message
                    // moves the session on; nothing is forwarded here
                    match signer::request_sign_inputs(
                        &self.wallet,
                        &self.safe,
                        &mut self.identity.pockets,
                        session,
                    ) {
                        Ok(signed) => {
                            if let Err(e) = self.engine.add_signatures(session, signed) {
                                log::error!(
                                    "Mixer({}).process_message(): add signatures failed: {}",
                                    self.name,
                                    e
                                );
                                session.cancel();
                            }
                        }
                        Err(e) => {
                            log::error!(
                                "Mixer({}).process_message(): signing failed on {}: {}",
                                self.name,
                                session.id,
                                e
                            );
                            session.cancel();
                        }
                    }
                }
                SessionState::Finished => match session.role {
                    Role::Initiator => {
                        if let Some(task) = session.task.as_mut() {
                            task.tx = serialize_hex(&session.tx);
                            if let Err(e) = self.wallet.broadcast_tx(&session.tx, task) {
                                log::error!(
                                    "Mixer({}).process_message(): broadcast failed: {}",
                                    self.name,
                                    e
                                );
                            }
                        }
                    }
                    Role::Guest => {
                        // exactly once per session
                        if prev != SessionState::Finished {
                            if let Some(index) = session.pocket {
                                track_budget(&mut self.identity, index, session.fee);
                                if let Err(e) = self.store.save(&self.identity) {
                                    log::error!(
                                        "Mixer({}).process_message(): store save failed: {}",
                                        self.name,
                                        e
                                    );
                                }
                            }
                        }
                    }
                },
                SessionState::Announce | SessionState::Cancelled => {}
            }
            if advanced {
                if let Some(task) = session.task.as_mut() {
                    task.ping = now;
                    if let Some(state) = task_state_of(session.state) {
                        task.state = state;
                    }
                }
                self.gui.post(&session.state.to_string());
            }
            (session.task.clone(), session.id.clone())
        };
        if let Some(task) = snapshot {
            self.sync_task(&task);
        }
        self.check_delete(&sid);
        self.check_mixing();
    }

    /// Remove the session if it reached a terminal state.
    pub fn check_delete(&mut self, id: &str) {
        let terminal = self
            .registry
            .get(id)
            .map(|s| s.is_terminal())
            .unwrap_or(false);
        if terminal {
            if let Some(session) = self.registry.remove(id) {
                if let Some(handle) = session.timer {
                    self.scheduler.cancel(handle);
                }
                log::debug!(
                    "Mixer({}).check_delete(): session {} removed at state {}",
                    self.name,
                    session.id,
                    session.state
                );
            }
        }
    }

    /// Write the session's task back into the persisted list.
    fn sync_task(&mut self, task: &Task) {
        let Some(sid) = task.session.as_deref() else {
            return;
        };
        if let Some(slot) = self
            .identity
            .tasks
            .iter_mut()
            .find(|t| t.session.as_deref() == Some(sid))
        {
            *slot = task.clone();
            if let Err(e) = self.store.save(&self.identity) {
                log::error!("Mixer({}).sync_task(): store save failed: {}", self.name, e);
            }
        }
    }
}

/// Arm the session's single retry tick, superseding any outstanding one.
fn arm(scheduler: &mut RetryScheduler, session: &mut Session, now: u64) {
    let handle: TimerHandle = scheduler.schedule(&session.id, RETRY_SECS, now);
    if let Some(old) = session.timer.replace(handle) {
        scheduler.cancel(old);
    }
}

/// Charge a finished guest session against its pocket's mixing budget and
/// stop mixing there once the budget is spent.
fn track_budget(identity: &mut Identity, pocket: u32, fee: Amount) {
    if let Some(p) = identity.pockets.iter_mut().find(|p| p.index == pocket) {
        p.mixing_options.spent = p.mixing_options.spent + fee;
        if p.mixing_options.spent >= p.mixing_options.budget {
            log::info!("mixing budget exhausted on pocket {}", pocket);
            p.demote();
        }
    }
}

fn task_state_of(state: SessionState) -> Option<TaskState> {
    match state {
        SessionState::Announce => Some(TaskState::Announce),
        SessionState::Accepted | SessionState::Paired => Some(TaskState::Paired),
        SessionState::Sign => Some(TaskState::Finish),
        SessionState::Finished => Some(TaskState::Finished),
        SessionState::Cancelled => None,
    }
}

fn decode_task_tx(hex: &str) -> Result<Transaction, Error> {
    let tx: Transaction =
        deserialize_hex(hex).map_err(|e| Error::TaskTransaction(e.to_string()))?;
    Ok(version_fixed(tx))
}

fn version_fixed(mut tx: Transaction) -> Transaction {
    tx.version = Version::ONE;
    tx
}
