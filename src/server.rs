//! The per-connection dispatcher.
//!
//! A [`Server`] is the single point of submission and the single point of
//! result application for one backend connection. Requests go to the
//! connection's worker and return immediately; responses come back through
//! a channel and are applied to the [`ServerState`] only when the owner
//! pumps the server with [`Server::process_next`] or
//! [`Server::process_pending`]. All mutation therefore happens on the
//! owner's thread, in the order the driver produced it.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use kvbridge::{BridgeConfig, Server, SledDriver};
//!
//! let driver = SledDriver::open("./data").unwrap();
//! let mut server = Server::new(driver, BridgeConfig::default()).unwrap();
//! let events = server.events();
//!
//! server.connect();
//! server.wait_idle(Duration::from_secs(5));
//! server.load_databases();
//! server.wait_idle(Duration::from_secs(5));
//! for event in events.try_iter() {
//!     println!("{event:?}");
//! }
//! ```
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use crate::config::BridgeConfig;
use crate::driver::Driver;
use crate::error::{ErrorInfo, Result};
use crate::event::Event;
use crate::mirror::DatabaseMirror;
use crate::protocol::{
    CommandOrigin, ExecuteRequest, Inbound, LoadContentRequest, Notice, Operation, Reply,
    Request, RequestId, RequestKind, Response,
};
use crate::state::ServerState;
use crate::ticker::{ExpiryTicker, age_keys};
use crate::translator::Translator;
use crate::types::{ConnectionType, Key, KeyValue, Property, ServerInfo, Ttl};
use crate::worker::Worker;

struct Pending {
    operation: Operation,
    silent: bool,
    probe: Option<String>,
}

/// Dispatcher of one backend connection.
pub struct Server<D: Driver> {
    driver: Arc<D>,
    worker: Worker,
    inbound: Receiver<Inbound>,
    events: Sender<Event>,
    subscriber: Receiver<Event>,
    state: ServerState,
    ticker: ExpiryTicker,
    config: BridgeConfig,
    next_id: u64,
    in_flight: HashMap<RequestId, Pending>,
    probes: HashMap<String, RequestId>,
}

impl<D: Driver> Server<D> {
    /// Take ownership of `driver`, start it and spawn the connection worker.
    pub fn new(driver: D, config: BridgeConfig) -> Result<Self> {
        let driver = Arc::new(driver);
        driver.start()?;
        let (inbound_tx, inbound) = crossbeam_channel::unbounded();
        let worker = match Worker::spawn(&config.worker_thread_name, driver.clone(), inbound_tx) {
            Ok(worker) => worker,
            Err(e) => {
                if let Err(stop) = driver.stop() {
                    log::error!("stopping driver after failed worker spawn: {stop}");
                }
                return Err(e);
            }
        };
        let (events, subscriber) = crossbeam_channel::unbounded();
        Ok(Self {
            driver,
            worker,
            inbound,
            events,
            subscriber,
            state: ServerState::new(),
            ticker: ExpiryTicker::new(config.tick_interval()),
            config,
            next_id: 1,
            in_flight: HashMap::new(),
            probes: HashMap::new(),
        })
    }

    /// The event stream. Clones share one queue, so each event reaches a
    /// single receiver. Events pile up until read.
    pub fn events(&self) -> Receiver<Event> {
        self.subscriber.clone()
    }

    /// Open the session. On success the expiry ticker starts and discovery
    /// info is requested.
    pub fn connect(&mut self) -> RequestId {
        self.submit(RequestKind::Connect, false, None)
    }

    /// Interrupt the running operation, stop the ticker, then close the
    /// session.
    pub fn disconnect(&mut self) -> RequestId {
        self.stop_current_event();
        self.ticker.stop();
        self.probes.clear();
        self.submit(RequestKind::Disconnect, false, None)
    }

    /// Enumerate databases, adding the unseen ones to the state.
    pub fn load_databases(&mut self) -> RequestId {
        self.submit(RequestKind::LoadDatabases, false, None)
    }

    /// List keys of a database, replacing its cached keys and count.
    pub fn load_database_content(&mut self, req: LoadContentRequest) -> RequestId {
        self.submit(RequestKind::LoadDatabaseContent(req), false, None)
    }

    /// Run a backend command. Inner commands produce no events.
    pub fn execute(&mut self, req: ExecuteRequest) -> RequestId {
        let silent = req.origin == CommandOrigin::Inner;
        self.submit(RequestKind::Execute(req), silent, None)
    }

    /// Shut the backend down.
    pub fn shutdown(&mut self) -> RequestId {
        self.submit(RequestKind::ShutDown, false, None)
    }

    /// Dump the backend to `path`.
    pub fn backup(&mut self, path: impl Into<PathBuf>) -> RequestId {
        let path = path.into();
        self.submit(RequestKind::Backup { path }, false, None)
    }

    /// Load a dump from `path`.
    pub fn export(&mut self, path: impl Into<PathBuf>) -> RequestId {
        let path = path.into();
        self.submit(RequestKind::Export { path }, false, None)
    }

    /// Change the session password.
    pub fn change_password(
        &mut self,
        old_password: impl Into<String>,
        new_password: impl Into<String>,
    ) -> RequestId {
        let kind = RequestKind::ChangePassword {
            old_password: old_password.into(),
            new_password: new_password.into(),
        };
        self.submit(kind, false, None)
    }

    /// Change the backend connection limit.
    pub fn set_max_connection(&mut self, max_connections: u32) -> RequestId {
        self.submit(
            RequestKind::SetMaxConnection { max_connections },
            false,
            None,
        )
    }

    /// Fetch server info and cache it.
    pub fn load_server_info(&mut self) -> RequestId {
        self.submit(RequestKind::LoadServerInfo, false, None)
    }

    /// Fetch server properties.
    pub fn load_server_properties(&mut self) -> RequestId {
        self.submit(RequestKind::LoadServerProperties, false, None)
    }

    /// Change one server property.
    pub fn change_server_property(&mut self, property: Property) -> RequestId {
        self.submit(RequestKind::ChangeServerProperty(property), false, None)
    }

    /// Fetch recorded server info samples.
    pub fn load_server_history(&mut self) -> RequestId {
        self.submit(RequestKind::LoadServerHistory, false, None)
    }

    /// Drop recorded server info samples.
    pub fn clear_history(&mut self) -> RequestId {
        self.submit(RequestKind::ClearHistory, false, None)
    }

    /// List publish/subscribe channels matching `pattern`.
    pub fn load_channels(&mut self, pattern: impl Into<String>) -> RequestId {
        let pattern = pattern.into();
        self.submit(RequestKind::LoadChannels { pattern }, false, None)
    }

    /// Fetch server info and the default database. Submitted automatically
    /// after a successful connect.
    pub fn process_discovery_info(&mut self) -> RequestId {
        self.submit(RequestKind::DiscoveryInfo, false, None)
    }

    /// Interrupt whatever the worker is running.
    pub fn stop_current_event(&self) {
        self.worker.interrupt();
        self.driver.interrupt();
    }

    /// Apply everything already delivered, without blocking. Returns the
    /// number of messages and ticks handled.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(msg) = self.inbound.try_recv() {
            self.handle_inbound(msg);
            handled += 1;
        }
        let ticks = self.ticker.receiver();
        if let Some(at) = ticks.try_iter().last() {
            self.on_timer(at);
            handled += 1;
        }
        handled
    }

    /// Wait up to `timeout` for one message or tick and apply it.
    pub fn process_next(&mut self, timeout: Duration) -> bool {
        let inbound = self.inbound.clone();
        let ticks = self.ticker.receiver();
        crossbeam_channel::select! {
            recv(inbound) -> msg => match msg {
                Ok(msg) => {
                    self.handle_inbound(msg);
                    true
                }
                Err(_) => false,
            },
            recv(ticks) -> at => match at {
                Ok(at) => {
                    self.on_timer(at);
                    true
                }
                Err(_) => false,
            },
            default(timeout) => false,
        }
    }

    /// Pump until no request is in flight. `false` on timeout.
    pub fn wait_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.in_flight.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.process_next(deadline - now);
        }
        true
    }

    /// Pump until request `id` finished. `false` on timeout.
    pub fn wait_for(&mut self, id: RequestId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_flight.contains_key(&id) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.process_next(deadline - now);
        }
        true
    }

    /// Number of requests waiting for a response.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Run one aging pass over the current database, as the ticker does
    /// every period. Does nothing unless the ticker runs and the session is up.
    pub fn tick(&mut self, elapsed_secs: u64) {
        if !self.ticker.is_running() || !self.is_connected() {
            return;
        }
        let Some(db) = self.state.current_mut() else {
            return;
        };
        let database = db.name().to_string();
        let outcome = age_keys(db, elapsed_secs);
        for key in outcome.removed {
            self.emit(Event::KeyRemoved {
                database: database.clone(),
                key,
            });
        }
        for key in outcome.changed {
            let ttl = key.ttl;
            self.emit(Event::KeyTtlChanged {
                database: database.clone(),
                key,
                ttl,
            });
        }
        if self.config.probe_expiring_keys {
            for key in outcome.expiring {
                self.probe_ttl(key);
            }
        }
    }

    /// Apply a driver notice.
    pub fn on_notice(&mut self, notice: Notice) {
        match notice {
            Notice::KeyAdded(key) => self.on_key_added(key),
            Notice::KeyLoaded(key) => self.on_key_loaded(key),
            Notice::KeyRemoved(key) => self.on_key_removed(key),
            Notice::KeyRenamed(key, new_name) => self.on_key_renamed(key, new_name),
            Notice::KeyTtlChanged(key, ttl) => self.on_key_ttl_changed(key, ttl),
            Notice::KeyTtlLoaded(key, ttl) => self.on_key_ttl_loaded(key, ttl),
            Notice::CurrentDatabaseChanged(db) => self.on_current_database_changed(db),
            Notice::Flushed => self.on_flushed(),
            Notice::Progress(percent) => self.emit(Event::ProgressChanged(percent)),
            Notice::EnterMode(mode) => self.emit(Event::ModeEntered(mode)),
            Notice::LeaveMode(mode) => self.emit(Event::ModeLeft(mode)),
        }
    }

    /// A key was created on the backend.
    pub fn on_key_added(&mut self, key: KeyValue) {
        self.insert_key(key);
    }

    /// A key was read from the backend.
    pub fn on_key_loaded(&mut self, key: KeyValue) {
        self.insert_key(key);
    }

    /// A key was deleted on the backend.
    pub fn on_key_removed(&mut self, key: Key) {
        let Some(db) = self.state.current_mut() else {
            return;
        };
        if db.remove_key(&key.name) {
            let database = db.name().to_string();
            self.emit(Event::KeyRemoved { database, key });
        }
    }

    /// A key was renamed on the backend.
    pub fn on_key_renamed(&mut self, key: Key, new_name: String) {
        let Some(db) = self.state.current_mut() else {
            return;
        };
        if db.rename_key(&key.name, &new_name) {
            let database = db.name().to_string();
            self.emit(Event::KeyRenamed {
                database,
                key,
                new_name,
            });
        }
    }

    /// A key's ttl was set on the backend.
    pub fn on_key_ttl_changed(&mut self, key: Key, ttl: Ttl) {
        let Some(db) = self.state.current_mut() else {
            return;
        };
        if db.update_key_ttl(&key.name, ttl) {
            let database = db.name().to_string();
            self.emit(Event::KeyTtlChanged { database, key, ttl });
        }
    }

    /// A key's ttl was read from the backend. `Expired` removes the key.
    pub fn on_key_ttl_loaded(&mut self, key: Key, ttl: Ttl) {
        if ttl == Ttl::Expired {
            self.on_key_removed(key);
        } else {
            self.on_key_ttl_changed(key, ttl);
        }
    }

    /// The backend switched databases. The cached mirror of that name, if
    /// any, becomes current and is what the event carries.
    pub fn on_current_database_changed(&mut self, db: DatabaseMirror) {
        if let Some(current) = self.state.switch_current(db) {
            let current = current.clone();
            self.emit(Event::CurrentDatabaseChanged(current));
        }
    }

    /// The current database was flushed on the backend.
    pub fn on_flushed(&mut self) {
        let Some(db) = self.state.current_mut() else {
            return;
        };
        db.clear_keys();
        db.set_key_count(0);
        let db = db.clone();
        self.emit(Event::FlushedDb(db));
    }

    /// Connected and authenticated.
    pub fn is_connected(&self) -> bool {
        self.driver.is_connected() && self.driver.is_authenticated()
    }

    /// Whether the backend is reached over the network.
    pub fn is_can_remote(&self) -> bool {
        self.connection_type().is_remote()
    }

    /// Whether keys of the backend carry a ttl.
    pub fn is_support_ttl_keys(&self) -> bool {
        self.connection_type().supports_ttl_keys()
    }

    /// Whether the expiry ticker is running.
    pub fn is_ticker_running(&self) -> bool {
        self.ticker.is_running()
    }

    /// The driver's command translator.
    pub fn translator(&self) -> Arc<dyn Translator> {
        self.driver.translator()
    }

    /// The backend family.
    pub fn connection_type(&self) -> ConnectionType {
        self.driver.connection_type()
    }

    /// Last segment of the connection path.
    pub fn name(&self) -> String {
        self.driver.connection_path().name().to_string()
    }

    /// Separator between commands of a multi-command text.
    pub fn delimiter(&self) -> &str {
        self.driver.delimiter()
    }

    /// Separator of namespaces inside key names.
    pub fn ns_separator(&self) -> &str {
        self.driver.ns_separator()
    }

    /// Cached server info, `None` unless connected.
    pub fn current_server_info(&self) -> Option<&ServerInfo> {
        if self.is_connected() {
            self.state.server_info()
        } else {
            None
        }
    }

    /// The current database, `None` unless connected.
    pub fn current_database(&self) -> Option<&DatabaseMirror> {
        if self.is_connected() {
            self.state.current()
        } else {
            None
        }
    }

    /// All known databases.
    pub fn databases(&self) -> &[DatabaseMirror] {
        self.state.databases()
    }

    /// Find a known database by name.
    pub fn find_database(&self, name: &str) -> Option<&DatabaseMirror> {
        self.state.find(name)
    }

    /// Read-only view of the state.
    pub fn state(&self) -> &ServerState {
        &self.state
    }

    /// The owned driver.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// The configuration in use.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn submit(&mut self, kind: RequestKind, silent: bool, probe: Option<String>) -> RequestId {
        let id = RequestId(self.next_id);
        self.next_id += 1;
        let operation = kind.operation();
        if !silent {
            self.emit(Event::Started { id, operation });
            self.emit(Event::ProgressChanged(0));
        }
        log::debug!("submitting {operation:?} as {id:?}");
        self.in_flight.insert(
            id,
            Pending {
                operation,
                silent,
                probe,
            },
        );
        if let Err(e) = self.worker.submit(Request { id, kind }) {
            self.apply_response(Response {
                id,
                result: Err(e.into()),
            });
        }
        id
    }

    fn handle_inbound(&mut self, msg: Inbound) {
        match msg {
            Inbound::Notice(notice) => self.on_notice(notice),
            Inbound::Response(response) => self.apply_response(response),
        }
    }

    fn apply_response(&mut self, response: Response) {
        let Some(pending) = self.in_flight.remove(&response.id) else {
            log::warn!("dropping response to unknown request {:?}", response.id);
            return;
        };
        if let Some(name) = &pending.probe {
            if self.probes.get(name) == Some(&response.id) {
                self.probes.remove(name);
            }
        }
        let operation = pending.operation;
        let result: std::result::Result<Reply, ErrorInfo> = match response.result {
            Ok(reply) => Ok(self.apply_reply(reply)),
            Err(err) => {
                if pending.silent {
                    log::debug!("background {operation:?} failed: {err}");
                } else {
                    log::error!("{operation:?} failed: {err}");
                }
                Err(err)
            }
        };
        let connected = operation == Operation::Connect && result.is_ok();
        if operation == Operation::Disconnect {
            self.ticker.stop();
        }
        if !pending.silent {
            self.emit(Event::Finished {
                id: response.id,
                operation,
                result,
            });
        }
        if connected {
            self.ticker.start();
            self.process_discovery_info();
        }
    }

    fn apply_reply(&mut self, reply: Reply) -> Reply {
        match reply {
            Reply::Databases(databases) => {
                for db in databases {
                    self.state.insert_if_absent(db);
                }
                Reply::Databases(self.state.databases().to_vec())
            }
            Reply::DatabaseContent(content) => {
                match self.state.find_mut(&content.database) {
                    Some(db) => {
                        db.set_keys(content.keys.clone());
                        db.set_key_count(content.key_count);
                    }
                    None => {
                        log::debug!("content of unknown database {} not cached", content.database)
                    }
                }
                Reply::DatabaseContent(content)
            }
            Reply::ServerInfo(info) => {
                self.state.set_server_info(info.clone());
                Reply::ServerInfo(info)
            }
            Reply::Discovery { info, database } => {
                self.state.set_server_info(info.clone());
                let database = self.state.adopt_default(database).clone();
                Reply::Discovery { info, database }
            }
            reply => reply,
        }
    }

    fn insert_key(&mut self, key: KeyValue) {
        let Some(db) = self.state.current_mut() else {
            return;
        };
        let database = db.name().to_string();
        if db.insert_key(key.clone()) {
            self.emit(Event::KeyAdded { database, key });
        } else {
            self.emit(Event::KeyLoaded { database, key });
        }
    }

    fn probe_ttl(&mut self, key: Key) {
        if self.probes.contains_key(&key.name) {
            return;
        }
        let command = match self.driver.translator().load_key_ttl_command(&key) {
            Ok(command) => command,
            Err(e) => {
                log::debug!("skipping ttl probe of {}: {e}", key.name);
                return;
            }
        };
        let req = ExecuteRequest::inner(command);
        let id = self.submit(RequestKind::Execute(req), true, Some(key.name.clone()));
        if self.in_flight.contains_key(&id) {
            self.probes.insert(key.name, id);
        }
    }

    fn on_timer(&mut self, at: Instant) {
        let elapsed = self.ticker.elapsed_secs(at);
        self.tick(elapsed);
    }

    fn emit(&self, event: Event) {
        // `subscriber` keeps the channel open, so this never fails
        let _ = self.events.send(event);
    }
}

impl<D: Driver> Drop for Server<D> {
    fn drop(&mut self) {
        self.stop_current_event();
        self.ticker.stop();
        self.worker.shutdown();
        if let Err(e) = self.driver.stop() {
            log::error!("driver stop failed: {e}");
        }
    }
}
