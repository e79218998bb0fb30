#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::Receiver;
use crossbeam_utils::atomic::AtomicCell;
use kvbridge::protocol::{
    CommandOutput, DatabaseContent, ExecuteRequest, LoadContentRequest, Notice,
};
use kvbridge::translator::{RedisTranslator, Translator};
use kvbridge::types::{ConnectionPath, ConnectionType, ServerInfo};
use kvbridge::{
    BridgeConfig, BridgeError, DatabaseMirror, Driver, DriverContext, Event, Server, Ttl,
};

pub const WAIT: Duration = Duration::from_secs(5);

/// A driver answering from scripted state.
pub struct MockDriver {
    pub connected: AtomicCell<bool>,
    pub connect_error: Mutex<Option<String>>,
    pub databases: Mutex<Vec<DatabaseMirror>>,
    pub default_db: Mutex<String>,
    pub contents: Mutex<HashMap<String, DatabaseContent>>,
    pub block_content: AtomicCell<bool>,
    pub content_started: AtomicCell<bool>,
    pub notices: Mutex<Vec<Notice>>,
    pub executed: Mutex<Vec<String>>,
    pub ttl_answers: Mutex<HashMap<String, Ttl>>,
    pub interrupts: AtomicCell<usize>,
    pub stops: Arc<AtomicCell<usize>>,
    pub connection_type: ConnectionType,
    translator: Arc<RedisTranslator>,
}

impl MockDriver {
    pub fn new() -> Self {
        MockDriver {
            connected: AtomicCell::new(false),
            connect_error: Mutex::new(None),
            databases: Mutex::new(Vec::new()),
            default_db: Mutex::new("db0".to_string()),
            contents: Mutex::new(HashMap::new()),
            block_content: AtomicCell::new(false),
            content_started: AtomicCell::new(false),
            notices: Mutex::new(Vec::new()),
            executed: Mutex::new(Vec::new()),
            ttl_answers: Mutex::new(HashMap::new()),
            interrupts: AtomicCell::new(0),
            stops: Arc::new(AtomicCell::new(0)),
            connection_type: ConnectionType::Redis,
            translator: Arc::new(RedisTranslator),
        }
    }

    pub fn with_databases(self, names: &[&str]) -> Self {
        *self.databases.lock().unwrap() = names.iter().map(|n| DatabaseMirror::new(*n)).collect();
        self
    }

    pub fn with_connect_error(self, message: &str) -> Self {
        *self.connect_error.lock().unwrap() = Some(message.to_string());
        self
    }

    pub fn with_content(self, content: DatabaseContent) -> Self {
        self.contents
            .lock()
            .unwrap()
            .insert(content.database.clone(), content);
        self
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

impl Driver for MockDriver {
    fn stop(&self) -> kvbridge::Result<()> {
        self.stops.fetch_add(1);
        Ok(())
    }

    fn interrupt(&self) {
        self.interrupts.fetch_add(1);
    }

    fn is_connected(&self) -> bool {
        self.connected.load()
    }

    fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    fn connection_path(&self) -> ConnectionPath {
        ConnectionPath("/mock/local".to_string())
    }

    fn translator(&self) -> Arc<dyn Translator> {
        self.translator.clone()
    }

    fn connect(&self, _ctx: &DriverContext) -> kvbridge::Result<()> {
        if let Some(message) = self.connect_error.lock().unwrap().clone() {
            return Err(BridgeError::Connection(message));
        }
        self.connected.store(true);
        Ok(())
    }

    fn disconnect(&self, _ctx: &DriverContext) -> kvbridge::Result<()> {
        self.connected.store(false);
        Ok(())
    }

    fn load_databases(&self, _ctx: &DriverContext) -> kvbridge::Result<Vec<DatabaseMirror>> {
        Ok(self.databases.lock().unwrap().clone())
    }

    fn load_database_content(
        &self,
        req: &LoadContentRequest,
        ctx: &DriverContext,
    ) -> kvbridge::Result<DatabaseContent> {
        self.content_started.store(true);
        while self.block_content.load() {
            ctx.check_interrupted()?;
            thread::sleep(Duration::from_millis(2));
        }
        self.contents
            .lock()
            .unwrap()
            .get(&req.database)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownDatabase(req.database.clone()))
    }

    fn execute(
        &self,
        req: &ExecuteRequest,
        ctx: &DriverContext,
    ) -> kvbridge::Result<CommandOutput> {
        self.executed.lock().unwrap().push(req.text.clone());
        if let Some(name) = req.text.strip_prefix("TTL ") {
            if let Some(ttl) = self.ttl_answers.lock().unwrap().get(name) {
                ctx.notify(Notice::KeyTtlLoaded(kvbridge::Key::new(name), *ttl));
            }
        }
        if req.text == "FAIL" {
            return Err(BridgeError::Operation("ERR scripted failure".to_string()));
        }
        for notice in self.notices.lock().unwrap().drain(..) {
            ctx.notify(notice);
        }
        Ok(CommandOutput {
            lines: vec!["OK".to_string()],
        })
    }

    fn load_server_info(&self, _ctx: &DriverContext) -> kvbridge::Result<ServerInfo> {
        Ok(ServerInfo::parse("# Server\nversion:7.2.0\n"))
    }

    fn discovery_info(
        &self,
        ctx: &DriverContext,
    ) -> kvbridge::Result<(ServerInfo, DatabaseMirror)> {
        let name = self.default_db.lock().unwrap().clone();
        Ok((self.load_server_info(ctx)?, DatabaseMirror::new(name).with_key_count(3)))
    }
}

/// A config whose ticker never fires on its own; tests tick by hand.
pub fn manual_tick_config() -> BridgeConfig {
    BridgeConfig {
        tick_interval_ms: 3_600_000,
        ..BridgeConfig::default()
    }
}

pub fn drain(events: &Receiver<Event>) -> Vec<Event> {
    events.try_iter().collect()
}

/// A server that finished connect and discovery, with its events drained.
pub fn connected_server(driver: MockDriver) -> (Server<MockDriver>, Receiver<Event>) {
    let mut server = Server::new(driver, manual_tick_config()).unwrap();
    let events = server.events();
    server.connect();
    assert!(server.wait_idle(WAIT));
    drain(&events);
    (server, events)
}

pub fn finished(events: &[Event]) -> Vec<&Event> {
    events
        .iter()
        .filter(|e| matches!(e, Event::Finished { .. }))
        .collect()
}
