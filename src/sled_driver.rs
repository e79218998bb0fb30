//! A driver over an embedded sled database.
//!
//! Every sled tree is a database, `db0` is created and selected on connect.
//! Expiry deadlines live in a companion tree per database and are enforced
//! lazily, whenever a key is touched.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_utils::atomic::AtomicCell;
use serde::{Deserialize, Serialize};

use crate::driver::{Driver, DriverContext};
use crate::error::{BridgeError, Result};
use crate::mirror::DatabaseMirror;
use crate::protocol::{CommandOutput, DatabaseContent, ExecuteRequest, LoadContentRequest, Notice};
use crate::translator::{RedisTranslator, Translator};
use crate::types::{ConnectionPath, ConnectionType, Key, KeyValue, Property, ServerInfo, Ttl};

const DEFAULT_DATABASE: &str = "db0";
const INTERNAL_PREFIX: &str = "__";
const TTL_TREE_PREFIX: &str = "__ttl__";
const PROGRESS_STEP: usize = 256;
const PAUSE_SLICE: Duration = Duration::from_millis(10);

/// A sled engine driver.
pub struct SledDriver {
    path: PathBuf,
    temporary: bool,
    db: RwLock<Option<sled::Db>>,
    current: Mutex<String>,
    connected: AtomicCell<bool>,
    translator: Arc<RedisTranslator>,
}

#[derive(Serialize, Deserialize)]
struct DumpEntry {
    value: String,
    expires_at_ms: Option<u64>,
}

type Dump = BTreeMap<String, BTreeMap<String, DumpEntry>>;

impl SledDriver {
    /// A driver for the sled directory at `path`. Nothing is opened before
    /// connect.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.is_file() {
            return Err(BridgeError::Connection(format!(
                "{} is a file, not a sled directory",
                path.display()
            )));
        }
        Ok(Self {
            path,
            temporary: false,
            db: RwLock::new(None),
            current: Mutex::new(DEFAULT_DATABASE.to_string()),
            connected: AtomicCell::new(false),
            translator: Arc::new(RedisTranslator),
        })
    }

    /// Remove the data when the session closes.
    pub fn temporary(mut self, temporary: bool) -> Self {
        self.temporary = temporary;
        self
    }

    fn db(&self) -> Result<sled::Db> {
        self.db
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(BridgeError::NotConnected)
    }

    fn current(&self) -> String {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_current(&self, name: &str) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = name.to_string();
    }

    fn database_names(db: &sled::Db) -> Vec<String> {
        db.tree_names()
            .iter()
            .map(|name| String::from_utf8_lossy(name).into_owned())
            .filter(|name| !name.starts_with(INTERNAL_PREFIX))
            .collect()
    }

    fn trees(&self, name: &str) -> Result<(sled::Tree, sled::Tree)> {
        let db = self.db()?;
        Ok((
            db.open_tree(name)?,
            db.open_tree(format!("{TTL_TREE_PREFIX}{name}"))?,
        ))
    }

    fn close(&self) -> Result<()> {
        let db = self
            .db
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.connected.store(false);
        if let Some(db) = db {
            db.flush()?;
        }
        Ok(())
    }

    fn mirror_of(&self, name: &str) -> Result<DatabaseMirror> {
        let (tree, _) = self.trees(name)?;
        Ok(DatabaseMirror::new(name).with_key_count(tree.len()))
    }

    fn execute_line(&self, line: &str, ctx: &DriverContext) -> Result<String> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(command) = tokens.first() else {
            return Ok(String::new());
        };
        let command = command.to_ascii_uppercase();
        let args = &tokens[1..];
        let current = self.current();
        let (tree, ttls) = self.trees(&current)?;
        let arity = |ok: bool| {
            if ok {
                Ok(())
            } else {
                Err(BridgeError::Operation(format!(
                    "wrong number of arguments for {command}"
                )))
            }
        };
        match command.as_str() {
            "PING" => Ok("PONG".to_string()),
            "SET" => {
                arity(
                    args.len() == 2 || (args.len() == 4 && args[2].eq_ignore_ascii_case("EX")),
                )?;
                let (name, value) = (args[0], args[1]);
                let (ttl, deadline) = match args.get(3) {
                    Some(token) => {
                        let secs = parse_secs(token)?;
                        (Ttl::Remaining(secs), Some(deadline_after(secs)?))
                    }
                    None => (Ttl::NoExpiry, None),
                };
                tree.insert(name, value)?;
                store_deadline(&ttls, name, deadline)?;
                ctx.notify(Notice::KeyAdded(KeyValue::new(
                    Key::with_ttl(name, ttl),
                    Some(value.to_string()),
                )));
                Ok("OK".to_string())
            }
            "GET" => {
                arity(args.len() == 1)?;
                let name = args[0];
                match ttl_of(&tree, &ttls, name)? {
                    None => Ok("(nil)".to_string()),
                    Some(Ttl::Expired) => {
                        ctx.notify(Notice::KeyRemoved(Key::new(name)));
                        Ok("(nil)".to_string())
                    }
                    Some(ttl) => {
                        let value = tree
                            .get(name)?
                            .map(|raw| String::from_utf8_lossy(&raw).into_owned())
                            .unwrap_or_default();
                        ctx.notify(Notice::KeyLoaded(KeyValue::new(
                            Key::with_ttl(name, ttl),
                            Some(value.clone()),
                        )));
                        Ok(value)
                    }
                }
            }
            "DEL" => {
                arity(!args.is_empty())?;
                let mut removed = 0;
                for name in args {
                    ttls.remove(name)?;
                    if tree.remove(name)?.is_some() {
                        removed += 1;
                        ctx.notify(Notice::KeyRemoved(Key::new(*name)));
                    }
                }
                Ok(removed.to_string())
            }
            "RENAME" => {
                arity(args.len() == 2)?;
                let (name, new_name) = (args[0], args[1]);
                let ttl = match ttl_of(&tree, &ttls, name)? {
                    Some(Ttl::Expired) | None => {
                        return Err(BridgeError::Operation(format!("no such key {name}")));
                    }
                    Some(ttl) => ttl,
                };
                let Some(value) = tree.remove(name)? else {
                    return Err(BridgeError::Operation(format!("no such key {name}")));
                };
                let deadline = ttls.remove(name)?;
                tree.insert(new_name, value)?;
                match deadline {
                    Some(deadline) => {
                        ttls.insert(new_name, deadline)?;
                    }
                    None => {
                        ttls.remove(new_name)?;
                    }
                }
                ctx.notify(Notice::KeyRenamed(
                    Key::with_ttl(name, ttl),
                    new_name.to_string(),
                ));
                Ok("OK".to_string())
            }
            "EXPIRE" => {
                arity(args.len() == 2)?;
                let name = args[0];
                let secs: i64 = args[1]
                    .parse()
                    .map_err(|_| BridgeError::Operation(format!("invalid seconds {}", args[1])))?;
                let deadline = match u64::try_from(secs) {
                    Ok(secs) if secs > 0 => Some((secs, deadline_after(secs)?)),
                    _ => None,
                };
                if !matches!(
                    ttl_of(&tree, &ttls, name)?,
                    Some(Ttl::NoExpiry | Ttl::Remaining(_))
                ) {
                    return Ok("0".to_string());
                }
                match deadline {
                    Some((secs, deadline)) => {
                        let ttl = Ttl::Remaining(secs);
                        store_deadline(&ttls, name, Some(deadline))?;
                        ctx.notify(Notice::KeyTtlChanged(Key::with_ttl(name, ttl), ttl));
                    }
                    None => {
                        tree.remove(name)?;
                        ttls.remove(name)?;
                        ctx.notify(Notice::KeyRemoved(Key::new(name)));
                    }
                }
                Ok("1".to_string())
            }
            "PERSIST" => {
                arity(args.len() == 1)?;
                let name = args[0];
                match ttl_of(&tree, &ttls, name)? {
                    Some(Ttl::Remaining(_)) => {
                        ttls.remove(name)?;
                        ctx.notify(Notice::KeyTtlChanged(Key::new(name), Ttl::NoExpiry));
                        Ok("1".to_string())
                    }
                    _ => Ok("0".to_string()),
                }
            }
            "TTL" => {
                arity(args.len() == 1)?;
                let name = args[0];
                let ttl = ttl_of(&tree, &ttls, name)?.unwrap_or(Ttl::Expired);
                ctx.notify(Notice::KeyTtlLoaded(Key::with_ttl(name, ttl), ttl));
                Ok(ttl.as_secs().to_string())
            }
            "KEYS" => {
                arity(args.len() == 1)?;
                let mut names = Vec::new();
                for item in tree.iter() {
                    let (raw, _) = item?;
                    let name = String::from_utf8_lossy(&raw).into_owned();
                    if glob_match(args[0], &name)
                        && !matches!(ttl_of(&tree, &ttls, &name)?, Some(Ttl::Expired) | None)
                    {
                        names.push(name);
                    }
                }
                Ok(names.join("\n"))
            }
            "DBSIZE" => {
                arity(args.is_empty())?;
                Ok(tree.len().to_string())
            }
            "SELECT" => {
                arity(args.len() == 1)?;
                let name = args[0];
                if name.starts_with(INTERNAL_PREFIX) {
                    return Err(BridgeError::Operation(format!("invalid database {name}")));
                }
                let mirror = self.mirror_of(name)?;
                self.set_current(name);
                ctx.notify(Notice::CurrentDatabaseChanged(mirror));
                Ok("OK".to_string())
            }
            "FLUSHDB" => {
                arity(args.is_empty())?;
                tree.clear()?;
                ttls.clear()?;
                ctx.notify(Notice::Flushed);
                Ok("OK".to_string())
            }
            _ => Err(BridgeError::Operation(format!("unknown command {command}"))),
        }
    }
}

impl Driver for SledDriver {
    fn stop(&self) -> Result<()> {
        self.close()
    }

    fn is_connected(&self) -> bool {
        self.connected.load()
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Sled
    }

    fn connection_path(&self) -> ConnectionPath {
        ConnectionPath(self.path.to_string_lossy().into_owned())
    }

    fn translator(&self) -> Arc<dyn Translator> {
        self.translator.clone()
    }

    fn connect(&self, _ctx: &DriverContext) -> Result<()> {
        let db = sled::Config::new()
            .path(&self.path)
            .temporary(self.temporary)
            .open()
            .map_err(|e| BridgeError::Connection(e.to_string()))?;
        db.open_tree(DEFAULT_DATABASE)?;
        self.set_current(DEFAULT_DATABASE);
        *self.db.write().unwrap_or_else(PoisonError::into_inner) = Some(db);
        self.connected.store(true);
        Ok(())
    }

    fn disconnect(&self, _ctx: &DriverContext) -> Result<()> {
        self.close()
    }

    fn load_databases(&self, _ctx: &DriverContext) -> Result<Vec<DatabaseMirror>> {
        let db = self.db()?;
        Self::database_names(&db)
            .into_iter()
            .map(|name| self.mirror_of(&name))
            .collect()
    }

    fn load_database_content(
        &self,
        req: &LoadContentRequest,
        ctx: &DriverContext,
    ) -> Result<DatabaseContent> {
        let db = self.db()?;
        if !Self::database_names(&db).contains(&req.database) {
            return Err(BridgeError::UnknownDatabase(req.database.clone()));
        }
        let (tree, ttls) = self.trees(&req.database)?;
        let total = tree.len().max(1);
        let limit = if req.count == 0 { usize::MAX } else { req.count as usize };
        let mut keys = Vec::new();
        let mut key_count = 0;
        let mut matched: u64 = 0;
        let mut more = false;
        for (idx, item) in tree.iter().enumerate() {
            if idx % PROGRESS_STEP == 0 {
                ctx.check_interrupted()?;
                ctx.progress((idx * 100 / total) as u8);
            }
            let (raw_key, raw_value) = item?;
            let name = String::from_utf8_lossy(&raw_key).into_owned();
            let ttl = match ttl_of(&tree, &ttls, &name)? {
                Some(Ttl::Expired) | None => continue,
                Some(ttl) => ttl,
            };
            key_count += 1;
            if !glob_match(&req.pattern, &name) {
                continue;
            }
            matched += 1;
            if matched <= req.cursor {
                continue;
            }
            if keys.len() < limit {
                let value = String::from_utf8_lossy(&raw_value).into_owned();
                keys.push(KeyValue::new(Key::with_ttl(name, ttl), Some(value)));
            } else {
                more = true;
            }
        }
        ctx.progress(100);
        let next_cursor = if more {
            req.cursor + keys.len() as u64
        } else {
            0
        };
        Ok(DatabaseContent {
            database: req.database.clone(),
            keys,
            key_count,
            next_cursor,
        })
    }

    fn execute(&self, req: &ExecuteRequest, ctx: &DriverContext) -> Result<CommandOutput> {
        let mut output = CommandOutput::default();
        let repeat = req.repeat.max(1);
        for round in 0..repeat {
            for line in req.text.split(self.delimiter()) {
                if line.trim().is_empty() {
                    continue;
                }
                ctx.check_interrupted()?;
                let result = self.execute_line(line, ctx)?;
                if !req.silent {
                    output.lines.push(result);
                }
            }
            if round + 1 < repeat {
                pause(req.interval_ms, ctx)?;
            }
        }
        Ok(output)
    }

    fn load_server_info(&self, _ctx: &DriverContext) -> Result<ServerInfo> {
        let db = self.db()?;
        let mut info = ServerInfo::default();
        info.set("Server", "version", "sled 0.34");
        info.set("Stats", "file_name", self.path.to_string_lossy());
        info.set("Stats", "size_on_disk", db.size_on_disk()?.to_string());
        info.set(
            "Stats",
            "databases",
            Self::database_names(&db).len().to_string(),
        );
        info.set("Stats", "current_database", self.current());
        Ok(info)
    }

    fn discovery_info(&self, ctx: &DriverContext) -> Result<(ServerInfo, DatabaseMirror)> {
        let info = self.load_server_info(ctx)?;
        let database = self.mirror_of(&self.current())?;
        Ok((info, database))
    }

    fn backup(&self, path: &Path, _ctx: &DriverContext) -> Result<()> {
        let db = self.db()?;
        let mut dump = Dump::new();
        for name in Self::database_names(&db) {
            let (tree, ttls) = self.trees(&name)?;
            let mut entries = BTreeMap::new();
            for item in tree.iter() {
                let (raw_key, raw_value) = item?;
                let expires_at_ms = ttls.get(&raw_key)?.and_then(|raw| decode_deadline(&raw));
                entries.insert(
                    String::from_utf8_lossy(&raw_key).into_owned(),
                    DumpEntry {
                        value: String::from_utf8_lossy(&raw_value).into_owned(),
                        expires_at_ms,
                    },
                );
            }
            dump.insert(name, entries);
        }
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, &dump)?;
        writer.flush()?;
        Ok(())
    }

    fn export(&self, path: &Path, _ctx: &DriverContext) -> Result<()> {
        let dump: Dump = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        for (name, entries) in dump {
            if name.starts_with(INTERNAL_PREFIX) {
                continue;
            }
            let (tree, ttls) = self.trees(&name)?;
            for (key, entry) in entries {
                tree.insert(key.as_bytes(), entry.value.as_bytes())?;
                match entry.expires_at_ms {
                    Some(deadline) => {
                        ttls.insert(key.as_bytes(), &deadline.to_be_bytes()[..])?;
                    }
                    None => {
                        ttls.remove(key.as_bytes())?;
                    }
                }
            }
        }
        self.db()?.flush()?;
        Ok(())
    }

    fn load_server_properties(&self, _ctx: &DriverContext) -> Result<Vec<Property>> {
        let db = self.db()?;
        Ok(vec![
            Property::new("path", self.path.to_string_lossy()),
            Property::new("temporary", self.temporary.to_string()),
            Property::new("was_recovered", db.was_recovered().to_string()),
            Property::new("current_database", self.current()),
        ])
    }

    fn change_server_property(&self, property: &Property, ctx: &DriverContext) -> Result<bool> {
        if property.name != "current_database" {
            return Ok(false);
        }
        self.execute_line(&format!("SELECT {}", property.value), ctx)?;
        Ok(true)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn decode_deadline(raw: &[u8]) -> Option<u64> {
    raw.try_into().ok().map(u64::from_be_bytes)
}

fn parse_secs(token: &str) -> Result<u64> {
    match token.parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(secs),
        _ => Err(BridgeError::Operation(format!("invalid expire time {token}"))),
    }
}

/// Absolute deadline in unix milliseconds, `secs` from now.
fn deadline_after(secs: u64) -> Result<u64> {
    secs.checked_mul(1000)
        .and_then(|ms| ms.checked_add(now_ms()))
        .ok_or_else(|| BridgeError::Operation(format!("invalid expire time {secs}")))
}

fn store_deadline(ttls: &sled::Tree, name: &str, deadline: Option<u64>) -> Result<()> {
    match deadline {
        Some(deadline) => {
            ttls.insert(name, &deadline.to_be_bytes()[..])?;
        }
        None => {
            ttls.remove(name)?;
        }
    }
    Ok(())
}

/// `None` if the key does not exist. A key past its deadline is purged and
/// reported as `Expired`.
fn ttl_of(tree: &sled::Tree, ttls: &sled::Tree, name: &str) -> Result<Option<Ttl>> {
    if !tree.contains_key(name)? {
        return Ok(None);
    }
    let Some(deadline) = ttls.get(name)?.and_then(|raw| decode_deadline(&raw)) else {
        return Ok(Some(Ttl::NoExpiry));
    };
    let now = now_ms();
    if deadline <= now {
        tree.remove(name)?;
        ttls.remove(name)?;
        return Ok(Some(Ttl::Expired));
    }
    Ok(Some(Ttl::Remaining((deadline - now).div_ceil(1000))))
}

fn pause(ms: u64, ctx: &DriverContext) -> Result<()> {
    let mut left = Duration::from_millis(ms);
    while !left.is_zero() {
        ctx.check_interrupted()?;
        let step = left.min(PAUSE_SLICE);
        thread::sleep(step);
        left -= step;
    }
    ctx.check_interrupted()
}

/// Glob matching with `*` and `?`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}
