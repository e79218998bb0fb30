mod common;

use std::time::Instant;

use common::{WAIT, drain, manual_tick_config};
use crossbeam_channel::Receiver;
use kvbridge::protocol::{ExecuteRequest, LoadContentRequest, Reply, RequestId};
use kvbridge::types::{ConnectionType, Property};
use kvbridge::{ErrorInfo, ErrorKind, Event, Server, SledDriver, Ttl};
use tempfile::TempDir;

fn open(dir: &TempDir) -> (Server<SledDriver>, Receiver<Event>) {
    let driver = SledDriver::open(dir.path()).unwrap();
    let mut server = Server::new(driver, manual_tick_config()).unwrap();
    let events = server.events();
    server.connect();
    assert!(server.wait_idle(WAIT));
    drain(&events);
    (server, events)
}

fn outcome(
    server: &mut Server<SledDriver>,
    events: &Receiver<Event>,
    id: RequestId,
) -> Result<Reply, ErrorInfo> {
    assert!(server.wait_for(id, WAIT));
    drain(events)
        .into_iter()
        .find_map(|event| match event {
            Event::Finished {
                id: finished,
                result,
                ..
            } if finished == id => Some(result),
            _ => None,
        })
        .expect("request finished without an event")
}

fn exec(server: &mut Server<SledDriver>, events: &Receiver<Event>, text: &str) -> Vec<String> {
    let id = server.execute(ExecuteRequest::new(text));
    match outcome(server, events, id) {
        Ok(Reply::Executed(output)) => output.lines,
        other => panic!("unexpected outcome of {text}: {other:?}"),
    }
}

#[test]
fn connect_discovers_default_database() {
    let dir = TempDir::new().unwrap();
    let (server, _events) = open(&dir);

    let db = server.current_database().unwrap();
    assert_eq!(db.name(), "db0");
    assert!(db.is_current());
    let info = server.current_server_info().unwrap();
    assert_eq!(info.field("Server", "version"), Some("sled 0.34"));
    assert_eq!(server.connection_type(), ConnectionType::Sled);
    assert!(!server.is_can_remote());
    assert!(server.is_support_ttl_keys());
    assert!(server.is_ticker_running());
}

#[test]
fn commands_keep_the_mirror_in_sync() {
    let dir = TempDir::new().unwrap();
    let (mut server, events) = open(&dir);

    assert_eq!(exec(&mut server, &events, "SET a 1\nSET b 2 EX 100"), ["OK", "OK"]);
    let db = server.current_database().unwrap();
    assert_eq!(db.key("a").unwrap().key.ttl, Ttl::NoExpiry);
    assert_eq!(db.key("b").unwrap().key.ttl, Ttl::Remaining(100));

    assert_eq!(exec(&mut server, &events, "GET a"), ["1"]);
    assert_eq!(exec(&mut server, &events, "RENAME a c"), ["OK"]);
    assert_eq!(exec(&mut server, &events, "DEL b"), ["1"]);
    assert_eq!(exec(&mut server, &events, "EXPIRE c 50"), ["1"]);

    let db = server.current_database().unwrap();
    assert!(db.key("a").is_none());
    assert!(db.key("b").is_none());
    assert_eq!(db.key("c").unwrap().key.ttl, Ttl::Remaining(50));
    assert_eq!(db.key("c").unwrap().value.as_deref(), Some("1"));

    assert_eq!(exec(&mut server, &events, "PERSIST c"), ["1"]);
    let c = server.current_database().unwrap().key("c").unwrap();
    assert_eq!(c.key.ttl, Ttl::NoExpiry);

    assert_eq!(exec(&mut server, &events, "TTL c"), ["-1"]);
    assert_eq!(exec(&mut server, &events, "DBSIZE"), ["1"]);
    assert_eq!(exec(&mut server, &events, "KEYS *"), ["c"]);
}

#[test]
fn select_and_flush_follow_the_backend() {
    let dir = TempDir::new().unwrap();
    let (mut server, events) = open(&dir);
    exec(&mut server, &events, "SET a 1");

    exec(&mut server, &events, "SELECT db1\nSET b 2");
    assert_eq!(server.current_database().unwrap().name(), "db1");
    assert!(!server.find_database("db0").unwrap().is_current());
    assert!(server.current_database().unwrap().key("b").is_some());

    exec(&mut server, &events, "FLUSHDB");
    let db1 = server.current_database().unwrap();
    assert_eq!(db1.loaded_keys(), 0);
    assert_eq!(db1.key_count(), 0);
    assert!(server.find_database("db0").unwrap().key("a").is_some());

    let id = server.load_databases();
    let Ok(Reply::Databases(databases)) = outcome(&mut server, &events, id) else {
        panic!("databases not listed");
    };
    let mut names: Vec<&str> = databases.iter().map(|db| db.name()).collect();
    names.sort();
    assert_eq!(names, ["db0", "db1"]);
    assert_eq!(databases.iter().filter(|db| db.is_current()).count(), 1);
}

#[test]
fn content_is_paged_by_pattern_and_count() {
    let dir = TempDir::new().unwrap();
    let (mut server, events) = open(&dir);
    exec(&mut server, &events, "SET user:1 a\nSET user:2 b\nSET user:3 c\nSET other d");

    let mut req = LoadContentRequest::new("db0", 2);
    req.pattern = "user:*".to_string();
    let id = server.load_database_content(req.clone());
    let Ok(Reply::DatabaseContent(first)) = outcome(&mut server, &events, id) else {
        panic!("no first page");
    };
    let names: Vec<&str> = first.keys.iter().map(|kv| kv.name()).collect();
    assert_eq!(names, ["user:1", "user:2"]);
    assert_eq!(first.key_count, 4);
    assert_eq!(first.next_cursor, 2);

    req.cursor = first.next_cursor;
    let id = server.load_database_content(req);
    let Ok(Reply::DatabaseContent(second)) = outcome(&mut server, &events, id) else {
        panic!("no second page");
    };
    assert_eq!(second.keys.len(), 1);
    assert_eq!(second.next_cursor, 0);

    let db = server.current_database().unwrap();
    assert_eq!(db.loaded_keys(), 1);
    assert_eq!(db.key_count(), 4);
    assert!(db.key("user:3").is_some());
}

#[test]
fn unknown_database_is_an_inconsistency() {
    let dir = TempDir::new().unwrap();
    let (mut server, events) = open(&dir);

    let id = server.load_database_content(LoadContentRequest::new("nope", 10));
    let err = outcome(&mut server, &events, id).unwrap_err();

    assert_eq!(err.kind, ErrorKind::Inconsistency);
    assert!(server.find_database("nope").is_none());
}

#[test]
fn unknown_command_fails_without_touching_the_mirror() {
    let dir = TempDir::new().unwrap();
    let (mut server, events) = open(&dir);

    let id = server.execute(ExecuteRequest::new("HSET a b c"));
    let err = outcome(&mut server, &events, id).unwrap_err();

    assert_eq!(err.kind, ErrorKind::Operation);
    assert_eq!(server.current_database().unwrap().loaded_keys(), 0);
}

#[test]
fn backup_then_export_restores_keys() {
    let source = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    let dump = source.path().join("dump.json");
    {
        let (mut server, events) = open(&source);
        exec(&mut server, &events, "SET a 1\nSET b 2 EX 300\nSELECT db1\nSET c 3");
        let id = server.backup(&dump);
        assert!(matches!(outcome(&mut server, &events, id), Ok(Reply::BackedUp(_))));
    }

    let (mut server, events) = open(&target);
    let id = server.export(&dump);
    assert!(matches!(outcome(&mut server, &events, id), Ok(Reply::Exported(_))));

    let id = server.load_database_content(LoadContentRequest::new("db0", 0));
    let Ok(Reply::DatabaseContent(content)) = outcome(&mut server, &events, id) else {
        panic!("db0 not listed");
    };
    assert_eq!(content.key_count, 2);
    let b = content.keys.iter().find(|kv| kv.name() == "b").unwrap();
    assert!(matches!(b.key.ttl, Ttl::Remaining(secs) if secs <= 300));
    assert_eq!(exec(&mut server, &events, "SELECT db1\nGET c"), ["OK", "3"]);
}

#[test]
fn properties_report_and_switch_database() {
    let dir = TempDir::new().unwrap();
    let (mut server, events) = open(&dir);

    let id = server.load_server_properties();
    let Ok(Reply::ServerProperties(properties)) = outcome(&mut server, &events, id) else {
        panic!("no properties");
    };
    assert!(properties.contains(&Property::new("current_database", "db0")));

    let id = server.change_server_property(Property::new("current_database", "db2"));
    assert!(matches!(
        outcome(&mut server, &events, id),
        Ok(Reply::ServerPropertyChanged { changed: true, .. })
    ));
    assert_eq!(server.current_database().unwrap().name(), "db2");

    let id = server.change_server_property(Property::new("cache_size", "1"));
    assert!(matches!(
        outcome(&mut server, &events, id),
        Ok(Reply::ServerPropertyChanged { changed: false, .. })
    ));
}

#[test]
fn disconnect_interrupts_a_repeating_command() {
    let dir = TempDir::new().unwrap();
    let (mut server, events) = open(&dir);

    let mut req = ExecuteRequest::new("SET x 1");
    req.repeat = 1000;
    req.interval_ms = 20;
    let id = server.execute(req);

    let deadline = Instant::now() + WAIT;
    let mut seen = Vec::new();
    while !seen.iter().any(|e| matches!(e, Event::KeyAdded { .. })) {
        assert!(Instant::now() < deadline, "command never started");
        server.process_next(WAIT / 50);
        seen.extend(drain(&events));
    }

    let started = Instant::now();
    let disconnect = server.disconnect();
    assert!(server.wait_for(disconnect, WAIT));
    assert!(started.elapsed() < WAIT);

    seen.extend(drain(&events));
    let results: Vec<&Result<Reply, ErrorInfo>> = seen
        .iter()
        .filter_map(|e| match e {
            Event::Finished { id: finished, result, .. } if *finished == id => Some(result),
            _ => None,
        })
        .collect();
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Err(ErrorInfo { kind: ErrorKind::Interrupted, .. })));
    assert!(!server.is_connected());
}

#[test]
fn oversized_expiry_is_rejected_before_writing() {
    let dir = TempDir::new().unwrap();
    let (mut server, events) = open(&dir);

    let id = server.execute(ExecuteRequest::new("SET big v EX 99999999999999999"));
    let err = outcome(&mut server, &events, id).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Operation);
    assert!(err.message.contains("invalid expire time"));
    assert_eq!(exec(&mut server, &events, "GET big"), ["(nil)"]);
    assert!(server.current_database().unwrap().key("big").is_none());

    exec(&mut server, &events, "SET a 1");
    let id = server.execute(ExecuteRequest::new("EXPIRE a 99999999999999999"));
    let err = outcome(&mut server, &events, id).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Operation);
    assert_eq!(exec(&mut server, &events, "TTL a"), ["-1"]);
    let a = server.current_database().unwrap().key("a").unwrap();
    assert_eq!(a.key.ttl, Ttl::NoExpiry);
}
