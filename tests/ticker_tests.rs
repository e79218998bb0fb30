mod common;

use std::time::{Duration, Instant};

use common::{MockDriver, WAIT, connected_server, drain, manual_tick_config};
use kvbridge::protocol::ExecuteRequest;
use kvbridge::{BridgeConfig, Event, Key, KeyValue, Server, Ttl};

fn kv(name: &str, ttl: Ttl) -> KeyValue {
    KeyValue::new(Key::with_ttl(name, ttl), None)
}

#[test]
fn key_reaching_zero_waits_for_backend_confirmation() {
    let (mut server, events) = connected_server(MockDriver::new());
    server.on_key_added(kv("t", Ttl::Remaining(1)));
    drain(&events);

    server.tick(1);
    assert!(server.wait_idle(WAIT));

    let db = server.current_database().unwrap();
    assert_eq!(db.key("t").unwrap().key.ttl, Ttl::Remaining(1));
    assert!(drain(&events).is_empty());
    assert_eq!(server.driver().executed(), ["TTL t"]);

    server.on_key_ttl_loaded(Key::new("t"), Ttl::Expired);

    assert!(server.current_database().unwrap().key("t").is_none());
    assert!(matches!(&drain(&events)[..], [Event::KeyRemoved { key, .. }] if key.name == "t"));
}

#[test]
fn probe_roundtrip_removes_confirmed_expired_key() {
    let driver = MockDriver::new();
    driver
        .ttl_answers
        .lock()
        .unwrap()
        .insert("t".to_string(), Ttl::Expired);
    let (mut server, events) = connected_server(driver);
    server.on_key_added(kv("t", Ttl::Remaining(1)));
    drain(&events);

    server.tick(1);
    assert!(server.wait_idle(WAIT));

    assert!(server.current_database().unwrap().key("t").is_none());
    assert!(matches!(&drain(&events)[..], [Event::KeyRemoved { .. }]));
}

#[test]
fn probe_roundtrip_picks_up_extended_ttl() {
    let driver = MockDriver::new();
    driver
        .ttl_answers
        .lock()
        .unwrap()
        .insert("t".to_string(), Ttl::Remaining(60));
    let (mut server, events) = connected_server(driver);
    server.on_key_added(kv("t", Ttl::Remaining(1)));
    drain(&events);

    server.tick(1);
    assert!(server.wait_idle(WAIT));

    let key = &server.current_database().unwrap().key("t").unwrap().key;
    assert_eq!(key.ttl, Ttl::Remaining(60));
    assert!(matches!(
        &drain(&events)[..],
        [Event::KeyTtlChanged { ttl: Ttl::Remaining(60), .. }]
    ));
}

#[test]
fn tick_ages_live_keys_and_drops_expired_ones() {
    let (mut server, events) = connected_server(MockDriver::new());
    server.on_key_added(kv("live", Ttl::Remaining(10)));
    server.on_key_added(kv("forever", Ttl::NoExpiry));
    server.on_key_added(kv("gone", Ttl::Expired));
    drain(&events);

    server.tick(3);

    let db = server.current_database().unwrap();
    assert_eq!(db.key("live").unwrap().key.ttl, Ttl::Remaining(7));
    assert_eq!(db.key("forever").unwrap().key.ttl, Ttl::NoExpiry);
    assert!(db.key("gone").is_none());
    let events = drain(&events);
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], Event::KeyRemoved { key, .. } if key.name == "gone"));
    assert!(matches!(
        &events[1],
        Event::KeyTtlChanged { key, ttl: Ttl::Remaining(7), .. } if key.name == "live"
    ));
    assert_eq!(server.in_flight(), 0);
}

#[test]
fn untranslatable_probe_is_dropped_silently() {
    let (mut server, events) = connected_server(MockDriver::new());
    server.on_key_added(kv("bad key", Ttl::Remaining(1)));
    drain(&events);

    server.tick(1);
    assert!(server.wait_idle(WAIT));

    assert_eq!(server.in_flight(), 0);
    assert!(server.driver().executed().is_empty());
    assert!(drain(&events).is_empty());
    assert!(server.current_database().unwrap().key("bad key").is_some());
}

#[test]
fn inner_commands_emit_no_events_even_on_failure() {
    let (mut server, events) = connected_server(MockDriver::new());

    server.execute(ExecuteRequest::inner("FAIL"));
    server.execute(ExecuteRequest::inner("PING"));
    assert!(server.wait_idle(WAIT));

    assert!(drain(&events).is_empty());
    assert_eq!(server.driver().executed(), ["FAIL", "PING"]);
}

#[test]
fn one_probe_per_key_while_in_flight() {
    let (mut server, _events) = connected_server(MockDriver::new());
    server.on_key_added(kv("t", Ttl::Remaining(1)));

    server.tick(1);
    server.tick(1);
    assert_eq!(server.in_flight(), 1);
    assert!(server.wait_idle(WAIT));

    server.tick(1);
    assert!(server.wait_idle(WAIT));
    assert_eq!(server.driver().executed(), ["TTL t", "TTL t"]);
}

#[test]
fn probes_can_be_disabled() {
    let config = BridgeConfig {
        probe_expiring_keys: false,
        ..manual_tick_config()
    };
    let mut server = Server::new(MockDriver::new(), config).unwrap();
    server.connect();
    assert!(server.wait_idle(WAIT));
    server.on_key_added(kv("t", Ttl::Remaining(1)));

    server.tick(1);

    assert_eq!(server.in_flight(), 0);
    assert!(server.current_database().is_some());
}

#[test]
fn tick_is_inert_after_disconnect() {
    let (mut server, _events) = connected_server(MockDriver::new());
    server.on_key_added(kv("t", Ttl::Remaining(10)));

    server.disconnect();
    assert!(server.wait_idle(WAIT));
    server.tick(5);

    let db = server.find_database("db0").unwrap();
    assert_eq!(db.key("t").unwrap().key.ttl, Ttl::Remaining(10));
}

#[test]
fn running_ticker_counts_down_in_real_time() {
    let config = BridgeConfig {
        tick_interval_ms: 50,
        ..BridgeConfig::default()
    };
    let mut server = Server::new(MockDriver::new(), config).unwrap();
    let events = server.events();
    server.connect();
    assert!(server.wait_idle(WAIT));
    server.on_key_added(kv("t", Ttl::Remaining(100)));
    drain(&events);

    let deadline = Instant::now() + WAIT;
    let mut changed = None;
    while changed.is_none() && Instant::now() < deadline {
        server.process_next(Duration::from_millis(100));
        changed = drain(&events).into_iter().find_map(|e| match e {
            Event::KeyTtlChanged { ttl, .. } => Some(ttl),
            _ => None,
        });
    }

    match changed {
        Some(Ttl::Remaining(secs)) => assert!(secs < 100),
        other => panic!("no countdown observed: {other:?}"),
    }
}
