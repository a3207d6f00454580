use std::time::{Duration, Instant};

use mastercache::{CacheError, ClientConfig, Connection, MasterConnector, Push, Request, Response};

mod common;
use common::{config, eventually, open_server, Business, Proxy, BUSINESS, SERVER};

#[test]
fn invalidation_right_after_subscribe_is_pushed() {
    let addr = open_server();
    let cfg = config(addr);
    let mut writer = Connection::open(&cfg).unwrap();

    for _ in 0..50 {
        let mut subscription = Connection::open(&cfg).unwrap().subscribe(&cfg).unwrap();
        let resp = writer
            .request(&Request::InvalidateTable { table: SERVER })
            .unwrap();
        assert!(matches!(resp, Response::Updated(_)));

        // keepalives keep arriving, so a lost notice would otherwise wait forever
        let deadline = Instant::now() + Duration::from_secs(2);
        let list = loop {
            assert!(Instant::now() < deadline, "invalidation was not pushed");
            match subscription.next_push().unwrap() {
                Push::Invalidate(list) => break list,
                Push::Keepalive => continue,
            }
        };
        assert!(list.contains(SERVER));
    }
}

#[test]
fn monitor_clears_caches_and_resubscribes_after_losing_the_master() {
    let addr = open_server();
    let proxy = Proxy::start(addr);
    let monitored = ClientConfig::builder()
        .addr(proxy.addr().to_string())
        .credentials("noc", "secret")
        .build()
        .unwrap();
    let watcher = MasterConnector::connect(monitored).unwrap();
    let writer = MasterConnector::connect(config(addr)).unwrap();
    assert!(eventually(|| watcher.is_monitoring()));

    let businesses = watcher.table::<Business>().unwrap();
    assert!(businesses.is_empty().unwrap());
    assert_eq!(watcher.loaded_tables(), vec![BUSINESS]);

    proxy.cut();
    assert!(eventually(|| watcher.loaded_tables().is_empty()));
    assert!(eventually(|| watcher.is_monitoring()));

    // the new subscription delivers changes again
    assert!(businesses.is_empty().unwrap());
    writer.put_row(&Business::new(3, "initech")).unwrap();
    assert!(eventually(|| businesses.get(&3).unwrap().is_some()));
}

#[test]
fn read_is_retried_on_a_fresh_connection() {
    let addr = open_server();
    let proxy = Proxy::start(addr);
    let direct = MasterConnector::connect(config(addr)).unwrap();
    direct.put_row(&Business::new(1, "acme")).unwrap();

    let conn = MasterConnector::connect(config(proxy.addr())).unwrap();
    assert_eq!(conn.pool().open_count(), 1);

    proxy.cut();
    assert_eq!(conn.row_count(BUSINESS).unwrap(), 1);
    // the dead connection was discarded and replaced
    assert_eq!(conn.pool().open_count(), 1);
    assert_eq!(conn.pool().idle_count(), 1);
}

#[test]
fn mutation_is_not_retried_and_broken_connection_is_discarded() {
    let addr = open_server();
    let proxy = Proxy::start(addr);
    let direct = MasterConnector::connect(config(addr)).unwrap();
    let conn = MasterConnector::connect(config(proxy.addr())).unwrap();
    assert_eq!(conn.pool().open_count(), 1);

    proxy.cut();
    assert!(matches!(
        conn.put_row(&Business::new(1, "acme")),
        Err(CacheError::Io(_))
    ));
    assert_eq!(conn.pool().open_count(), 0);
    assert_eq!(direct.row_count(BUSINESS).unwrap(), 0);

    conn.put_row(&Business::new(1, "acme")).unwrap();
    assert_eq!(conn.pool().open_count(), 1);
    assert_eq!(direct.row_count(BUSINESS).unwrap(), 1);
}
