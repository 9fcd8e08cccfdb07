//! Connection strategy behavior

use super::*;
use nostr_relay_pool::{Filter, ForwardReq, RelayRole, SendOptions, UseOptions};

#[tokio::test]
async fn test_lazy_connects_only_on_demand() {
    let mut relay = MockRelay::start().await;
    let pool = test_pool(ConnectionStrategy::Lazy);
    pool.set_default_relays([&relay.url]).unwrap();

    tokio::time::sleep(QUIET).await;
    assert_eq!(relay.connections(), 0);
    assert_eq!(
        pool.get_relay_status(&relay.url).unwrap().connection,
        ConnectionState::Initialized
    );

    let req = ForwardReq::with_id("feed");
    let mut sub = pool.use_req(&req, UseOptions::default()).unwrap();
    req.emit([Filter::new().kinds(vec![1])]);

    wait_state(&pool, &relay.url, ConnectionState::Connected).await;
    let frame = relay.next_of("REQ").await;
    assert_eq!(frame[1], "feed:0");

    sub.unsubscribe();
    let frame = relay.next_of("CLOSE").await;
    assert_eq!(frame[1], "feed:0");
    wait_state(&pool, &relay.url, ConnectionState::Dormant).await;
}

#[tokio::test]
async fn test_lazy_keep_holds_live_default_relay() {
    let mut relay = MockRelay::start().await;
    let pool = test_pool(ConnectionStrategy::LazyKeep);
    pool.set_default_relays([&relay.url]).unwrap();

    tokio::time::sleep(QUIET).await;
    assert_eq!(relay.connections(), 0);

    let req = ForwardReq::with_id("feed");
    let sub = pool.use_req(&req, UseOptions::default()).unwrap();
    req.emit([Filter::new().kinds(vec![1])]);
    wait_state(&pool, &relay.url, ConnectionState::Connected).await;
    relay.next_of("REQ").await;

    drop(sub);
    relay.next_of("CLOSE").await;
    tokio::time::sleep(QUIET).await;
    assert_eq!(
        pool.get_relay_status(&relay.url).unwrap().connection,
        ConnectionState::Connected
    );

    // Leaving the default set makes it an ordinary idle relay.
    pool.remove_default_relay(&relay.url).unwrap();
    wait_state(&pool, &relay.url, ConnectionState::Dormant).await;
    assert_eq!(
        pool.get_relay_status(&relay.url).unwrap().role,
        RelayRole::Temporary
    );
    assert_eq!(relay.connections(), 1);
}

#[tokio::test]
async fn test_aggressive_opens_default_relays_eagerly() {
    let relay = MockRelay::start().await;
    let mut temporary = MockRelay::start().await;
    let pool = test_pool(ConnectionStrategy::Aggressive);
    pool.set_default_relays([&relay.url]).unwrap();

    wait_state(&pool, &relay.url, ConnectionState::Connected).await;
    assert_eq!(relay.connections(), 1);

    let req = ForwardReq::with_id("side");
    let sub = pool
        .use_req(
            &req,
            UseOptions {
                relays: Some(vec![temporary.url.clone()]),
            },
        )
        .unwrap();
    req.emit([Filter::new().kinds(vec![7])]);
    wait_state(&pool, &temporary.url, ConnectionState::Connected).await;
    temporary.next_of("REQ").await;

    drop(sub);
    temporary.next_of("CLOSE").await;
    wait_state(&pool, &temporary.url, ConnectionState::Dormant).await;
    assert_eq!(
        pool.get_relay_status(&relay.url).unwrap().connection,
        ConnectionState::Connected
    );
}

#[tokio::test]
async fn test_dormant_relay_reopens_on_new_demand() {
    let mut relay = MockRelay::start().await;
    let pool = test_pool(ConnectionStrategy::Lazy);
    pool.set_default_relays([&relay.url]).unwrap();

    let first = ForwardReq::with_id("first");
    let sub = pool.use_req(&first, UseOptions::default()).unwrap();
    first.emit([Filter::new().kinds(vec![1])]);
    relay.next_of("REQ").await;
    drop(sub);
    wait_state(&pool, &relay.url, ConnectionState::Dormant).await;

    let second = ForwardReq::with_id("second");
    let _sub = pool.use_req(&second, UseOptions::default()).unwrap();
    second.emit([Filter::new().kinds(vec![1])]);

    let frame = relay.next_of("REQ").await;
    assert_eq!(frame[1], "second:0");
    assert_eq!(relay.connections(), 2);
}

#[tokio::test]
async fn test_lazy_keep_scenario() {
    let mut default = MockRelay::start().await;
    let mut other = MockRelay::start().await;
    let pool = test_pool(ConnectionStrategy::LazyKeep);
    pool.set_default_relays([&default.url]).unwrap();

    let req = ForwardReq::with_id("note");
    let mut sub = pool.use_req(&req, UseOptions::default()).unwrap();
    req.emit([Filter::new().kinds(vec![1])]);
    assert_eq!(default.next_frame().await, json!(["REQ", "note:0", {"kinds": [1]}]));

    sub.unsubscribe();
    assert_eq!(default.next_frame().await, json!(["CLOSE", "note:0"]));
    tokio::time::sleep(QUIET).await;
    assert_eq!(
        pool.get_relay_status(&default.url).unwrap().connection,
        ConnectionState::Connected
    );

    let req = ForwardReq::with_id("note");
    let mut sub = pool
        .use_req(
            &req,
            UseOptions {
                relays: Some(vec![other.url.clone()]),
            },
        )
        .unwrap();
    req.emit([Filter::new().kinds(vec![1])]);
    assert_eq!(other.next_frame().await, json!(["REQ", "note:0", {"kinds": [1]}]));

    sub.unsubscribe();
    assert_eq!(other.next_frame().await, json!(["CLOSE", "note:0"]));
    wait_state(&pool, &other.url, ConnectionState::Dormant).await;
}

#[tokio::test]
async fn test_default_relay_with_demand_never_goes_dormant() {
    let mut default = MockRelay::start().await;
    let mut temporary = MockRelay::start().await;
    let pool = test_pool(ConnectionStrategy::LazyKeep);
    pool.set_default_relays([&default.url]).unwrap();

    let everywhere = ForwardReq::with_id("everywhere");
    let _kept = pool.use_req(&everywhere, UseOptions::default()).unwrap();
    everywhere.emit([Filter::new().kinds(vec![1])]);
    default.next_of("REQ").await;

    let side = ForwardReq::with_id("side");
    let side_sub = pool
        .use_req(
            &side,
            UseOptions {
                relays: Some(vec![temporary.url.clone(), default.url.clone()]),
            },
        )
        .unwrap();
    side.emit([Filter::new().kinds(vec![2])]);
    temporary.next_of("REQ").await;
    default.next_of("REQ").await;

    drop(side_sub);
    temporary.next_of("CLOSE").await;
    default.next_of("CLOSE").await;
    wait_state(&pool, &temporary.url, ConnectionState::Dormant).await;
    assert_eq!(
        pool.get_relay_status(&default.url).unwrap().connection,
        ConnectionState::Connected
    );
}

#[tokio::test]
async fn test_aggressive_migration_out_of_default_set() {
    let mut kept = MockRelay::start().await;
    let moved = MockRelay::start().await;
    let pool = test_pool(ConnectionStrategy::Aggressive);
    pool.set_default_relays([&kept.url, &moved.url]).unwrap();
    wait_state(&pool, &kept.url, ConnectionState::Connected).await;
    wait_state(&pool, &moved.url, ConnectionState::Connected).await;

    // Pinned to the relay that stays: no demand on the one that moves.
    let req = ForwardReq::with_id("pinned");
    let _sub = pool
        .use_req(
            &req,
            UseOptions {
                relays: Some(vec![kept.url.clone()]),
            },
        )
        .unwrap();
    req.emit([Filter::new().kinds(vec![1])]);
    kept.next_of("REQ").await;

    pool.set_default_relays([&kept.url]).unwrap();
    wait_state(&pool, &moved.url, ConnectionState::Dormant).await;
    assert_eq!(
        pool.get_relay_status(&moved.url).unwrap().role,
        RelayRole::Temporary
    );
    assert_eq!(
        pool.get_relay_status(&kept.url).unwrap().connection,
        ConnectionState::Connected
    );
}

#[tokio::test]
async fn test_migration_keeps_relay_with_independent_demand() {
    let mut relay = MockRelay::start().await;
    let pool = test_pool(ConnectionStrategy::Aggressive);
    pool.set_default_relays([&relay.url]).unwrap();
    wait_state(&pool, &relay.url, ConnectionState::Connected).await;

    let req = ForwardReq::with_id("own");
    let _sub = pool
        .use_req(
            &req,
            UseOptions {
                relays: Some(vec![relay.url.clone()]),
            },
        )
        .unwrap();
    req.emit([Filter::new().kinds(vec![1])]);
    relay.next_of("REQ").await;

    pool.set_default_relays(Vec::<String>::new()).unwrap();
    tokio::time::sleep(QUIET).await;
    assert_eq!(
        pool.get_relay_status(&relay.url).unwrap().connection,
        ConnectionState::Connected
    );
    relay.assert_quiet().await;
}

#[tokio::test]
async fn test_new_subscription_right_after_unsubscribe_reopens() {
    let mut relay = MockRelay::start().await;
    let pool = test_pool(ConnectionStrategy::Lazy);
    pool.set_default_relays([&relay.url]).unwrap();

    let first = ForwardReq::with_id("first");
    let mut sub = pool.use_req(&first, UseOptions::default()).unwrap();
    first.emit([Filter::new().kinds(vec![1])]);
    relay.next_of("REQ").await;

    // Same tick: the connection has not yet reported the dormant close.
    sub.unsubscribe();
    let second = ForwardReq::with_id("second");
    let _second = pool.use_req(&second, UseOptions::default()).unwrap();

    tokio::time::sleep(QUIET).await;
    wait_state(&pool, &relay.url, ConnectionState::Connected).await;
    assert_eq!(relay.connections(), 2);

    second.emit([Filter::new().kinds(vec![2])]);
    let frame = relay.next_of("REQ").await;
    assert_eq!(frame, json!(["REQ", "second:0", {"kinds": [2]}]));
}

#[tokio::test]
async fn test_publish_right_after_unsubscribe_reaches_relay() {
    let mut relay = MockRelay::start().await;
    let pool = test_pool(ConnectionStrategy::Lazy);
    pool.set_default_relays([&relay.url]).unwrap();

    let req = ForwardReq::with_id("feed");
    let mut sub = pool.use_req(&req, UseOptions::default()).unwrap();
    req.emit([Filter::new().kinds(vec![1])]);
    relay.next_of("REQ").await;

    sub.unsubscribe();
    let event = signed_event("still delivered");
    let mut oks = pool.send(event.clone(), SendOptions::default()).unwrap();

    let frame = relay.next_of("EVENT").await;
    assert_eq!(frame[1]["id"], event.id);
    relay.send(json!(["OK", event.id, true, ""]));

    let ok = timeout(WAIT, oks.recv()).await.unwrap().unwrap();
    assert!(ok.ok);
    wait_state(&pool, &relay.url, ConnectionState::Dormant).await;
}
