//! Integration tests for the feed engine: deduplication, initial-item
//! handling, fan-out isolation and the scheduled polling loop.
//!
//! Loop tests run on a paused clock and only use `example://` sources, so
//! no sleep in them takes real time.

use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use feedreader::feed::{
    DeliveryError, Envelope, Feed, FeedOptions, FeedState, FetchError, HttpClient, Subscriber,
    SYNTHETIC_OLD_ID,
};

fn client() -> HttpClient {
    HttpClient::new(0).unwrap()
}

fn manual_feed(url: &str, include_initial: bool) -> Feed {
    let options = FeedOptions {
        include_initial,
        autostart: false,
        ..FeedOptions::default()
    };
    Feed::new(url, options, client())
}

fn running_feed(url: &str, interval_secs: u64, include_initial: bool) -> Feed {
    let options = FeedOptions {
        interval: Duration::from_secs(interval_secs),
        include_initial,
        ..FeedOptions::default()
    };
    Feed::new(url, options, client())
}

fn drain(rx: &mut mpsc::Receiver<Envelope>) -> Vec<Envelope> {
    let mut out = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        out.push(envelope);
    }
    out
}

fn rss(items: &[(&str, &str, &str)]) -> String {
    let body: String = items
        .iter()
        .map(|(guid, title, date)| {
            format!(
                "<item><guid>{}</guid><title>{}</title><link>https://example.com/{}</link><pubDate>{}</pubDate></item>",
                guid, title, guid, date
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0"?><rss version="2.0"><channel><title>Test</title>{}</channel></rss>"#,
        body
    )
}

/// Always refuses delivery and counts the attempts.
struct BrokenSubscriber {
    attempts: Arc<AtomicUsize>,
}

impl Subscriber for BrokenSubscriber {
    fn try_deliver(&self, _envelope: Envelope) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(DeliveryError::Full)
    }
}

// ============================================================================
// Manual updates
// ============================================================================

#[tokio::test]
async fn test_unchanged_source_delivers_nothing() {
    let feed = manual_feed("example://static", false);
    let (_id, mut rx) = feed.subscribe_channel(16);

    assert!(feed.update().await.unwrap().is_empty());
    assert!(feed.update().await.unwrap().is_empty());
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_new_item_delivered_after_initial_discard() {
    let feed = manual_feed("example://test", false);
    let (_id, mut rx) = feed.subscribe_channel(16);

    assert!(feed.update().await.unwrap().is_empty());

    let fresh = feed.update().await.unwrap();
    assert_eq!(fresh.len(), 1);
    assert_ne!(fresh[0].identity(), SYNTHETIC_OLD_ID);

    let delivered = drain(&mut rx);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].item, fresh[0]);
    assert_eq!(delivered[0].feed, feed);
}

#[tokio::test]
async fn test_include_initial_delivers_first_batch() {
    let feed = manual_feed("example://static", true);
    let (_id, mut rx) = feed.subscribe_channel(16);

    let first = feed.update().await.unwrap();
    assert_eq!(first.len(), 2);
    let ids: HashSet<String> = first.iter().map(|item| item.identity()).collect();
    assert!(ids.contains(SYNTHETIC_OLD_ID));

    assert!(feed.update().await.unwrap().is_empty());
    assert_eq!(drain(&mut rx).len(), 2);
}

#[tokio::test]
async fn test_each_identity_delivered_at_most_once() {
    let feed = manual_feed("example://test", true);
    let (_id, mut rx) = feed.subscribe_channel(64);

    for _ in 0..5 {
        feed.update().await.unwrap();
    }

    let delivered = drain(&mut rx);
    // old_id once, plus one fresh id per call.
    assert_eq!(delivered.len(), 6);
    let ids: HashSet<String> = delivered.iter().map(|e| e.item.identity()).collect();
    assert_eq!(ids.len(), delivered.len());
}

#[tokio::test]
async fn test_concurrent_updates_do_not_duplicate() {
    let feed = manual_feed("example://static", true);
    let (_id, mut rx) = feed.subscribe_channel(16);

    let (a, b) = tokio::join!(feed.update(), feed.update());
    assert_eq!(a.unwrap().len() + b.unwrap().len(), 2);
    assert_eq!(drain(&mut rx).len(), 2);
}

#[tokio::test]
async fn test_failed_update_returns_error() {
    let feed = manual_feed("example://failing", true);
    assert!(matches!(
        feed.update().await,
        Err(FetchError::Synthetic(_))
    ));

    let feed = manual_feed("gopher://example.com/feed", true);
    assert!(matches!(
        feed.update().await,
        Err(FetchError::UnsupportedScheme { .. })
    ));
}

// ============================================================================
// Fan-out
// ============================================================================

#[tokio::test]
async fn test_broken_subscribers_do_not_affect_others() {
    let feed = manual_feed("example://static", true);

    let (good_tx, mut good_rx) = mpsc::unbounded_channel();
    feed.subscribe(good_tx);

    let (_small_id, mut small_rx) = feed.subscribe_channel(1);

    let (_closed_id, closed_rx) = feed.subscribe_channel(4);
    drop(closed_rx);

    let attempts = Arc::new(AtomicUsize::new(0));
    feed.subscribe(BrokenSubscriber {
        attempts: Arc::clone(&attempts),
    });

    let fresh = feed.update().await.unwrap();
    assert_eq!(fresh.len(), 2);

    let mut good = Vec::new();
    while let Ok(envelope) = good_rx.try_recv() {
        good.push(envelope);
    }
    assert_eq!(good.len(), 2);
    assert_eq!(drain(&mut small_rx).len(), 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_items_delivered_in_order_to_every_subscriber() {
    let feed = manual_feed("example://static", true);
    let (_a, mut rx_a) = feed.subscribe_channel(8);
    let (_b, mut rx_b) = feed.subscribe_channel(8);

    let fresh = feed.update().await.unwrap();

    let ids_a: Vec<String> = drain(&mut rx_a).iter().map(|e| e.item.identity()).collect();
    let ids_b: Vec<String> = drain(&mut rx_b).iter().map(|e| e.item.identity()).collect();
    let expected: Vec<String> = fresh.iter().map(|item| item.identity()).collect();
    assert_eq!(ids_a, expected);
    assert_eq!(ids_b, expected);
}

#[tokio::test]
async fn test_unsubscribed_queue_stops_receiving() {
    let feed = manual_feed("example://test", true);
    let (kept, mut kept_rx) = feed.subscribe_channel(16);
    let (removed, mut removed_rx) = feed.subscribe_channel(16);

    feed.update().await.unwrap();
    assert_eq!(drain(&mut removed_rx).len(), 2);

    assert!(feed.unsubscribe(removed));
    feed.update().await.unwrap();

    assert!(drain(&mut removed_rx).is_empty());
    assert_eq!(drain(&mut kept_rx).len(), 3);
    assert_ne!(kept, removed);
}

#[tokio::test]
async fn test_subscribers_of_different_feeds_are_separate() {
    let first = manual_feed("example://static", true);
    let second = manual_feed("example://static", true);
    let (tx, mut rx) = mpsc::channel(16);
    first.subscribe(tx.clone());
    second.subscribe(tx);

    first.update().await.unwrap();
    second.update().await.unwrap();

    let delivered = drain(&mut rx);
    assert_eq!(delivered.len(), 4);
    assert_eq!(delivered.iter().filter(|e| e.feed == first).count(), 2);
    assert_eq!(delivered.iter().filter(|e| e.feed == second).count(), 2);
}

// ============================================================================
// Remote feeds
// ============================================================================

#[tokio::test]
async fn test_remote_feed_delivers_new_entries_in_date_order() {
    let server = MockServer::start().await;
    let url = format!("{}/rss", server.uri());

    Mock::given(method("GET"))
        .and(path("/rss"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss(&[
            ("b", "Second", "Tue, 02 Jan 2024 00:00:00 +0000"),
            ("a", "First", "Mon, 01 Jan 2024 00:00:00 +0000"),
        ])))
        .mount(&server)
        .await;

    let feed = manual_feed(&url, true);
    let (_id, mut rx) = feed.subscribe_channel(16);

    let first = feed.update().await.unwrap();
    let titles: Vec<Option<String>> = first.iter().map(|item| item.title.clone()).collect();
    assert_eq!(
        titles,
        vec![Some("First".to_string()), Some("Second".to_string())]
    );

    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/rss"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss(&[
            ("c", "Third", "Wed, 03 Jan 2024 00:00:00 +0000"),
            ("b", "Second", "Tue, 02 Jan 2024 00:00:00 +0000"),
            ("a", "First", "Mon, 01 Jan 2024 00:00:00 +0000"),
        ])))
        .mount(&server)
        .await;

    let second = feed.update().await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].identity(), "c");
    assert_eq!(drain(&mut rx).len(), 3);
}

#[tokio::test]
async fn test_remote_failure_keeps_seen_state() {
    let server = MockServer::start().await;
    let url = format!("{}/rss", server.uri());

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let feed = manual_feed(&url, false);
    assert!(matches!(
        feed.update().await,
        Err(FetchError::HttpStatus(500))
    ));

    server.reset().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss(&[(
            "a",
            "First",
            "Mon, 01 Jan 2024 00:00:00 +0000",
        )])))
        .mount(&server)
        .await;

    // The failed call did not consume the initial discard.
    assert!(feed.update().await.unwrap().is_empty());
    assert!(feed.update().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_item_missed_during_failure_is_delivered_after_recovery() {
    let server = MockServer::start().await;
    let url = format!("{}/rss", server.uri());

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss(&[(
            "a",
            "First",
            "Mon, 01 Jan 2024 00:00:00 +0000",
        )])))
        .mount(&server)
        .await;

    let feed = manual_feed(&url, true);
    let (_id, mut rx) = feed.subscribe_channel(16);
    assert_eq!(feed.update().await.unwrap().len(), 1);

    server.reset().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    assert!(matches!(
        feed.update().await,
        Err(FetchError::HttpStatus(503))
    ));

    server.reset().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss(&[
            ("b", "Second", "Tue, 02 Jan 2024 00:00:00 +0000"),
            ("a", "First", "Mon, 01 Jan 2024 00:00:00 +0000"),
        ])))
        .mount(&server)
        .await;

    let recovered = feed.update().await.unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].identity(), "b");
    assert!(feed.update().await.unwrap().is_empty());

    let ids: Vec<String> = drain(&mut rx).iter().map(|e| e.item.identity()).collect();
    assert_eq!(ids, vec!["a", "b"]);
}

// ============================================================================
// Scheduled loop
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_loop_delivers_new_items_each_interval() {
    let feed = running_feed("example://test", 300, false);
    let (_id, mut rx) = feed.subscribe_channel(16);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(drain(&mut rx).is_empty());
    assert_eq!(feed.state(), FeedState::Sleeping);

    tokio::time::sleep(Duration::from_secs(300)).await;
    let delivered = drain(&mut rx);
    assert_eq!(delivered.len(), 1);
    assert_ne!(delivered[0].item.identity(), SYNTHETIC_OLD_ID);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(drain(&mut rx).len(), 1);

    feed.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_loop_includes_initial_items() {
    let feed = running_feed("example://static", 60, true);
    let (_id, mut rx) = feed.subscribe_channel(16);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(drain(&mut rx).len(), 2);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(drain(&mut rx).is_empty());

    feed.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_failing_feed_retries_after_ceiling() {
    let feed = running_feed("example://failing", 300, false);
    let (_id, _rx) = feed.subscribe_channel(16);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(feed.consecutive_failures(), 1);
    assert_eq!(feed.state(), FeedState::RetryWait);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(feed.consecutive_failures(), 2);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(feed.consecutive_failures(), 3);
    assert!(feed.is_running());

    feed.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_short_interval_bounds_retry_delay() {
    let feed = running_feed("example://failing", 10, false);
    let (_id, _rx) = feed.subscribe_channel(16);

    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(feed.consecutive_failures(), 3);

    feed.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_unsupported_scheme_keeps_retrying() {
    let feed = running_feed("ftp://example.com/feed", 300, false);
    let (_id, _rx) = feed.subscribe_channel(16);

    tokio::time::sleep(Duration::from_secs(130)).await;
    assert_eq!(feed.consecutive_failures(), 3);
    assert!(feed.is_running());

    feed.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribed_feed_waits_without_polling() {
    let feed = running_feed("example://static", 300, true);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(feed.state(), FeedState::Idle);

    // Had the loop polled while idle, these items would already be seen.
    let (_id, mut rx) = feed.subscribe_channel(16);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(drain(&mut rx).len(), 2);

    feed.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_ends_loop_during_sleep() {
    let feed = running_feed("example://static", 300, false);
    let (_id, _rx) = feed.subscribe_channel(16);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(feed.is_running());
    assert!(!feed.start(), "loop is already running");

    feed.stop().await;
    assert!(!feed.is_running());
    assert_eq!(feed.state(), FeedState::Stopped);
    assert!(!feed.start(), "stopped feed must not restart");
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_ends_loop_during_retry_wait() {
    let feed = running_feed("example://failing", 300, false);
    let (_id, _rx) = feed.subscribe_channel(16);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(feed.state(), FeedState::RetryWait);

    feed.shutdown();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!feed.is_running());
    assert_eq!(feed.state(), FeedState::Stopped);
    assert_eq!(feed.consecutive_failures(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_healthy_feed_reports_no_failures() {
    let feed = running_feed("example://static", 300, false);
    let (_id, _rx) = feed.subscribe_channel(16);

    tokio::time::sleep(Duration::from_secs(301)).await;
    assert_eq!(feed.consecutive_failures(), 0);
    assert_eq!(feed.state(), FeedState::Sleeping);

    feed.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_manual_feed_can_be_started_later() {
    let feed = manual_feed("example://static", true);
    let (_id, mut rx) = feed.subscribe_channel(16);
    assert_eq!(feed.state(), FeedState::Manual);

    assert!(feed.start());
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(drain(&mut rx).len(), 2);
    assert_eq!(feed.state(), FeedState::Sleeping);

    feed.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_interval_change_applies_after_current_sleep() {
    let feed = running_feed("example://test", 300, false);
    let (_id, mut rx) = feed.subscribe_channel(16);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(feed.state(), FeedState::Sleeping);
    feed.set_interval(Duration::from_secs(10));

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(drain(&mut rx).is_empty());

    tokio::time::sleep(Duration::from_secs(280)).await;
    assert_eq!(drain(&mut rx).len(), 1);

    // From here on the shorter interval is used.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(drain(&mut rx).len(), 1);

    feed.stop().await;
}
