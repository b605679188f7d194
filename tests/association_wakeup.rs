//! Long-poll wakeup latency through the association notifier.

use gardisto::keybase::Notifier;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn approve_wakes_waiters_promptly() {
    let notifier = Arc::new(Notifier::new());
    let (_id, mut wake) = notifier.register("assoc-1");

    let publisher = Arc::clone(&notifier);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        publisher.notify("assoc-1");
    });

    // A waiting long-poll must observe the approval well inside its 3 s
    // poll interval.
    let woke = tokio::time::timeout(Duration::from_millis(100), wake.recv()).await;
    assert!(woke.is_ok(), "notifier wakeup took longer than 100ms");
}

#[tokio::test]
async fn waiters_on_other_tokens_stay_asleep() {
    let notifier = Notifier::new();
    let (_id, mut wake) = notifier.register("assoc-1");

    notifier.notify("assoc-2");

    let woke = tokio::time::timeout(Duration::from_millis(50), wake.recv()).await;
    assert!(woke.is_err(), "waiter woke for an unrelated association");
}
