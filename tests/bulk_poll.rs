use job_locker::DEFAULT_MAXIMUM_QUEUE_SIZE;
use tokio::time::{Duration, Instant};

use crate::helpers::with_test_db;

mod helpers;

#[tokio::test]
async fn drains_a_backlog_larger_than_the_queue() {
    with_test_db(|test_db| async move {
        // Far more due jobs than the queue can hold at once: the startup
        // poll must keep re-polling while batches come back full, and
        // completions below the low-water mark keep demand polls coming.
        let backlog = 100;
        assert!(backlog > DEFAULT_MAXIMUM_QUEUE_SIZE as i64);
        test_db.insert_jobs(backlog, 100, "demo").await;

        let locker = test_db
            .locker_options()
            .start()
            .await
            .expect("Failed to start locker");

        let start = Instant::now();
        while test_db.count_jobs().await > 0 {
            if start.elapsed() > Duration::from_secs(15) {
                panic!(
                    "Backlog should have drained, {} jobs left",
                    test_db.count_jobs().await
                );
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        locker.stop_and_wait().await;
        assert!(locker.held_locks().is_empty());
        assert!(test_db.get_lockers().await.is_empty());
    })
    .await;
}

#[tokio::test]
async fn periodic_polling_picks_up_late_arrivals() {
    with_test_db(|test_db| async move {
        // Notifications off: only the timer can discover this work.
        let locker = test_db
            .locker_options()
            .listen(false)
            .poll_interval(Duration::from_millis(100))
            .start()
            .await
            .expect("Failed to start locker");

        test_db.insert_jobs(5, 50, "demo").await;

        let start = Instant::now();
        while test_db.count_jobs().await > 0 {
            if start.elapsed() > Duration::from_secs(5) {
                panic!("Periodic poll should have found the jobs");
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        locker.stop_and_wait().await;
    })
    .await;
}

#[tokio::test]
async fn future_jobs_are_left_alone() {
    with_test_db(|test_db| async move {
        let run_at = chrono::Utc::now() + chrono::Duration::hours(1);
        test_db.insert_job(5, run_at, "demo").await;

        let locker = test_db
            .locker_options()
            .listen(false)
            .poll_interval(Duration::from_millis(50))
            .start()
            .await
            .expect("Failed to start locker");

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(test_db.count_jobs().await, 1);
        assert!(locker.held_locks().is_empty());

        locker.stop_and_wait().await;
    })
    .await;
}
