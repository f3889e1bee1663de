#[cfg(test)]
mod integration_tests_of_timer {
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::{atomic, Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};
    use wait_run_done::{Handle, Pool, TaskPanic, Timer};

    fn fixture(workers: usize, capacity: usize) -> (Arc<Pool>, Timer) {
        let pool = Arc::new(Pool::new(workers));
        let timer = Timer::new(Arc::clone(&pool), capacity);
        (pool, timer)
    }

    #[test]
    fn earlier_deadlines_finish_first() {
        let (_pool, timer) = fixture(2, 16);
        let slow = timer.add_delayed_task(Duration::from_millis(200), || {});
        let fast = timer.add_delayed_task(Duration::from_millis(100), || {});

        let start = Instant::now();
        while !fast.is_done() {
            assert!(start.elapsed() < Duration::from_secs(2));
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!slow.is_done());

        while !slow.is_done() {
            assert!(start.elapsed() < Duration::from_secs(2));
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn cancel_from_outside_waits_for_the_running_body() {
        let (_pool, timer) = fixture(1, 4);
        let handle = timer.add_delayed_task(Duration::from_millis(50), || {
            thread::sleep(Duration::from_millis(500));
        });

        thread::sleep(Duration::from_millis(150));
        assert!(handle.is_running());

        let start = Instant::now();
        assert_eq!(handle.cancel(), false);
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert!(handle.is_done());
    }

    #[test]
    fn cancel_from_inside_the_body_wins() {
        let (_pool, timer) = fixture(1, 4);
        let slot: Arc<Mutex<Option<Handle>>> = Arc::new(Mutex::new(None));
        let accepted = Arc::new(atomic::AtomicBool::new(false));

        let slot_clone = Arc::clone(&slot);
        let accepted_clone = Arc::clone(&accepted);
        let handle = timer.add_delayed_task(Duration::from_millis(100), move || {
            if let Some(own_handle) = slot_clone.lock().unwrap().as_ref() {
                accepted_clone.store(own_handle.cancel(), atomic::Ordering::Release);
            }
        });
        *slot.lock().unwrap() = Some(handle);

        thread::sleep(Duration::from_millis(400));
        assert!(accepted.load(atomic::Ordering::Acquire));
        assert!(slot.lock().unwrap().as_ref().unwrap().is_cancelled());
    }

    #[test]
    fn restart_moves_the_due_time_forward() {
        let (_pool, timer) = fixture(1, 4);
        let ran = Arc::new(atomic::AtomicBool::new(false));

        let ran_clone = Arc::clone(&ran);
        let handle = timer.add_delayed_task(Duration::from_millis(500), move || {
            ran_clone.store(true, atomic::Ordering::Release);
        });

        thread::sleep(Duration::from_millis(100));
        assert!(handle.restart());

        thread::sleep(Duration::from_millis(440));
        assert!(handle.is_waiting());
        assert!(!ran.load(atomic::Ordering::Acquire));

        thread::sleep(Duration::from_millis(300));
        assert!(handle.is_done());
        assert!(ran.load(atomic::Ordering::Acquire));
    }

    #[test]
    fn restart_while_running_runs_the_body_again() {
        let (_pool, timer) = fixture(1, 4);
        let runs = Arc::new(atomic::AtomicUsize::new(0));

        let runs_clone = Arc::clone(&runs);
        let handle = timer.add_delayed_task(Duration::from_millis(50), move || {
            runs_clone.fetch_add(1, atomic::Ordering::AcqRel);
            thread::sleep(Duration::from_millis(200));
        });

        thread::sleep(Duration::from_millis(150));
        assert!(handle.is_running());
        assert!(handle.restart());

        thread::sleep(Duration::from_millis(250));
        assert_eq!(runs.load(atomic::Ordering::Acquire), 2);

        thread::sleep(Duration::from_millis(300));
        assert!(handle.is_done());
        assert_eq!(runs.load(atomic::Ordering::Acquire), 2);
    }

    #[test]
    fn a_failed_task_rethrows_the_same_payload() {
        let (_pool, timer) = fixture(1, 4);
        let handle = timer.add_delayed_task(Duration::from_millis(50), || {
            panic::panic_any(7i32);
        });

        thread::sleep(Duration::from_millis(300));

        let raised = panic::catch_unwind(AssertUnwindSafe(|| handle.is_done())).unwrap_err();
        let raised = raised.downcast::<TaskPanic>().unwrap();
        assert_eq!(
            raised.with(|payload| payload.downcast_ref::<i32>().copied()),
            Some(7),
        );

        let raised = panic::catch_unwind(AssertUnwindSafe(|| handle.restart())).unwrap_err();
        let raised = raised.downcast::<TaskPanic>().unwrap();
        assert_eq!(
            raised.with(|payload| payload.downcast_ref::<i32>().copied()),
            Some(7),
        );
    }

    #[test]
    fn dropping_the_handle_cancels_a_waiting_task() {
        let (_pool, timer) = fixture(1, 4);
        let ran = Arc::new(atomic::AtomicBool::new(false));

        let ran_clone = Arc::clone(&ran);
        let handle = timer.add_delayed_task(Duration::from_millis(200), move || {
            ran_clone.store(true, atomic::Ordering::Release);
        });
        drop(handle);

        thread::sleep(Duration::from_millis(400));
        assert!(!ran.load(atomic::Ordering::Acquire));
    }

    #[test]
    fn dropping_the_timer_cancels_queued_tasks() {
        let pool = Arc::new(Pool::new(1));
        let handle;
        {
            let timer = Timer::new(Arc::clone(&pool), 4);
            handle = timer.add_delayed_task(Duration::from_secs(10), || {});
        }
        assert!(handle.is_cancelled());
    }

    #[test]
    fn a_full_queue_cancels_the_newcomer() {
        let (_pool, timer) = fixture(1, 1);
        let first = timer.add_delayed_task(Duration::from_secs(5), || {});
        let second = timer.add_delayed_task(Duration::from_secs(5), || {});

        assert!(first.is_waiting());
        assert!(second.is_cancelled());
        assert_eq!(second.delay(), Duration::from_secs(5));
    }

    fn held_predicates(handle: &Handle) -> usize {
        [
            handle.is_waiting(),
            handle.is_running(),
            handle.is_done(),
            handle.is_cancelled(),
        ]
        .iter()
        .filter(|held| **held)
        .count()
    }

    #[test]
    fn exactly_one_status_predicate_holds() {
        let (_pool, timer) = fixture(1, 4);
        let handle = timer.add_delayed_task(Duration::from_millis(200), || {});

        assert!(handle.is_waiting());
        assert_eq!(held_predicates(&handle), 1);

        let start = Instant::now();
        while !handle.is_done() {
            assert!(start.elapsed() < Duration::from_secs(2));
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(held_predicates(&handle), 1);

        // A finished task may still be cancelled.
        assert!(handle.cancel());
        assert!(handle.is_cancelled());
        assert_eq!(held_predicates(&handle), 1);
    }
}
