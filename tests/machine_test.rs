#[cfg(test)]
mod integration_tests_of_machine {
    use std::sync::atomic;
    use std::sync::Arc;
    use std::{thread, time};
    use wait_run_done::{Machine, Transition};

    enum Lineage {
        Child,
        BadChild,
    }

    fn foo(phase: &Lineage) -> Transition<Lineage> {
        match phase {
            Lineage::Child => Transition::Reject,
            Lineage::BadChild => Transition::Accept,
        }
    }

    fn oops(phase: &Lineage) -> Transition<Lineage> {
        match phase {
            Lineage::Child => Transition::swap(Lineage::BadChild),
            Lineage::BadChild => Transition::swap(Lineage::Child),
        }
    }

    #[test]
    fn dispatches_on_the_current_phase() {
        let machine = Machine::new(Lineage::Child);

        assert_eq!(machine.call(|phase, _changed| foo(phase)), false);
        assert_eq!(machine.call(|phase, _changed| oops(phase)), true);
        assert_eq!(machine.call(|phase, _changed| foo(phase)), true);
    }

    enum Claim {
        Free,
        Taken(usize),
    }

    #[test]
    fn exactly_one_racing_claim_wins() {
        let machine = Arc::new(Machine::new(Claim::Free));
        let accepted = Arc::new(atomic::AtomicUsize::new(0));

        let mut join_handlers = Vec::<thread::JoinHandle<_>>::new();
        for i in 0..8 {
            let machine_clone = Arc::clone(&machine);
            let accepted_clone = Arc::clone(&accepted);
            let handler = thread::spawn(move || {
                let won = machine_clone.call(|phase, _changed| match phase {
                    Claim::Free => Transition::swap(Claim::Taken(i)),
                    Claim::Taken(_) => Transition::Reject,
                });
                if won {
                    accepted_clone.fetch_add(1, atomic::Ordering::AcqRel);
                }
            });
            join_handlers.push(handler);
        }
        while join_handlers.len() > 0 {
            let _ = match join_handlers.remove(0).join() {
                Ok(_) => (),
                Err(e) => panic!("{e:?}"),
            };
        }

        assert_eq!(accepted.load(atomic::Ordering::Acquire), 1);
        assert!(machine.inspect(|phase| match phase {
            Claim::Taken(winner) => *winner < 8,
            Claim::Free => false,
        }));
    }

    #[test]
    fn a_suspended_call_does_not_install_over_a_newer_phase() {
        let machine = Arc::new(Machine::new(Lineage::Child));

        let machine_clone = Arc::clone(&machine);
        let handler = thread::spawn(move || {
            machine_clone.call(|_phase, changed| {
                changed.wait();
                Transition::swap(Lineage::Child)
            })
        });

        thread::sleep(time::Duration::from_millis(100));
        assert!(machine.call(|phase, _changed| oops(phase)));
        machine.notify_all();

        match handler.join() {
            Ok(accepted) => assert!(accepted),
            Err(e) => panic!("{e:?}"),
        }

        // Still the phase the unsuspended thread installed.
        assert_eq!(machine.call(|phase, _changed| foo(phase)), true);
    }
}
