//! Integration tests for mukernel
//!
//! Every test boots a real kernel on a manual clock, so scheduling is
//! deterministic: a timeslice only expires when a test advances the clock.

use std::sync::Arc;
use std::time::Duration;

use mukernel::*;
use parking_lot::Mutex;

const STACK: usize = MIN_STACK;

type Log = Arc<Mutex<Vec<String>>>;

fn boot_with(config: KernelConfig) -> (Kernel, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let kernel = Kernel::with_clock(config, clock.clone()).unwrap();
    (kernel, clock)
}

fn boot() -> (Kernel, Arc<ManualClock>) {
    boot_with(KernelConfig::default())
}

fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn note(log: &Log, entry: impl Into<String>) {
    log.lock().push(entry.into());
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().clone()
}

fn fatal_message(result: KernelResult<i32>) -> String {
    match result {
        Err(KernelError::Fatal(message)) => message,
        other => panic!("expected a fatal halt, got {:?}", other),
    }
}

mod boot_tests {
    use super::*;

    #[test]
    fn test_main_status_is_returned() {
        let (kernel, _) = boot();
        assert_eq!(kernel.run(|_| 42), Ok(42));
    }

    #[test]
    fn test_run_only_once() {
        let (kernel, _) = boot();
        assert_eq!(kernel.run(|_| 0), Ok(0));
        assert_eq!(kernel.run(|_| 0), Err(KernelError::AlreadyStarted));
    }

    #[test]
    fn test_services_run_before_main() {
        let (kernel, _) = boot();
        let log = new_log();

        let (l1, l2, l3) = (log.clone(), log.clone(), log.clone());
        let services: Vec<ServiceHook> = vec![
            Box::new(move |k: &Kernel| note(&l1, format!("service 1 in {}", k.getpid()))),
            Box::new(move |k: &Kernel| note(&l2, format!("service 2 in {}", k.getpid()))),
        ];

        let status = kernel.run_with_services(services, move |k| {
            note(&l3, format!("main is {}", k.getpid()));
            0
        });

        assert_eq!(status, Ok(0));
        assert_eq!(
            entries(&log),
            vec!["service 1 in 1", "service 2 in 1", "main is 3"]
        );
    }

    #[test]
    fn test_blocking_init_is_fatal() {
        let (kernel, _) = boot();
        let services: Vec<ServiceHook> = vec![Box::new(|k: &Kernel| k.block_me(20))];
        let message = fatal_message(kernel.run_with_services(services, |_| 0));
        assert!(message.contains("init"), "{}", message);
    }

    #[test]
    fn test_deadlock_detected() {
        let (kernel, _) = boot();
        let result = kernel.run(|k| {
            k.block_me(30);
            0
        });
        assert_eq!(result, Err(KernelError::Deadlock));
    }

    #[test]
    fn test_panic_in_process_halts() {
        let (kernel, _) = boot();
        let result = kernel.run(|_| panic!("boom"));
        match result {
            Err(KernelError::ProcessPanicked { pid, message }) => {
                assert_eq!(pid, 3);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_independent_kernels() {
        let (a, _) = boot();
        let (b, _) = boot();

        let other = b.clone();
        let handle = std::thread::spawn(move || other.run(|_| 2));
        assert_eq!(a.run(|_| 1), Ok(1));
        assert_eq!(handle.join().unwrap(), Ok(2));
    }
}

mod process_tests {
    use super::*;

    #[test]
    fn test_family_order() {
        let (kernel, _) = boot();
        let log = new_log();
        let l = log.clone();

        let status = kernel.run(move |k| {
            let l1 = l.clone();
            let p1 = k
                .fork("P1", STACK, 3, move |k| {
                    let l2 = l1.clone();
                    let p2 = k
                        .fork("P2", STACK, 3, move |_| {
                            note(&l2, "P2 ran");
                            2
                        })
                        .unwrap();

                    let l3 = l1.clone();
                    let p3 = k
                        .fork("P3", STACK, 1, move |_| {
                            note(&l3, "P3 ran");
                            3
                        })
                        .unwrap();
                    note(&l1, "P1 forked both");

                    assert_eq!(k.join(), Ok((p3, 3)));
                    note(&l1, "P1 joined P3");
                    assert_eq!(k.join(), Ok((p2, 2)));
                    note(&l1, "P1 joined P2");
                    assert_eq!(k.join(), Err(ProcessError::NoChildren));
                    note(&l1, "P1 has no children");
                    1
                })
                .unwrap();

            assert_eq!(k.join(), Ok((p1, 1)));
            0
        });

        assert_eq!(status, Ok(0));
        assert_eq!(
            entries(&log),
            vec![
                "P3 ran",
                "P2 ran",
                "P1 forked both",
                "P1 joined P3",
                "P1 joined P2",
                "P1 has no children",
            ]
        );
    }

    #[test]
    fn test_higher_priority_child_runs_first() {
        let (kernel, _) = boot();
        let log = new_log();
        let l = log.clone();

        let status = kernel.run(move |k| {
            let (low, high) = (l.clone(), l.clone());
            k.fork("low", STACK, 5, move |_| {
                note(&low, "low");
                0
            })
            .unwrap();
            note(&l, "after low fork");
            k.fork("high", STACK, 2, move |_| {
                note(&high, "high");
                0
            })
            .unwrap();
            note(&l, "after high fork");

            k.join().unwrap();
            k.join().unwrap();
            0
        });

        assert_eq!(status, Ok(0));
        assert_eq!(
            entries(&log),
            vec!["after low fork", "high", "after high fork", "low"]
        );
    }

    #[test]
    fn test_join_without_children() {
        let (kernel, _) = boot();
        let status = kernel.run(|k| {
            let err = k.join().unwrap_err();
            assert_eq!(err, ProcessError::NoChildren);
            err.code()
        });
        assert_eq!(status, Ok(-2));
    }

    #[test]
    fn test_fork_validation() {
        let (kernel, _) = boot();
        let status = kernel.run(|k| {
            let long_name = "x".repeat(MAX_NAME + 1);
            assert_eq!(
                k.fork("", STACK, 3, |_| 0),
                Err(ProcessError::InvalidName(String::new()))
            );
            assert!(matches!(
                k.fork(&long_name, STACK, 3, |_| 0),
                Err(ProcessError::InvalidName(_))
            ));

            let small = k.fork("small", 1024, 3, |_| 0).unwrap_err();
            assert_eq!(small, ProcessError::StackTooSmall(1024, MIN_STACK));
            assert_eq!(small.code(), -2);

            assert_eq!(
                k.fork("init2", STACK, 0, |_| 0),
                Err(ProcessError::InvalidPriority(0))
            );
            assert_eq!(
                k.fork("idle2", STACK, 7, |_| 0),
                Err(ProcessError::InvalidPriority(7))
            );
            assert_eq!(ProcessError::InvalidPriority(7).code(), -1);
            0
        });
        assert_eq!(status, Ok(0));
    }

    #[test]
    fn test_process_table_full() {
        let config = KernelConfig {
            max_processes: 5,
            ..KernelConfig::default()
        };
        let (kernel, _) = boot_with(config);

        let status = kernel.run(|k| {
            // init, idle and main already hold three slots
            assert!(k.fork("a", STACK, 5, |_| 0).is_ok());
            assert!(k.fork("b", STACK, 5, |_| 0).is_ok());
            assert_eq!(k.fork("c", STACK, 5, |_| 0), Err(ProcessError::TableFull));

            k.join().unwrap();
            k.join().unwrap();

            // joined slots are free again
            assert!(k.fork("d", STACK, 5, |_| 0).is_ok());
            k.join().unwrap();
            0
        });
        assert_eq!(status, Ok(0));
    }

    #[test]
    fn test_zap_wakes_every_zapper() {
        let (kernel, _) = boot();
        let log = new_log();
        let l = log.clone();

        let status = kernel.run(move |k| {
            let lt = l.clone();
            let target = k
                .fork("target", STACK, 5, move |k| {
                    note(&lt, format!("target zapped: {}", k.is_zapped()));
                    0
                })
                .unwrap();

            for name in ["z1", "z2"] {
                let lz = l.clone();
                k.fork(name, STACK, 2, move |k| {
                    k.zap(target);
                    note(&lz, format!("{} woke", name));
                    0
                })
                .unwrap();
            }
            note(&l, "zappers parked");

            for _ in 0..3 {
                k.join().unwrap();
            }
            0
        });

        assert_eq!(status, Ok(0));
        let log = entries(&log);
        assert_eq!(log[0], "zappers parked");
        assert_eq!(log[1], "target zapped: true");
        let mut woken = log[2..].to_vec();
        woken.sort();
        assert_eq!(woken, vec!["z1 woke", "z2 woke"]);
    }

    #[test]
    fn test_zap_self_is_fatal() {
        let (kernel, _) = boot();
        let message = fatal_message(kernel.run(|k| {
            k.zap(k.getpid());
            0
        }));
        assert!(message.contains("itself"), "{}", message);
    }

    #[test]
    fn test_zap_init_is_fatal() {
        let (kernel, _) = boot();
        let message = fatal_message(kernel.run(|k| {
            k.zap(BOOTSTRAP_PID);
            0
        }));
        assert!(message.contains("init"), "{}", message);
    }

    #[test]
    fn test_block_and_unblock() {
        let (kernel, _) = boot();
        let log = new_log();
        let l = log.clone();

        let status = kernel.run(move |k| {
            let lw = l.clone();
            let waiter = k
                .fork("waiter", STACK, 2, move |k| {
                    note(&lw, "waiter blocking");
                    k.block_me(42);
                    note(&lw, "waiter resumed");
                    0
                })
                .unwrap();

            let dump = k.dump_processes();
            assert_eq!(
                dump.get(waiter).map(|p| p.state),
                Some(ProcessState::Blocked(BlockReason::Other(42)))
            );
            assert_eq!(dump.get(k.getpid()).map(|p| p.state), Some(ProcessState::Running));
            assert_eq!(
                dump.get(BOOTSTRAP_PID).map(|p| p.state),
                Some(ProcessState::Blocked(BlockReason::WaitingForChild))
            );

            assert_eq!(k.unblock_proc(k.getpid()), Err(ProcessError::NotBlocked(k.getpid())));
            assert_eq!(k.unblock_proc(999), Err(ProcessError::NotBlocked(999)));
            assert_eq!(
                k.unblock_proc(BOOTSTRAP_PID),
                Err(ProcessError::NotBlocked(BOOTSTRAP_PID))
            );

            k.unblock_proc(waiter).unwrap();
            note(&l, "main after unblock");
            k.join().unwrap();
            0
        });

        assert_eq!(status, Ok(0));
        assert_eq!(
            entries(&log),
            vec!["waiter blocking", "waiter resumed", "main after unblock"]
        );
    }

    #[test]
    fn test_unblock_runnable_is_fatal() {
        let (kernel, _) = boot();
        let message = fatal_message(kernel.run(|k| {
            let child = k.fork("ready", STACK, 5, |_| 0).unwrap();
            let _ = k.unblock_proc(child);
            0
        }));
        assert!(message.contains("already runnable"), "{}", message);
    }

    #[test]
    fn test_reserved_block_reason_is_fatal() {
        let (kernel, _) = boot();
        let message = fatal_message(kernel.run(|k| {
            k.block_me(MAX_RESERVED_BLOCK);
            0
        }));
        assert!(message.contains("reserved"), "{}", message);
    }

    #[test]
    fn test_quit_with_children_is_fatal() {
        let (kernel, _) = boot();
        let message = fatal_message(kernel.run(|k| {
            k.fork("orphan", STACK, 5, |_| 0).unwrap();
            k.quit(0)
        }));
        assert!(message.contains("children"), "{}", message);
    }

    #[test]
    fn test_dump_format() {
        let (kernel, _) = boot();
        let status = kernel.run(|k| {
            let dump = k.dump_processes().to_string();
            let mut lines = dump.lines();
            assert_eq!(lines.next(), Some(" PID  PPID  NAME              PRIORITY  STATE"));
            assert!(dump.contains("init"));
            assert!(dump.contains("idle"));
            assert!(dump.contains("Running"));
            0
        });
        assert_eq!(status, Ok(0));
    }

    #[test]
    fn test_dump_reports_stack_size() {
        let (kernel, _) = boot();
        let status = kernel.run(|k| {
            let child = k.fork("child", 2 * STACK, 5, |_| 0).unwrap();
            let dump = k.dump_processes();
            assert_eq!(dump.get(child).map(|p| p.stack_size), Some(2 * STACK));
            assert_eq!(
                dump.get(k.getpid()).map(|p| p.stack_size),
                Some(k.config().default_stack_size)
            );
            k.join().unwrap();
            0
        });
        assert_eq!(status, Ok(0));
    }
}

mod scheduler_tests {
    use super::*;

    #[test]
    fn test_round_robin_on_timeslice() {
        let (kernel, clock) = boot();
        let log = new_log();
        let l = log.clone();

        let status = kernel.run(move |k| {
            for name in ["A", "B"] {
                let (lp, clock) = (l.clone(), clock.clone());
                k.fork(name, STACK, 3, move |k| {
                    for round in 0..3 {
                        note(&lp, format!("{}{}", name, round));
                        clock.advance(Duration::from_millis(80));
                        k.clock_interrupt();
                    }
                    note(&lp, format!("{} cpu {}", name, k.read_time()));
                    0
                })
                .unwrap();
            }

            k.join().unwrap();
            k.join().unwrap();
            assert_eq!(k.ticks(), 6);
            0
        });

        assert_eq!(status, Ok(0));
        assert_eq!(
            entries(&log),
            vec!["A0", "B0", "A1", "B1", "A2", "B2", "A cpu 240000", "B cpu 240000"]
        );
    }

    #[test]
    fn test_unexpired_slice_keeps_cpu() {
        let (kernel, clock) = boot();
        let log = new_log();
        let l = log.clone();

        let status = kernel.run(move |k| {
            let lp = l.clone();
            k.fork("peer", STACK, 3, move |_| {
                note(&lp, "peer");
                0
            })
            .unwrap();

            clock.advance(Duration::from_millis(79));
            k.time_slice();
            note(&l, "main kept the cpu");

            clock.advance(Duration::from_millis(1));
            k.time_slice();
            note(&l, "main back");

            k.join().unwrap();
            0
        });

        assert_eq!(status, Ok(0));
        assert_eq!(entries(&log), vec!["main kept the cpu", "peer", "main back"]);
    }

    #[test]
    fn test_alone_on_level_keeps_running() {
        let (kernel, clock) = boot();
        let status = kernel.run(move |k| {
            let before = k.read_cur_start_time();
            clock.advance(Duration::from_millis(200));
            k.time_slice();

            // slice restarted in place
            assert_eq!(k.read_cur_start_time(), before + 200_000);
            assert_eq!(k.current_time(), clock.now_us());
            0
        });
        assert_eq!(status, Ok(0));
    }

    #[test]
    fn test_read_time_counts_running_slice() {
        let (kernel, clock) = boot();
        let status = kernel.run(move |k| {
            let start = k.read_time();
            clock.advance(Duration::from_millis(10));
            assert_eq!(k.read_time(), start + 10_000);
            0
        });
        assert_eq!(status, Ok(0));
    }
}

mod mailbox_tests {
    use super::*;

    #[test]
    fn test_fifo_and_full_send_parks() {
        let (kernel, _) = boot();
        let log = new_log();
        let l = log.clone();

        let status = kernel.run(move |k| {
            let mbox = k.mbox_create(3, 16).unwrap();

            let lc = l.clone();
            k.fork("consumer", STACK, 4, move |k| {
                note(&lc, "receiving");
                let mut buf = [0u8; 16];
                for _ in 0..4 {
                    let len = k.mbox_recv(mbox, &mut buf).unwrap();
                    note(&lc, String::from_utf8_lossy(&buf[..len]).into_owned());
                }
                0
            })
            .unwrap();

            for i in 0..3 {
                k.mbox_send(mbox, format!("m{}", i).as_bytes()).unwrap();
            }
            note(&l, "sent 3");

            k.mbox_send(mbox, b"m3").unwrap();
            note(&l, "sent 4");

            k.join().unwrap();
            k.mbox_release(mbox).unwrap();
            0
        });

        assert_eq!(status, Ok(0));
        assert_eq!(
            entries(&log),
            vec!["sent 3", "receiving", "sent 4", "m0", "m1", "m2", "m3"]
        );
    }

    #[test]
    fn test_conditional_calls_never_block() {
        let (kernel, _) = boot();
        let status = kernel.run(|k| {
            let mbox = k.mbox_create(1, 8).unwrap();
            let mut buf = [0u8; 8];

            let empty = k.mbox_cond_recv(mbox, &mut buf).unwrap_err();
            assert_eq!(empty, MailboxError::WouldBlock);
            assert_eq!(empty.code(), -2);

            k.mbox_cond_send(mbox, b"one").unwrap();
            assert_eq!(k.mbox_cond_send(mbox, b"two"), Err(MailboxError::WouldBlock));

            assert_eq!(k.mbox_cond_recv(mbox, &mut buf), Ok(3));
            assert_eq!(&buf[..3], b"one");
            0
        });
        assert_eq!(status, Ok(0));
    }

    #[test]
    fn test_message_size_limits() {
        let (kernel, _) = boot();
        let status = kernel.run(|k| {
            assert_eq!(
                k.mbox_create(1, MAX_MESSAGE + 1),
                Err(MailboxError::InvalidGeometry {
                    slots: 1,
                    size: MAX_MESSAGE + 1
                })
            );

            let mbox = k.mbox_create(2, 4).unwrap();
            let err = k.mbox_send(mbox, b"12345").unwrap_err();
            assert_eq!(err, MailboxError::MessageTooLarge { size: 5, max: 4 });
            assert_eq!(err.code(), -1);

            k.mbox_send(mbox, b"abcd").unwrap();
            let mut small = [0u8; 2];
            assert_eq!(
                k.mbox_recv(mbox, &mut small),
                Err(MailboxError::BufferTooSmall { size: 4, capacity: 2 })
            );

            // the oversized message is gone
            let info = k.mbox_info(mbox).unwrap();
            assert_eq!(info.pending, 0);
            assert_eq!(k.mbox_cond_recv(mbox, &mut small), Err(MailboxError::WouldBlock));

            let zero = k.mbox_create(0, 0).unwrap();
            assert_eq!(
                k.mbox_send(zero, b"x"),
                Err(MailboxError::MessageTooLarge { size: 1, max: 0 })
            );
            0
        });
        assert_eq!(status, Ok(0));
    }

    #[test]
    fn test_invalid_ids_and_reuse() {
        let (kernel, _) = boot();
        let status = kernel.run(|k| {
            assert_eq!(k.mbox_send(1999, b""), Err(MailboxError::InvalidMailbox(1999)));
            assert_eq!(
                k.mbox_send(MAX_MAILBOXES + 5, b""),
                Err(MailboxError::InvalidMailbox(MAX_MAILBOXES + 5))
            );

            let first = k.mbox_create(1, 1).unwrap();
            let second = k.mbox_create(1, 1).unwrap();
            assert_eq!(second, first + 1);

            k.mbox_release(first).unwrap();
            assert_eq!(k.mbox_release(first), Err(MailboxError::InvalidMailbox(first)));
            assert_eq!(k.mbox_send(first, b"x"), Err(MailboxError::InvalidMailbox(first)));
            assert_eq!(k.mbox_info(first), None);

            assert_eq!(k.mbox_create(1, 1), Ok(first));
            0
        });
        assert_eq!(status, Ok(0));
    }

    #[test]
    fn test_out_of_slots() {
        let config = KernelConfig {
            max_slots: 2,
            ..KernelConfig::default()
        };
        let (kernel, _) = boot_with(config);

        let status = kernel.run(|k| {
            let a = k.mbox_create(2, 8).unwrap();
            let b = k.mbox_create(2, 8).unwrap();
            k.mbox_send(a, b"1").unwrap();
            k.mbox_send(a, b"2").unwrap();

            let err = k.mbox_send(b, b"3").unwrap_err();
            assert_eq!(err, MailboxError::OutOfSlots);
            assert_eq!(err.code(), -2);

            let mut buf = [0u8; 8];
            k.mbox_recv(a, &mut buf).unwrap();
            assert_eq!(k.mbox_send(b, b"3"), Ok(()));
            0
        });
        assert_eq!(status, Ok(0));
    }

    #[test]
    fn test_release_wakes_blocked_receivers() {
        let (kernel, _) = boot();
        let log = new_log();
        let l = log.clone();

        let status = kernel.run(move |k| {
            let mbox = k.mbox_create(1, 8).unwrap();

            for name in ["r1", "r2"] {
                let lr = l.clone();
                k.fork(name, STACK, 2, move |k| {
                    let mut buf = [0u8; 8];
                    let err = k.mbox_recv(mbox, &mut buf).unwrap_err();
                    note(&lr, format!("{} {:?} {}", name, err, err.code()));
                    0
                })
                .unwrap();
            }

            let info = k.mbox_info(mbox).unwrap();
            assert_eq!(info.consumers.len(), 2);
            assert_eq!(info.refcount, 3);

            k.mbox_release(mbox).unwrap();
            note(&l, "released");
            assert_eq!(k.mbox_info(mbox), None);

            k.join().unwrap();
            k.join().unwrap();
            assert_eq!(k.mbox_create(1, 8), Ok(mbox));
            0
        });

        assert_eq!(status, Ok(0));
        assert_eq!(
            entries(&log),
            vec!["r1 Released -3", "r2 Released -3", "released"]
        );
    }

    #[test]
    fn test_release_wakes_blocked_sender() {
        let (kernel, _) = boot();
        let status = kernel.run(|k| {
            let mbox = k.mbox_create(1, 8).unwrap();
            k.mbox_send(mbox, b"full").unwrap();

            let writer = k
                .fork("writer", STACK, 2, move |k| match k.mbox_send(mbox, b"more") {
                    Err(MailboxError::Released) => 0,
                    _ => 1,
                })
                .unwrap();

            assert_eq!(k.mbox_info(mbox).map(|i| i.producers), Some(vec![writer]));
            k.mbox_release(mbox).unwrap();
            assert_eq!(k.join(), Ok((writer, 0)));
            0
        });
        assert_eq!(status, Ok(0));
    }
}

mod rendezvous_tests {
    use super::*;

    #[test]
    fn test_both_arrival_orders() {
        let (kernel, _) = boot();
        let log = new_log();
        let l = log.clone();

        let status = kernel.run(move |k| {
            let mbox = k.mbox_create(0, 0).unwrap();

            let lw = l.clone();
            k.fork("waiter", STACK, 2, move |k| {
                note(&lw, "waiter receiving");
                assert_eq!(k.mbox_recv(mbox, &mut []), Ok(0));
                note(&lw, "waiter received");
                note(&lw, "waiter sending");
                assert_eq!(k.mbox_send(mbox, &[]), Ok(()));
                note(&lw, "waiter sent");
                0
            })
            .unwrap();

            k.mbox_send(mbox, &[]).unwrap();
            note(&l, "main sent");
            k.mbox_recv(mbox, &mut []).unwrap();
            note(&l, "main received");

            k.join().unwrap();
            0
        });

        assert_eq!(status, Ok(0));
        assert_eq!(
            entries(&log),
            vec![
                "waiter receiving",
                "waiter received",
                "waiter sending",
                "main sent",
                "waiter sent",
                "main received",
            ]
        );
    }

    #[test]
    fn test_conditional_without_partner() {
        let (kernel, _) = boot();
        let status = kernel.run(|k| {
            let mbox = k.mbox_create(0, 0).unwrap();
            assert_eq!(k.mbox_cond_send(mbox, &[]), Err(MailboxError::WouldBlock));
            assert_eq!(k.mbox_cond_recv(mbox, &mut []), Err(MailboxError::WouldBlock));
            0
        });
        assert_eq!(status, Ok(0));
    }

    #[test]
    fn test_waiters_released_in_order() {
        let (kernel, _) = boot();
        let log = new_log();
        let l = log.clone();

        let status = kernel.run(move |k| {
            let mbox = k.mbox_create(0, 0).unwrap();

            for name in ["r1", "r2"] {
                let lr = l.clone();
                k.fork(name, STACK, 2, move |k| {
                    k.mbox_recv(mbox, &mut []).unwrap();
                    note(&lr, name);
                    0
                })
                .unwrap();
            }

            assert_eq!(k.mbox_info(mbox).map(|i| i.consumers.len()), Some(2));
            k.mbox_send(mbox, &[]).unwrap();
            k.mbox_send(mbox, &[]).unwrap();
            note(&l, "main done");

            k.join().unwrap();
            k.join().unwrap();
            0
        });

        assert_eq!(status, Ok(0));
        assert_eq!(entries(&log), vec!["r1", "r2", "main done"]);
    }

    fn pending(k: &Kernel, mbox: MailboxId) -> Option<usize> {
        k.mbox_info(mbox).map(|i| i.pending)
    }

    #[test]
    fn test_woken_waiter_pairs_both_queues() {
        let config = KernelConfig {
            main_priority: 6,
            ..KernelConfig::default()
        };
        let (kernel, _) = boot_with(config);
        let log = new_log();
        let l = log.clone();

        let status = kernel.run(move |k| {
            let mbox = k.mbox_create(0, 0).unwrap();

            let lx = l.clone();
            k.fork("X", STACK, 5, move |k| {
                let result = k.mbox_recv(mbox, &mut []);
                note(&lx, format!("X {:?}", result));
                0
            })
            .unwrap();

            // X is woken but cannot run until both later arrivals have queued
            let lp = l.clone();
            k.fork("P1", STACK, 1, move |k| {
                k.mbox_send(mbox, &[]).unwrap();

                let l2 = lp.clone();
                k.fork("P2", STACK, 2, move |k| {
                    let result = k.mbox_send(mbox, &[]);
                    note(&l2, format!("P2 {:?} pending={:?}", result, pending(k, mbox)));
                    0
                })
                .unwrap();

                let l3 = lp.clone();
                k.fork("C2", STACK, 3, move |k| {
                    let result = k.mbox_recv(mbox, &mut []);
                    note(&l3, format!("C2 {:?} pending={:?}", result, pending(k, mbox)));
                    0
                })
                .unwrap();

                k.join().unwrap();
                k.join().unwrap();
                0
            })
            .unwrap();

            k.join().unwrap();
            k.join().unwrap();
            assert_eq!(pending(k, mbox), Some(0));
            0
        });

        assert_eq!(status, Ok(0));
        assert_eq!(
            entries(&log),
            vec!["C2 Ok(0) pending=Some(1)", "P2 Ok(()) pending=Some(0)", "X Ok(0)"]
        );
    }

    #[test]
    fn test_pairing_skips_reused_mailbox() {
        let config = KernelConfig {
            main_priority: 6,
            ..KernelConfig::default()
        };
        let (kernel, _) = boot_with(config);
        let log = new_log();
        let l = log.clone();

        let status = kernel.run(move |k| {
            let mbox = k.mbox_create(0, 0).unwrap();

            let lx = l.clone();
            k.fork("X", STACK, 5, move |k| {
                let result = k.mbox_recv(mbox, &mut []);
                note(&lx, format!("X {:?}", result));
                0
            })
            .unwrap();

            let lp = l.clone();
            k.fork("P1", STACK, 1, move |k| {
                k.mbox_send(mbox, &[]).unwrap();

                let l2 = lp.clone();
                k.fork("P2", STACK, 2, move |k| {
                    note(&l2, format!("P2 {:?}", k.mbox_send(mbox, &[])));
                    0
                })
                .unwrap();

                // C2 is paired by X and releases the box before X finishes pairing
                let l3 = lp.clone();
                k.fork("C2", STACK, 3, move |k| {
                    note(&l3, format!("C2 {:?}", k.mbox_recv(mbox, &mut [])));
                    k.mbox_release(mbox).unwrap();
                    0
                })
                .unwrap();

                k.join().unwrap();
                k.join().unwrap();

                // same id, new mailbox: full, with a sender parked on it
                let reused = k.mbox_create(1, 8).unwrap();
                note(&lp, format!("P1 new box {}", reused));
                k.mbox_send(reused, b"a").unwrap();

                let l4 = lp.clone();
                k.fork("C3", STACK, 4, move |k| {
                    let result = k.mbox_send(reused, b"b");
                    note(&l4, format!("C3 {:?} pending={:?}", result, pending(k, reused)));
                    0
                })
                .unwrap();

                k.join().unwrap();
                0
            })
            .unwrap();

            let info = k.mbox_info(mbox).unwrap();
            note(
                &l,
                format!("main sees pending={} producers={}", info.pending, info.producers.len()),
            );

            let mut buf = [0u8; 8];
            for _ in 0..2 {
                let len = k.mbox_recv(mbox, &mut buf).unwrap();
                note(&l, format!("main got {}", String::from_utf8_lossy(&buf[..len])));
            }

            k.join().unwrap();
            k.join().unwrap();
            0
        });

        assert_eq!(status, Ok(0));
        assert_eq!(
            entries(&log),
            vec![
                "C2 Ok(0)",
                "P2 Err(Released)",
                "P1 new box 0",
                "X Ok(0)",
                "main sees pending=1 producers=1",
                "C3 Ok(()) pending=Some(1)",
                "main got a",
                "main got b",
            ]
        );
    }
}
