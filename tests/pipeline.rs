mod integration {
    mod pipeline {

        extern crate tempdir;

        use self::tempdir::TempDir;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::{Arc, Mutex};
        use std::thread;
        use std::time::{Duration, Instant};
        use telemetryhub::buckets::Snapshot;
        use telemetryhub::buffer::EnqueueError;
        use telemetryhub::config::Args;
        use telemetryhub::flush::DurabilityPolicy;
        use telemetryhub::metric::RawRecord;
        use telemetryhub::pipeline::{IntakeError, Pipeline};
        use telemetryhub::sink::{ExportError, Sink};
        use telemetryhub::time;

        struct Recording {
            failures: Arc<AtomicUsize>,
            seen: Arc<Mutex<Vec<Snapshot>>>,
        }

        impl Sink for Recording {
            fn export(&mut self, snapshot: &Snapshot) -> Result<(), ExportError> {
                if self.failures.load(Ordering::SeqCst) > 0 {
                    self.failures.fetch_sub(1, Ordering::SeqCst);
                    return Err(ExportError::Unavailable("downstream is down".into()));
                }
                self.seen.lock().unwrap().push(snapshot.clone());
                Ok(())
            }

            fn name(&self) -> &str {
                "recording"
            }
        }

        fn recording(failures: usize) -> (Box<Recording>, Arc<Mutex<Vec<Snapshot>>>) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let sink = Box::new(Recording {
                failures: Arc::new(AtomicUsize::new(failures)),
                seen: Arc::clone(&seen),
            });
            (sink, seen)
        }

        fn args(retries: u32, durability: DurabilityPolicy) -> Args {
            Args {
                http: None,
                window_size: Duration::from_millis(200),
                flush_interval: Duration::from_millis(20),
                export_retry_count: retries,
                export_backoff_base: Duration::from_millis(1),
                export_backoff_max: Duration::from_millis(8),
                durability_policy: durability,
                shutdown_timeout: Duration::from_secs(2),
                ..Default::default()
            }
        }

        fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
            let start = Instant::now();
            while start.elapsed() < Duration::from_secs(10) {
                if cond() {
                    return true;
                }
                thread::sleep(Duration::from_millis(5));
            }
            false
        }

        #[test]
        fn recovers_after_two_failures() {
            let (sink, seen) = recording(2);
            let pipeline = Pipeline::start(&args(3, DurabilityPolicy::Drop), sink).unwrap();
            let intake = pipeline.intake();
            let registry = Arc::clone(pipeline.registry());

            let ts = time::now_ms();
            for v in &[5.0, 10.0, 15.0] {
                intake
                    .submit(RawRecord::counter("requests", *v).timestamp(ts))
                    .unwrap();
            }
            assert!(wait_until(|| registry.flush_success.load(Ordering::Relaxed) == 1));

            {
                let seen = seen.lock().unwrap();
                assert_eq!(1, seen.len());
                let state = &seen[0].series[0].state;
                assert_eq!(30.0, state.sum());
                assert_eq!(3, state.count());
            }
            assert_eq!(2, registry.flush_failure.load(Ordering::Relaxed));
            assert_eq!(0, registry.export_loss.load(Ordering::Relaxed));
            assert!(pipeline.health().last_flush_ms.is_some());
            pipeline.shutdown();
        }

        #[test]
        fn exhausted_retries_drop_and_keep_accepting() {
            let (sink, seen) = recording(4);
            let pipeline = Pipeline::start(&args(3, DurabilityPolicy::Drop), sink).unwrap();
            let intake = pipeline.intake();
            let registry = Arc::clone(pipeline.registry());

            intake.submit(RawRecord::counter("requests", 1.0)).unwrap();
            assert!(wait_until(|| registry.export_loss.load(Ordering::Relaxed) == 1));
            assert_eq!(4, registry.flush_failure.load(Ordering::Relaxed));
            assert!(seen.lock().unwrap().is_empty());

            // the sink has recovered; the pipeline never stopped
            intake.submit(RawRecord::counter("requests", 2.0)).unwrap();
            pipeline.shutdown();
            assert_eq!(1, registry.export_loss.load(Ordering::Relaxed));
            let seen = seen.lock().unwrap();
            let total: f64 = seen.iter().map(|s| s.series[0].state.sum()).sum();
            assert_eq!(2.0, total);
        }

        #[test]
        fn exhausted_retries_spill_to_disk() {
            let dir = TempDir::new("telemetryhub-it").unwrap();
            let (sink, _) = recording(usize::max_value());
            let pipeline = Pipeline::start(
                &Args {
                    data_directory: dir.path().to_path_buf(),
                    ..args(0, DurabilityPolicy::Spill)
                },
                sink,
            )
            .unwrap();
            let intake = pipeline.intake();
            let registry = Arc::clone(pipeline.registry());
            intake.submit(RawRecord::gauge("temp", 21.0)).unwrap();
            pipeline.shutdown();

            assert_eq!(0, registry.export_loss.load(Ordering::Relaxed));
            assert!(registry.spilled.load(Ordering::Relaxed) >= 1);
            let spilled: Vec<_> = std::fs::read_dir(dir.path().join("spill"))
                .unwrap()
                .map(|e| e.unwrap().path())
                .filter(|p| p.extension().map_or(false, |ext| ext == "json"))
                .collect();
            assert_eq!(registry.spilled.load(Ordering::Relaxed), spilled.len());
        }

        #[test]
        fn shutdown_drains_buffer_into_final_flush() {
            let (sink, seen) = recording(0);
            let pipeline = Pipeline::start(
                &Args {
                    window_size: Duration::from_secs(3600),
                    ..args(0, DurabilityPolicy::Drop)
                },
                sink,
            )
            .unwrap();
            let intake = pipeline.intake();
            let ts = time::now_ms();
            for _ in 0..500 {
                intake
                    .submit(RawRecord::counter("hits", 1.0).timestamp(ts))
                    .unwrap();
            }
            pipeline.shutdown();

            assert_eq!(
                Err(IntakeError::Buffer(EnqueueError::Closed)),
                intake.submit(RawRecord::counter("hits", 1.0))
            );
            let seen = seen.lock().unwrap();
            let total: f64 = seen.iter().map(|s| s.series[0].state.sum()).sum();
            assert_eq!(500.0, total);
        }

        #[test]
        fn shutdown_racing_producers_exports_every_accepted_record() {
            for _ in 0..10 {
                let (sink, seen) = recording(0);
                let pipeline = Pipeline::start(
                    &Args {
                        window_size: Duration::from_secs(3600),
                        buffer_capacity: 1_000_000,
                        ..args(0, DurabilityPolicy::Drop)
                    },
                    sink,
                )
                .unwrap();

                let mut producers = Vec::new();
                for _ in 0..8 {
                    let intake = pipeline.intake();
                    producers.push(thread::spawn(move || {
                        let mut accepted = 0;
                        loop {
                            match intake.submit(RawRecord::counter("hits", 1.0)) {
                                Ok(()) => accepted += 1,
                                Err(IntakeError::Buffer(EnqueueError::Closed)) => break,
                                Err(IntakeError::Buffer(EnqueueError::BufferFull)) => {
                                    thread::yield_now()
                                }
                                Err(e) => panic!("unexpected {}", e),
                            }
                        }
                        accepted
                    }));
                }
                thread::sleep(Duration::from_millis(5));
                pipeline.shutdown();

                let accepted: usize = producers.into_iter().map(|p| p.join().unwrap()).sum();
                let seen = seen.lock().unwrap();
                let total: f64 = seen.iter().map(|s| s.series[0].state.sum()).sum();
                assert_eq!(accepted as f64, total);
            }
        }

        #[test]
        fn full_buffer_pushes_back() {
            let (sink, _) = recording(0);
            let pipeline = Pipeline::start(
                &Args {
                    buffer_capacity: 1,
                    ..args(0, DurabilityPolicy::Drop)
                },
                sink,
            )
            .unwrap();
            let intake = pipeline.intake();
            let registry = Arc::clone(pipeline.registry());

            let mut full = 0;
            for _ in 0..10_000 {
                match intake.submit(RawRecord::counter("hits", 1.0)) {
                    Ok(()) => {}
                    Err(IntakeError::Buffer(EnqueueError::BufferFull)) => full += 1,
                    Err(e) => panic!("unexpected {}", e),
                }
            }
            assert!(full > 0);
            assert_eq!(full, registry.buffer_full.load(Ordering::Relaxed));
            pipeline.shutdown();
        }
    }
}
