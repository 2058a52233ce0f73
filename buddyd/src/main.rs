mod config;
mod sim;

use clap::{App, Arg};
use config::BuddyConfig;
use rtcom::dispatcher::Dispatcher;
use rtcom::producer::{control_queue, Producer, Snapshot};
use rtcom::registry::{ModelInfo, Registry};
use rtcom::ring::SampleRing;
use rtcom::server::ServerTask;
use rtcom::session::ServerCtx;
use rtkit::auth::KeyStore;
use rtkit::logging::{self, error, info, o, warn};
use std::cell::RefCell;
use std::process;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() {
    let matches = App::new("buddyd")
        .version("0.1.0")
        .about("User-space signal acquisition and parameter server")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Path to the TOML configuration file")
                .takes_value(true),
        )
        .get_matches();

    let cfg = match matches.value_of("config") {
        Some(path) => BuddyConfig::load(path),
        None => BuddyConfig::default(),
    };

    let log = logging::term_logger(&cfg.general.log_level);

    let signals = Arc::new(sim::signal_table());
    let parameters = Arc::new(sim::parameter_table());

    let base_period = Duration::from_micros(cfg.producer.period_us);
    let sample_decimations: Vec<u64> = vec![1, 10];

    let model = ModelInfo {
        name: "oscillator".into(),
        id: 1,
        sample_periods: sample_decimations
            .iter()
            .map(|d| *d as f64 * cfg.producer.period_us as f64 * 1e-6)
            .collect(),
    };

    let ring = SampleRing::new(cfg.buffer.capacity);
    let snapshot = Snapshot::new(signals.image_len(), parameters.image_len());
    let (control_tx, control_rx) = control_queue(64);
    let streaming = Arc::new(AtomicUsize::new(0));
    let shutdown = Arc::new(AtomicBool::new(false));

    let mut verifier = KeyStore::new();
    for user in &cfg.users {
        if verifier
            .add_user(&user.name, &user.key, user.admin, user.write_access)
            .is_err()
        {
            warn!(log, "ignoring user with bad key material"; "user" => %user.name);
        }
    }

    let mut dispatcher = match Dispatcher::new(Some(&log)) {
        Ok(dispatcher) => dispatcher,
        Err(err) => {
            error!(log, "dispatcher setup failed"; "error" => %err);
            process::exit(1);
        }
    };

    let mut producer = match Producer::new(
        ring.clone(),
        control_rx,
        snapshot.clone(),
        Box::new(sim::Oscillator::new(base_period.as_secs_f64())),
        parameters.clone(),
        sample_decimations,
        base_period,
        streaming.clone(),
        dispatcher.waker(),
        shutdown.clone(),
        log.new(o!("thread" => "producer")),
    ) {
        Ok(producer) => producer,
        Err(err) => {
            error!(log, "producer setup failed"; "error" => ?err);
            process::exit(1);
        }
    };

    let ctx = Rc::new(ServerCtx {
        registry: Registry {
            model,
            signals,
            parameters,
        },
        ring,
        snapshot,
        control: control_tx,
        verifier: Box::new(verifier),
        streaming_sessions: streaming,
        statistics: cfg.features.statistics,
        login_timeout: Duration::from_secs(30),
        sessions: RefCell::new(Vec::new()),
    });

    let server = match ServerTask::bind(&cfg.general.interface, cfg.general.port, ctx, Some(&log))
    {
        Ok(server) => server,
        Err(err) => {
            error!(log, "server setup failed"; "error" => ?err);
            process::exit(1);
        }
    };

    let server_id = dispatcher.spawn(None, Box::new(server));
    if let Err(err) = dispatcher.register(server_id) {
        error!(log, "listener registration failed"; "error" => %err);
        process::exit(1);
    }

    let producer_thread = thread::Builder::new()
        .name("producer".into())
        .spawn(move || producer.run())
        .expect("Error spawning producer thread");

    info!(log, "buddy running"; "port" => cfg.general.port);

    if let Err(err) = dispatcher.run() {
        error!(log, "event loop failed"; "error" => %err);
    }

    shutdown.store(true, Ordering::Relaxed);
    producer_thread.join().expect("producer thread panicked");
}
