//! Stress runner for the delayed-close cache
//!
//! Client threads look keys up, release them, and hand last references to the
//! deferred-dereference queue while the close and drain workers run on a tokio
//! runtime. An optional purger thread tears containers down under the
//! exclusive namespace lock. At the end the table is checked and a JSON report
//! is written.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Arg, ArgAction, Command, value_parser};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use kcb_cache::{
    CacheConfig, CacheConfigLayer, CacheManager, CacheStats, CachedObject, ContainerId,
    ObjectDesc, ObjectKey, TokioScheduler,
};

/// Run parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StressConfig {
    /// Run time in seconds
    duration: u64,
    /// Client threads
    threads: u32,
    /// Distinct object keys
    keys: u32,
    /// Objects per container
    container_size: u32,
    /// Purge one container this often; 0 disables the purger
    purge_every_ms: u64,
    /// Share of last references handed to the deferred queue, in percent
    deferred_percent: u32,
    /// Report path
    output: PathBuf,
    /// Cache settings
    cache: CacheConfig,
}

/// Run results
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StressReport {
    start_time: String,
    end_time: String,
    config: StressConfig,
    execution_time_ms: u64,
    operations: u64,
    errors: u64,
    purges: u64,
    purged_objects: u64,
    throughput_ops_per_sec: f64,
    consistent: bool,
    consistency_error: Option<String>,
    stats: CacheStats,
}

impl StressReport {
    fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file =
            File::create(path).with_context(|| format!("creating {}", path.display()))?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

type Slot = Mutex<Arc<CachedObject<u32>>>;

struct Namespace {
    cache: Arc<CacheManager<u32>>,
    slots: Vec<Slot>,
    container_size: u32,
}

impl Namespace {
    fn new(cache: Arc<CacheManager<u32>>, keys: u32, container_size: u32) -> Result<Self> {
        let mut slots = Vec::with_capacity(keys as usize);
        for key in 0..keys {
            let object = cache.create_object(Self::desc(key, container_size), key)?;
            cache.release(&object)?;
            slots.push(Mutex::new(object));
        }
        Ok(Self {
            cache,
            slots,
            container_size,
        })
    }

    fn desc(key: u32, container_size: u32) -> ObjectDesc {
        ObjectDesc::new(ObjectKey(key)).in_container(ContainerId(key / container_size.max(1)))
    }

    fn containers(&self) -> u32 {
        (self.slots.len() as u32).div_ceil(self.container_size.max(1))
    }

    /// Find a key under its lock domain, recreating reclaimed objects
    fn lookup(&self, key: u32) -> Result<Arc<CachedObject<u32>>> {
        let _domain = self.cache.lock_domains(&[ObjectKey(key)]);
        let mut slot = self.slots[key as usize].lock();
        if slot.is_destroyed() {
            *slot = self
                .cache
                .create_object(Self::desc(key, self.container_size), key)?;
        } else {
            self.cache.reference_with_lock(&slot)?;
        }
        Ok(Arc::clone(&slot))
    }
}

fn run_clients(namespace: &Arc<Namespace>, config: &StressConfig) -> (u64, u64, u64, u64) {
    let running = Arc::new(AtomicBool::new(true));
    let operations = Arc::new(AtomicU64::new(0));
    let errors = Arc::new(AtomicU64::new(0));
    let purges = Arc::new(AtomicU64::new(0));
    let purged = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(config.threads as usize + 1));

    let mut handles = Vec::new();
    for thread_id in 0..config.threads {
        let namespace = Arc::clone(namespace);
        let running = Arc::clone(&running);
        let operations = Arc::clone(&operations);
        let errors = Arc::clone(&errors);
        let barrier = Arc::clone(&barrier);
        let keys = config.keys;
        let deferred = f64::from(config.deferred_percent.min(100)) / 100.0;

        handles.push(thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(u64::from(thread_id));
            barrier.wait();
            while running.load(Ordering::Relaxed) {
                let _shared = namespace.cache.lock_namespace_shared();
                let key = rng.gen_range(0..keys);
                let result = namespace.lookup(key).and_then(|object| {
                    if rng.gen_bool(deferred) {
                        namespace.cache.enqueue_deref(&object);
                        Ok(())
                    } else {
                        namespace.cache.release(&object).map_err(anyhow::Error::from)
                    }
                });
                match result {
                    Ok(()) => operations.fetch_add(1, Ordering::Relaxed),
                    Err(e) => {
                        log::warn!("client {thread_id}: {e}");
                        errors.fetch_add(1, Ordering::Relaxed)
                    }
                };
            }
        }));
    }

    let purger = (config.purge_every_ms > 0).then(|| {
        let namespace = Arc::clone(namespace);
        let running = Arc::clone(&running);
        let purges = Arc::clone(&purges);
        let purged = Arc::clone(&purged);
        let interval = Duration::from_millis(config.purge_every_ms);
        thread::spawn(move || {
            let mut next = 0;
            while running.load(Ordering::Relaxed) {
                thread::sleep(interval);
                let container = ContainerId(next % namespace.containers().max(1));
                next += 1;
                let _exclusive = namespace.cache.lock_namespace_exclusive();
                let count = namespace.cache.purge_container(container);
                purges.fetch_add(1, Ordering::Relaxed);
                purged.fetch_add(count as u64, Ordering::Relaxed);
            }
        })
    });

    barrier.wait();
    thread::sleep(Duration::from_secs(config.duration));
    running.store(false, Ordering::Relaxed);

    for handle in handles.into_iter().chain(purger) {
        if handle.join().is_err() {
            errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    (
        operations.load(Ordering::Relaxed),
        errors.load(Ordering::Relaxed),
        purges.load(Ordering::Relaxed),
        purged.load(Ordering::Relaxed),
    )
}

/// Wait for both workers to finish their outstanding work
fn settle(cache: &CacheManager<u32>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cache.current_size() <= cache.capacity()
            && cache.pending_derefs() == 0
            && !cache.is_close_worker_armed()
        {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

fn load_cache_config(path: Option<&PathBuf>, capacity: Option<u32>) -> Result<CacheConfig> {
    let base = match path {
        Some(path) => CacheConfig::from_file(path)?,
        None => CacheConfig::default(),
    };
    let mut config = base.merge(&CacheConfigLayer::from_env(kcb_cache::config::ENV_PREFIX)?)?;
    if let Some(capacity) = capacity {
        config.capacity = capacity;
        config.max_entries = None;
    }
    config.validate()?;
    Ok(config)
}

fn cli() -> Command {
    Command::new("kcb-stress")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Stress the delayed-close cache with concurrent clients")
        .arg(
            Arg::new("duration")
                .long("duration")
                .short('d')
                .value_name("SECONDS")
                .help("Run time in seconds")
                .value_parser(value_parser!(u64))
                .default_value("10"),
        )
        .arg(
            Arg::new("threads")
                .long("threads")
                .short('t')
                .value_name("COUNT")
                .help("Client threads")
                .value_parser(value_parser!(u32).range(1..))
                .default_value("4"),
        )
        .arg(
            Arg::new("keys")
                .long("keys")
                .short('k')
                .value_name("COUNT")
                .help("Distinct object keys")
                .value_parser(value_parser!(u32).range(1..))
                .default_value("8192"),
        )
        .arg(
            Arg::new("capacity")
                .long("capacity")
                .short('c')
                .value_name("COUNT")
                .help("Delayed-close capacity (overrides config file and environment)")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("container-size")
                .long("container-size")
                .value_name("COUNT")
                .help("Objects per container")
                .value_parser(value_parser!(u32).range(1..))
                .default_value("512"),
        )
        .arg(
            Arg::new("purge-every")
                .long("purge-every")
                .value_name("MILLIS")
                .help("Purge one container this often (0 disables)")
                .value_parser(value_parser!(u64))
                .default_value("0"),
        )
        .arg(
            Arg::new("deferred")
                .long("deferred")
                .value_name("PERCENT")
                .help("Share of releases sent through the deferred queue")
                .value_parser(value_parser!(u32).range(0..=100))
                .default_value("30"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("TOML cache configuration")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("output")
                .long("output")
                .short('o')
                .value_name("FILE")
                .help("Report path")
                .value_parser(value_parser!(PathBuf))
                .default_value("kcb_stress_report.json"),
        )
        .arg(
            Arg::new("quiet")
                .long("quiet")
                .short('q')
                .help("Only write the report")
                .action(ArgAction::SetTrue),
        )
}

fn main() -> Result<()> {
    env_logger::init();
    let matches = cli().get_matches();

    let arg = |name: &str| -> Result<u64> {
        matches
            .get_one::<u64>(name)
            .copied()
            .with_context(|| format!("missing --{name}"))
    };
    let arg32 = |name: &str| -> Result<u32> {
        matches
            .get_one::<u32>(name)
            .copied()
            .with_context(|| format!("missing --{name}"))
    };

    let cache_config = load_cache_config(
        matches.get_one::<PathBuf>("config"),
        matches.get_one::<u32>("capacity").copied(),
    )?;
    let config = StressConfig {
        duration: arg("duration")?,
        threads: arg32("threads")?,
        keys: arg32("keys")?,
        container_size: arg32("container-size")?,
        purge_every_ms: arg("purge-every")?,
        deferred_percent: arg32("deferred")?,
        output: matches
            .get_one::<PathBuf>("output")
            .cloned()
            .context("missing --output")?,
        cache: cache_config,
    };
    let quiet = matches.get_flag("quiet");
    if config.keys <= config.cache.capacity {
        bail!(
            "--keys ({}) must exceed the cache capacity ({}) to exercise eviction",
            config.keys,
            config.cache.capacity
        );
    }

    if !quiet {
        println!("kcb-stress: {config:?}");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_time()
        .thread_name("kcb-worker")
        .build()
        .context("starting worker runtime")?;
    let cache = CacheManager::builder(config.cache.clone())
        .scheduler(Arc::new(TokioScheduler::new(runtime.handle().clone())))
        .build()?;

    let start_time = chrono::Utc::now();
    let started = Instant::now();
    let namespace = Arc::new(Namespace::new(Arc::clone(&cache), config.keys, config.container_size)?);
    let (operations, errors, purges, purged_objects) = run_clients(&namespace, &config);
    let execution_time = started.elapsed();

    let settle_timeout = config.cache.rearm_interval() * 4 + Duration::from_secs(5);
    if !settle(&cache, settle_timeout) {
        log::warn!("workers did not settle within {settle_timeout:?}");
    }
    let consistency = cache.check_consistency();

    let report = StressReport {
        start_time: start_time.to_rfc3339(),
        end_time: chrono::Utc::now().to_rfc3339(),
        execution_time_ms: execution_time.as_millis() as u64,
        operations,
        errors,
        purges,
        purged_objects,
        throughput_ops_per_sec: operations as f64 / execution_time.as_secs_f64(),
        consistent: consistency.is_ok(),
        consistency_error: consistency.as_ref().err().map(ToString::to_string),
        stats: cache.stats(),
        config,
    };
    report.save_to_file(&report.config.output)?;

    if !quiet {
        let stats = &report.stats;
        println!("\n==== kcb-stress summary ====");
        println!("  operations:      {}", report.operations);
        println!("  errors:          {}", report.errors);
        println!("  throughput:      {:.0} ops/sec", report.throughput_ops_per_sec);
        println!("  table:           {}/{}", stats.current_size, stats.capacity);
        println!("  evictions:       {}", stats.evictions);
        println!("  eviction rate:   {:.2}", stats.eviction_success_rate());
        println!("  inline derefs:   {:.2}", stats.inline_deref_rate());
        println!("  leaked refs:     {}", stats.leaked_references);
        println!("  purged objects:  {} in {} purges", report.purged_objects, report.purges);
        println!("  consistent:      {}", report.consistent);
        println!("report written to {}", report.config.output.display());
    }

    cache.shutdown();
    runtime.shutdown_timeout(Duration::from_secs(1));

    if let Err(e) = consistency {
        bail!("cache inconsistent after run: {e}");
    }
    Ok(())
}
