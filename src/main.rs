use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use clap::error::ErrorKind;
use clap::Parser;

use hyperkernel::{
    config::config_path, init_telemetry, Dependency, Facade, HaloCli, KernelError, Module,
    ModuleDescriptor, Orchestrator, Result, SharedConfig, Vaultline,
};

// Key-value store every other demo module builds on.
#[derive(Default)]
struct Storage {
    open: AtomicBool,
    rows: Mutex<BTreeMap<String, String>>,
}

impl Storage {
    fn put(&self, key: &str, value: &str) {
        debug_assert!(self.open.load(Ordering::SeqCst), "storage written while closed");
        self.rows.lock().unwrap_or_else(|e| e.into_inner()).insert(key.into(), value.into());
    }

    fn get(&self, key: &str) -> Option<String> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner()).get(key).cloned()
    }
}

impl Module for Storage {
    fn name(&self) -> &str { "storage" }
    fn start(&self) -> Result<()> { self.open.store(true, Ordering::SeqCst); tracing::info!("[storage] opened"); Ok(()) }
    fn stop(&self) -> Result<()> { self.open.store(false, Ordering::SeqCst); tracing::info!("[storage] closed"); Ok(()) }
}

struct Catalog {
    storage: Facade<Storage>,
}

impl Catalog {
    fn add_product(&self, sku: &str, title: &str) -> std::result::Result<(), KernelError> {
        self.storage.call(|s| s.put(&format!("product/{sku}"), title))
    }

    fn product(&self, sku: &str) -> std::result::Result<Option<String>, KernelError> {
        self.storage.call(|s| s.get(&format!("product/{sku}")))
    }
}

impl Module for Catalog {
    fn name(&self) -> &str { "catalog" }
    fn start(&self) -> Result<()> {
        self.add_product("HK-1", "Hyperkernel mug")?;
        tracing::info!("[catalog] seeded");
        Ok(())
    }
    fn stop(&self) -> Result<()> { tracing::info!("[catalog] stop"); Ok(()) }
}

struct Orders {
    catalog: Facade<Catalog>,
}

impl Orders {
    fn place(&self, sku: &str) -> std::result::Result<String, KernelError> {
        let title = self.catalog.try_call(|c| c.product(sku))?;
        Ok(title.unwrap_or_else(|| format!("unknown item {sku}")))
    }
}

impl Module for Orders {
    fn name(&self) -> &str { "orders" }
    fn start(&self) -> Result<()> { tracing::info!("[orders] accepting orders"); Ok(()) }
    fn stop(&self) -> Result<()> { tracing::info!("[orders] draining"); Ok(()) }
}

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn build_host(config: &SharedConfig) -> Result<(Orchestrator, Facade<Orders>)> {
    let cfg = config.snapshot();
    let mut journal = Vaultline::new(Path::new(&cfg.data_dir).join("transitions.log"))?;
    let replayed = journal.load_from_disk()?;
    tracing::debug!(replayed, "journal loaded");

    let orch = Orchestrator::builder(Arc::new(config.clone())).journal(journal).build()?;

    let storage = Arc::new(Storage::default());
    orch.register(ModuleDescriptor::new(storage.clone()))?;

    let catalog = Arc::new(Catalog { storage: orch.facade("storage", storage)? });
    orch.register(ModuleDescriptor::new(catalog.clone()).requires("storage"))?;

    let orders = Arc::new(Orders { catalog: orch.facade("catalog", catalog)? });
    orch.register(
        ModuleDescriptor::new(orders.clone())
            .requires("catalog")
            .depends_on(Dependency::soft("storage")),
    )?;
    let orders = orch.facade("orders", orders)?;
    Ok((orch, orders))
}

fn main() -> Result<()> {
    let config = SharedConfig::open(config_path())?;
    init_telemetry(&config.snapshot())?;
    tracing::info!(version = VERSION, "HYPERKERNEL starting");

    let (orch, orders) = build_host(&config)?;

    // CLI path
    match HaloCli::try_parse() {
        Ok(cli) => return cli.run(&orch),
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(_) => {}
    }

    // Demo: boot, serve a request, lose a dependency, recover
    for (name, err) in orch.start_all() {
        tracing::error!(module = %name, error = %err, "boot failure");
    }
    let item = orders.call(|o| o.place("HK-1"))??;
    tracing::info!(item = %item, "order placed");

    orch.stop("storage")?;
    if let Err(e) = orders.call(|o| o.place("HK-1")) {
        tracing::info!(error = %e, "orders rejected while storage is down");
    }
    tracing::info!(waiting = orch.waiting().len(), "cascade recorded");

    orch.start("storage")?;
    let item = orders.call(|o| o.place("HK-1"))??;
    tracing::info!(item = %item, "order placed after recovery");

    orch.stop_all();
    tracing::info!("HYPERKERNEL stopped");
    Ok(())
}
