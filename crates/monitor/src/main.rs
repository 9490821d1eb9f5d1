use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use serde::Serialize;

use monitor::config::{Cli, Commands, ControllerConfig, PurgeArgs};
use monitor::context_store::ContextStore;
use monitor::logging;
use monitor::pu_management::{collect_live_marks, ContextId, StoredContext};

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    let _guard = logging::init(cli.monitor.metrics_file.as_ref())?;
    let config = ControllerConfig::from(&cli.monitor);

    match cli.command {
        Commands::Contexts => run_contexts(&config),
        Commands::Sweep => run_sweep(&config),
        Commands::Purge(purge_args) => run_purge(&config, &purge_args),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ContextLine<'a> {
    context_id: &'a str,
    #[serde(flatten)]
    context: &'a StoredContext,
}

fn open_store(config: &ControllerConfig) -> Result<ContextStore> {
    config
        .open_store()
        .map_err(|e| anyhow::anyhow!("Failed to open context store: {e:?}"))
}

fn run_contexts(config: &ControllerConfig) -> Result<()> {
    let store = open_store(config)?;
    let walker = store
        .walk()
        .map_err(|e| anyhow::anyhow!("Failed to walk context store: {e:?}"))?;

    for name in walker {
        let Ok(context_id) = ContextId::parse(&name) else {
            tracing::warn!(entry = %name, "Skipping invalid context store entry");
            continue;
        };
        match store.get::<StoredContext>(&context_id) {
            Ok(context) => {
                let line = serde_json::to_string(&ContextLine {
                    context_id: context_id.as_str(),
                    context: &context,
                })
                .context("serialize stored context")?;
                println!("{line}");
            }
            Err(e) => tracing::warn!(context_id = %context_id, "Failed to read context: {e:?}"),
        }
    }
    Ok(())
}

fn run_sweep(config: &ControllerConfig) -> Result<()> {
    let netcls = config.netcls();
    let live = collect_live_marks(&netcls)
        .map_err(|e| anyhow::anyhow!("Failed to enumerate cgroups: {e:?}"))?;

    tracing::info!(
        deleted = live.deleted_cgroups.len(),
        skipped = live.skipped_cgroups.len(),
        marks = live.marks.len(),
        "Swept empty cgroups under {}",
        netcls.base_path().display()
    );
    for cgroup in &live.deleted_cgroups {
        println!("{cgroup}");
    }
    Ok(())
}

fn run_purge(config: &ControllerConfig, purge_args: &PurgeArgs) -> Result<()> {
    if !purge_args.yes {
        anyhow::bail!(
            "refusing to purge {} without --yes",
            config.store_path.display()
        );
    }
    let store = open_store(config)?;
    store
        .destroy()
        .map_err(|e| anyhow::anyhow!("Failed to purge context store: {e:?}"))?;
    tracing::info!("Purged context store {}", config.store_path.display());
    Ok(())
}
