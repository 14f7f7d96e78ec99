use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use fdrop::{
    AttachController, AttachRequest, Attached, ExitClass,
    cli::LoaderCli,
    config::{Interface, LoaderConfig},
    ebpf_loader::{LinkLifetime, XdpDatapath},
    logging,
    table::{BpfFs, PinnedTable, pinned::MapSummary},
};
use tokio::signal;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = match LoaderCli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            let class = if err.use_stderr() {
                ExitClass::Config
            } else {
                ExitClass::Ok
            };
            return ExitCode::from(class.code());
        }
    };
    logging::init(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::from(ExitClass::Ok.code()),
        Err(err) => {
            eprintln!("ERR: {err:#}");
            ExitCode::from(ExitClass::of(&err).code())
        }
    }
}

async fn run(cli: LoaderCli) -> Result<()> {
    let iface = Interface::resolve(cli.device()?)?;
    let config = cli.into_config(iface)?;
    let table = config.layout.table_name(&config.iface.name)?;
    let lifetime = if config.foreground {
        LinkLifetime::Held
    } else {
        LinkLifetime::Pinned
    };
    let datapath = XdpDatapath::new(
        config.object.clone(),
        &config.program,
        config.layout.clone(),
        lifetime,
    );
    let mut controller = AttachController::new(BpfFs, datapath);
    let ifname = config.iface.name.as_str();

    if config.unload {
        let detached = controller
            .detach(ifname, &table, config.purge)
            .with_context(|| format!("unloading from {ifname}"))?;
        if !config.quiet {
            if detached.was_attached {
                println!("Success: detached XDP prog from device:{ifname}");
            } else {
                println!("No XDP prog attached on device:{ifname}");
            }
            if detached.purged {
                println!(" - removed table {table}");
            }
        }
        return Ok(());
    }

    let attached = controller
        .attach(&AttachRequest {
            iface: ifname,
            table,
            capacity: config.capacity,
            mode: config.mode,
            force: config.force,
        })
        .with_context(|| format!("attaching to {ifname}"))?;
    if !config.quiet {
        let summary = controller.datapath().table().map(PinnedTable::summary);
        print_attached(&config, &attached, summary);
    }

    if config.foreground {
        signal::ctrl_c()
            .await
            .context("failed to wait for shutdown signal")?;
        if !config.quiet {
            println!("Detaching from {ifname}...");
        }
        controller
            .detach(ifname, &attached.table, false)
            .with_context(|| format!("detaching from {ifname}"))?;
    }
    Ok(())
}

fn print_attached(config: &LoaderConfig, attached: &Attached, summary: Option<&MapSummary>) {
    println!(
        "Success: Loaded BPF-object({}) and used program({})",
        config.object, config.program
    );
    println!(
        " - XDP prog attached on device:{}(ifindex:{}) mode:{}",
        config.iface.name, config.iface.index, config.mode
    );
    let origin = if attached.created { "created" } else { "reused" };
    match summary {
        Some(map) => println!(" - table {} ({origin}) map id:{}", attached.table, map.id),
        None => println!(" - table {} ({origin})", attached.table),
    }
    if attached.replaced {
        println!(" - replaced the previously attached prog");
    }
    if config.foreground {
        println!("Press Ctrl-C to detach.");
    }
}
