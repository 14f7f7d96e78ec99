use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use fdrop::{
    ExitClass,
    cli::CtlCli,
    config::{Interface, OutputFormat},
    logging,
    ops::{self, Report},
    table::{BpfFs, PinnedTable, Registry, Schema},
};

fn main() -> ExitCode {
    let cli = match CtlCli::try_parse() {
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

    match run(cli) {
        Ok(()) => ExitCode::from(ExitClass::Ok.code()),
        Err(err) => {
            eprintln!("ERR: {err:#}");
            ExitCode::from(ExitClass::of(&err).code())
        }
    }
}

fn run(cli: CtlCli) -> Result<()> {
    let iface = Interface::resolve(cli.device()?)?;
    let config = cli.into_config(iface)?;
    let name = config.layout.table_name(&config.iface.name)?;

    let table = BpfFs
        .open(&name, &Schema::blocklist(config.capacity))
        .with_context(|| format!("opening table {name}"))?;
    let show_text = !config.quiet && config.output == OutputFormat::Text;
    if show_text {
        println!("success to open bpf map under {}", name.dir().display());
        if config.verbose {
            print_map_info(&table);
        }
    }

    let report = ops::execute(&table, config.op)
        .with_context(|| format!("{} on {name}", config.op.name()))?;
    if !config.quiet {
        print_report(&report, config.output);
    }
    Ok(())
}

fn print_map_info(table: &PinnedTable) {
    let summary = table.summary();
    println!(
        " - BPF map (bpf_map_type:{}) id:{} name:{} key_size:{} value_size:{} max_entries:{}",
        summary.schema.kind.raw(),
        summary.id,
        summary.name,
        summary.schema.key_size,
        summary.schema.value_size,
        summary.schema.capacity
    );
}

fn print_report(report: &Report, output: OutputFormat) {
    match output {
        OutputFormat::Json => println!("{}", report.to_json()),
        OutputFormat::Text => {
            let text = report.to_string();
            if !text.is_empty() {
                println!("{text}");
            }
        }
    }
}
