use std::{net::Ipv4Addr, path::PathBuf};

use clap::{ArgGroup, Args, Parser};
use fdrop_common::{DEFAULT_CAPACITY, PROGRAM_NAME};

use crate::{
    config::{
        AttachMode, CtlConfig, DEFAULT_FEATURE, DEFAULT_PIN_ROOT, Interface, LoaderConfig,
        ObjectSource, OutputFormat, PinLayout, PinScope, check_capacity,
    },
    error::ConfigError,
    ops::{Op, OpKind},
};

/// Where tables and links are pinned. Shared by both tools.
#[derive(Args, Clone, Debug)]
pub struct PinArgs {
    /// bpffs mount the feature directory lives under
    #[arg(long, env = "FDROP_PIN_ROOT", value_name = "DIR", default_value = DEFAULT_PIN_ROOT)]
    pub pin_root: PathBuf,
    /// Feature directory name below the pin root
    #[arg(long, env = "FDROP_FEATURE", value_name = "NAME", default_value = DEFAULT_FEATURE)]
    pub feature: String,
    /// One table for the host, or one per interface
    #[arg(long, value_enum, default_value_t = PinScope::Shared)]
    pub layout: PinScope,
    /// Maximum number of blocked addresses
    #[arg(long, env = "FDROP_CAPACITY", value_name = "ROWS", default_value_t = DEFAULT_CAPACITY)]
    pub capacity: u32,
}

impl PinArgs {
    pub fn pin_layout(&self) -> Result<PinLayout, ConfigError> {
        Ok(PinLayout::new(&self.pin_root, &self.feature)?.with_scope(self.layout))
    }
}

#[derive(Parser, Debug)]
#[command(name = "fdrop-loader", version)]
#[command(about = "Attach the fdrop XDP block-list to an interface", long_about = None)]
#[command(group(ArgGroup::new("mode").args(["skb_mode", "native_mode", "auto_mode"])))]
pub struct LoaderCli {
    /// Operate on device <ifname> (required)
    #[arg(short, long, value_name = "IFNAME")]
    pub dev: Option<String>,
    /// Install the program in generic (SKB) mode
    #[arg(short = 'S', long)]
    pub skb_mode: bool,
    /// Install the program in native driver mode (default)
    #[arg(short = 'N', long)]
    pub native_mode: bool,
    /// Let the kernel pick native or generic mode
    #[arg(short = 'A', long)]
    pub auto_mode: bool,
    /// Replace a classifier already attached to the device
    #[arg(short = 'F', long)]
    pub force: bool,
    /// Detach the classifier from the device
    #[arg(short = 'U', long)]
    pub unload: bool,
    /// With --unload, also remove the table and its counters
    #[arg(long, requires = "unload")]
    pub purge: bool,
    /// Keep the classifier attached only until Ctrl-C
    #[arg(long, conflicts_with = "unload")]
    pub foreground: bool,
    /// Print nothing on success
    #[arg(short, long)]
    pub quiet: bool,
    /// Log at debug level
    #[arg(short, long)]
    pub verbose: bool,
    /// Load the classifier from this object file instead of the built-in one
    #[arg(long, value_name = "FILE")]
    pub filename: Option<PathBuf>,
    /// Program section to attach
    #[arg(long, value_name = "NAME", default_value = PROGRAM_NAME)]
    pub progname: String,
    #[command(flatten)]
    pub pins: PinArgs,
}

impl LoaderCli {
    pub fn device(&self) -> Result<&str, ConfigError> {
        self.dev.as_deref().ok_or(ConfigError::MissingDevice)
    }

    pub fn mode(&self) -> AttachMode {
        if self.skb_mode {
            AttachMode::Generic
        } else if self.auto_mode {
            AttachMode::Auto
        } else {
            AttachMode::Native
        }
    }

    pub fn into_config(self, iface: Interface) -> Result<LoaderConfig, ConfigError> {
        let mut config = LoaderConfig::new(iface, self.pins.pin_layout()?);
        config.capacity = check_capacity(self.pins.capacity)?;
        config.mode = self.mode();
        config.force = self.force;
        config.unload = self.unload;
        config.purge = self.purge;
        config.foreground = self.foreground;
        config.quiet = self.quiet;
        config.object = self.filename.map(ObjectSource::File).unwrap_or_default();
        config.program = self.progname;
        Ok(config)
    }
}

#[derive(Parser, Debug)]
#[command(name = "fdrop-ctl", version)]
#[command(about = "Manage the addresses blocked by fdrop", long_about = None)]
pub struct CtlCli {
    /// Operate on device <ifname> (required)
    #[arg(short, long, value_name = "IFNAME")]
    pub dev: Option<String>,
    /// Operation on the block-list
    #[arg(long, value_enum, value_name = "OPS")]
    pub ops: OpKind,
    /// IPv4 source address for add, del and get
    #[arg(long, value_name = "ADDR")]
    pub src_ip: Option<Ipv4Addr>,
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,
    /// Print nothing on success
    #[arg(short, long)]
    pub quiet: bool,
    /// Show the opened map and log at debug level
    #[arg(short, long)]
    pub verbose: bool,
    #[command(flatten)]
    pub pins: PinArgs,
}

impl CtlCli {
    pub fn device(&self) -> Result<&str, ConfigError> {
        self.dev.as_deref().ok_or(ConfigError::MissingDevice)
    }

    pub fn into_config(self, iface: Interface) -> Result<CtlConfig, ConfigError> {
        Ok(CtlConfig {
            iface,
            layout: self.pins.pin_layout()?,
            capacity: check_capacity(self.pins.capacity)?,
            op: Op::from_parts(self.ops, self.src_ip)?,
            output: self.output,
            quiet: self.quiet,
            verbose: self.verbose,
        })
    }
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, error::ErrorKind};

    use super::*;

    fn eth0() -> Interface {
        Interface {
            name: "eth0".to_owned(),
            index: 2,
        }
    }

    #[test]
    fn parsers_are_well_formed() {
        LoaderCli::command().debug_assert();
        CtlCli::command().debug_assert();
    }

    #[test]
    fn loader_defaults() {
        let cli = LoaderCli::try_parse_from(["fdrop-loader", "--dev", "eth0"]).unwrap();
        assert_eq!(cli.device().unwrap(), "eth0");
        let config = cli.into_config(eth0()).unwrap();
        assert_eq!(config.mode, AttachMode::Native);
        assert_eq!(config.capacity, DEFAULT_CAPACITY);
        assert_eq!(config.object, ObjectSource::Embedded);
        assert_eq!(config.program, PROGRAM_NAME);
        assert!(!config.force && !config.unload && !config.foreground);
        assert_eq!(
            config.layout.table_name("eth0").unwrap().to_string(),
            "/sys/fs/bpf/fdrop/fdrop_map_v1"
        );
    }

    #[test]
    fn attach_modes_are_exclusive() {
        let cli = LoaderCli::try_parse_from(["fdrop-loader", "-d", "eth0", "--skb-mode"]).unwrap();
        assert_eq!(cli.mode(), AttachMode::Generic);
        let cli = LoaderCli::try_parse_from(["fdrop-loader", "-d", "eth0", "-A"]).unwrap();
        assert_eq!(cli.mode(), AttachMode::Auto);

        let err =
            LoaderCli::try_parse_from(["fdrop-loader", "-d", "eth0", "-S", "-N"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentConflict);
    }

    #[test]
    fn purge_needs_unload() {
        let err = LoaderCli::try_parse_from(["fdrop-loader", "-d", "eth0", "--purge"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
        let cli =
            LoaderCli::try_parse_from(["fdrop-loader", "-d", "eth0", "-U", "--purge"]).unwrap();
        let config = cli.into_config(eth0()).unwrap();
        assert!(config.unload && config.purge);
    }

    #[test]
    fn missing_device_is_config_error() {
        let cli = LoaderCli::try_parse_from(["fdrop-loader"]).unwrap();
        assert!(matches!(cli.device(), Err(ConfigError::MissingDevice)));
    }

    #[test]
    fn loader_layout_options() {
        let cli = LoaderCli::try_parse_from([
            "fdrop-loader",
            "-d",
            "eth0",
            "--pin-root",
            "/run/bpf",
            "--feature",
            "edge",
            "--layout",
            "per-interface",
            "--capacity",
            "64",
            "--filename",
            "/tmp/fdrop.o",
        ])
        .unwrap();
        let config = cli.into_config(eth0()).unwrap();
        assert_eq!(config.capacity, 64);
        assert_eq!(config.object, ObjectSource::File(PathBuf::from("/tmp/fdrop.o")));
        assert_eq!(
            config.layout.table_name("eth0").unwrap().to_string(),
            "/run/bpf/edge/eth0/fdrop_map_v1"
        );
    }

    #[test]
    fn zero_capacity_rejected() {
        let cli =
            LoaderCli::try_parse_from(["fdrop-loader", "-d", "eth0", "--capacity", "0"]).unwrap();
        assert!(matches!(
            cli.into_config(eth0()),
            Err(ConfigError::ZeroCapacity)
        ));
    }

    #[test]
    fn ctl_ops() {
        let cli = CtlCli::try_parse_from([
            "fdrop-ctl", "--dev", "eth0", "--ops", "add", "--src-ip", "10.0.0.5",
        ])
        .unwrap();
        let config = cli.into_config(eth0()).unwrap();
        assert_eq!(config.op, Op::Add(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(config.output, OutputFormat::Text);

        let cli = CtlCli::try_parse_from([
            "fdrop-ctl", "-d", "eth0", "--ops", "dump", "--output", "json",
        ])
        .unwrap();
        let config = cli.into_config(eth0()).unwrap();
        assert_eq!(config.op, Op::Dump);
        assert_eq!(config.output, OutputFormat::Json);
    }

    #[test]
    fn ctl_rejects_bad_input() {
        let cli = CtlCli::try_parse_from(["fdrop-ctl", "-d", "eth0", "--ops", "del"]).unwrap();
        assert!(matches!(
            cli.into_config(eth0()),
            Err(ConfigError::MissingAddress { op: "del" })
        ));

        let err =
            CtlCli::try_parse_from(["fdrop-ctl", "-d", "eth0", "--ops", "flush"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);

        let err = CtlCli::try_parse_from([
            "fdrop-ctl", "-d", "eth0", "--ops", "get", "--src-ip", "10.0.0.256",
        ])
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);

        let err = CtlCli::try_parse_from(["fdrop-ctl", "-d", "eth0"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }
}
