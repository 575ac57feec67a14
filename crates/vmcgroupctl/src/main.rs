//! # vmcgroupctl
//! Host side tool to inspect and shape the cgroups of virtual machine compute
//! processes, on cgroup v1 and v2 hosts alike.
mod commands;
mod observability;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{crate_version, Parser};
use libvmcgroups::common::{DEFAULT_CGROUP_ROOT, DEFAULT_HOST_ROOT, DEFAULT_PROC_ROOT};
use libvmcgroups::resolver::{CgroupConfig, CgroupResolver};
use libvmcgroups::trampoline::DEFAULT_HELPER;
use tracing::Level;

use crate::commands::{
    attach, cpu_weight, cpuset, dedicated, info, make_threaded, threads, OutputFormat,
};
use crate::observability::LogFormat;

#[derive(Parser, Debug)]
#[clap(version = crate_version!(), author = env!("CARGO_PKG_AUTHORS"))]
struct Opts {
    #[clap(flatten)]
    global: GlobalOpts,

    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Parser, Debug)]
struct GlobalOpts {
    /// Mount point of the cgroup filesystem
    #[clap(long, default_value = DEFAULT_CGROUP_ROOT, global = true)]
    cgroup_root: PathBuf,
    /// Root of the procfs used to discover processes
    #[clap(long, default_value = DEFAULT_PROC_ROOT, global = true)]
    proc_root: PathBuf,
    /// Prefix under which the host filesystem is visible
    #[clap(long, default_value = DEFAULT_HOST_ROOT, global = true)]
    host_root: PathBuf,
    /// Privileged helper applying resources
    #[clap(long, default_value = DEFAULT_HELPER, global = true)]
    helper: PathBuf,
    /// Ask the helper to apply resources in rootless mode
    #[clap(long, global = true)]
    rootless: bool,
    /// Write logs to this file instead of stderr
    #[clap(short, long, global = true)]
    log: Option<PathBuf>,
    #[clap(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
    /// Log level, takes precedence over --debug
    #[clap(long, global = true)]
    log_level: Option<Level>,
    /// Enable debug logging
    #[clap(long, global = true)]
    debug: bool,
    /// Output format of the command result
    #[clap(long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    format: OutputFormat,
}

impl From<&GlobalOpts> for CgroupConfig {
    fn from(opts: &GlobalOpts) -> Self {
        Self {
            cgroup_root: opts.cgroup_root.clone(),
            proc_root: opts.proc_root.clone(),
            host_root: opts.host_root.clone(),
            rootless: opts.rootless,
            helper: opts.helper.clone(),
        }
    }
}

#[derive(Parser, Debug)]
enum SubCommand {
    Info(info::Info),
    Cpuset(cpuset::Cpuset),
    CpuWeight(cpu_weight::CpuWeight),
    Threads(threads::Threads),
    Attach(attach::Attach),
    MakeThreaded(make_threaded::MakeThreaded),
    DedicatedCpus(dedicated::DedicatedCpus),
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if let Err(e) = observability::init(&opts) {
        eprintln!("log init failed: {:?}", e);
    }

    tracing::debug!(
        "started by user {} with {:?}",
        nix::unistd::geteuid(),
        std::env::args_os()
    );

    let config = CgroupConfig::from(&opts.global);
    let resolver = CgroupResolver::new(config).context("failed to set up cgroup resolver")?;
    let format = opts.global.format;

    match opts.subcmd {
        SubCommand::Info(args) => info::info(args, &resolver, format),
        SubCommand::Cpuset(args) => cpuset::cpuset(args, &resolver, format),
        SubCommand::CpuWeight(args) => cpu_weight::cpu_weight(args, &resolver, format),
        SubCommand::Threads(args) => threads::threads(args, &resolver, format),
        SubCommand::Attach(args) => attach::attach(args, &resolver),
        SubCommand::MakeThreaded(args) => make_threaded::make_threaded(args, &resolver),
        SubCommand::DedicatedCpus(args) => dedicated::dedicated_cpus(args, &resolver, format),
    }
}
