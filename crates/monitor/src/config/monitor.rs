use std::path::PathBuf;

use clap::Args;

#[derive(Args, Debug, Clone)]
pub struct MonitorArgs {
    #[arg(
        long,
        global = true,
        env = "PU_MONITOR_STORE_PATH",
        value_hint = clap::ValueHint::DirPath,
        default_value = "/var/run/pu-monitor/uid",
        help = "Root directory of the context store"
    )]
    pub store_path: PathBuf,

    #[arg(
        long,
        global = true,
        env = "PU_MONITOR_NETCLS_ROOT",
        value_hint = clap::ValueHint::DirPath,
        default_value = "/sys/fs/cgroup/net_cls",
        help = "Mount point of the net_cls cgroup hierarchy"
    )]
    pub netcls_root: PathBuf,

    #[arg(
        long,
        global = true,
        env = "PU_MONITOR_BASE_CGROUP",
        default_value = "/pu-monitor",
        help = "Cgroup all processing-unit cgroups are created under"
    )]
    pub base_cgroup: String,

    #[arg(
        long,
        global = true,
        env = "PU_MONITOR_RELEASE_AGENT",
        value_hint = clap::ValueHint::FilePath,
        help = "Program the kernel runs when a cgroup becomes empty"
    )]
    pub release_agent: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "PU_MONITOR_METRICS_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Path for container event records, e.g. /var/log/pu-monitor/metrics.log"
    )]
    pub metrics_file: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct PurgeArgs {
    #[arg(long, help = "Confirm removal of every stored context")]
    pub yes: bool,
}
