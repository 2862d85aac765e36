mod relaytun;

use clap::Parser;

use relaytun::{app::RunOptions, config::TunnelEntry, tunnel::policy::PolicyKind, tunnel::target::Target};

#[derive(Debug, Parser)]
#[command(
    name = "relaytun",
    version,
    about = "relaytun - reach private VM ports through a resumable relay tunnel"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses RELAYTUN_CONFIG; then auto-detects relaytun.toml > relaytun.yaml > relaytun.yml from CWD; then falls back to the user config dir.
    #[arg(long, env = "RELAYTUN_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Project of a tunnel to open in addition to the configured ones.
    #[arg(long, requires_all = ["zone", "instance", "port"])]
    project: Option<String>,

    #[arg(long, requires = "project")]
    zone: Option<String>,

    #[arg(long, requires = "project")]
    instance: Option<String>,

    /// Remote port, e.g. 3389 for RDP or 22 for SSH.
    #[arg(long, requires = "project")]
    port: Option<u16>,

    /// Network interface on the instance.
    #[arg(long, default_value = "nic0")]
    interface: String,

    /// Which local processes may use the tunnel: any | process | user.
    #[arg(long, default_value = "any")]
    policy: PolicyKind,

    /// Print local endpoints as JSON lines.
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn extra_tunnel(&self) -> anyhow::Result<Option<TunnelEntry>> {
        let (Some(project), Some(zone), Some(instance), Some(port)) =
            (&self.project, &self.zone, &self.instance, self.port)
        else {
            return Ok(None);
        };
        let mut target = Target::new(project.trim(), zone.trim(), instance.trim(), port);
        target.interface = self.interface.trim().to_string();
        target.validate()?;
        Ok(Some(TunnelEntry {
            target,
            policy: self.policy,
        }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let extra_tunnel = cli.extra_tunnel()?;
    relaytun::run(RunOptions {
        config_path: cli.config,
        extra_tunnel,
        json: cli.json,
    })
    .await
}
