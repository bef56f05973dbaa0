// Network boot server for bare metal provisioning
use clap::Parser;
use color_eyre::eyre::Result;
use ipnetwork::Ipv4Network;
use netboot_dhcp::DhcpClient;
use netboot_server::{
    bind_listeners, interface_hardware_addr, select_mode, valid_interfaces, BootstrapOptions, IpLink,
    SharedState, Supervisor,
};
use std::io::stderr;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "Network boot server: DHCP, PXE, TFTP, iPXE and DNS", long_about = None)]
struct Cli {
    /// Server root, where profiles, assets and TFTP files are served from
    #[arg(long, env = "NETBOOT_ROOT", default_value = ".")]
    root: PathBuf,

    /// Interface to bring up and serve on
    #[arg(long = "if", env = "NETBOOT_INTERFACE", default_value = "eth0")]
    interface: String,

    /// Address to take, and subnet to lease, when no DHCP server answers
    #[arg(long, env = "NETBOOT_ADDR", default_value = "192.168.123.1/24")]
    addr: Ipv4Network,

    /// Override the advertised gateway address
    #[arg(long, env = "NETBOOT_GW")]
    gw: Option<Ipv4Addr>,

    /// Override the DNS forwarder (address, or address:port)
    #[arg(long, env = "NETBOOT_DNS", value_parser = parse_forwarder)]
    dns: Option<SocketAddr>,

    /// Name elected control-plane nodes are registered under
    #[arg(long, env = "NETBOOT_CONTROLPLANE", default_value = netboot_server::config::DEFAULT_CONTROLPLANE)]
    controlplane: String,

    /// Seconds to wait for an upstream DHCP server
    #[arg(long, env = "NETBOOT_DHCP_TIMEOUT", default_value_t = 10)]
    dhcp_timeout: u64,

    /// Verbose output - shows more detailed logs
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

fn parse_forwarder(value: &str) -> std::result::Result<SocketAddr, String> {
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }
    value
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, 53))
        .map_err(|_| format!("invalid DNS forwarder {value:?}"))
}

fn local_hostname() -> Option<String> {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    // RUST_LOG overrides the defaults
    let level = if cli.verbose { "debug" } else { "info" };
    let default_directives = format!(
        "netboot={level},netboot_server={level},netboot_dhcp={level},netboot_dns={level},netboot_tftp={level},netboot_ipxe={level},tower_http=warn,hyper=warn"
    );
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));
    registry().with(filter).with(fmt::layer().with_writer(stderr)).init();

    let interfaces = valid_interfaces()?;
    info!("Valid interfaces are:");
    for iface in &interfaces {
        info!(mac = ?iface.mac_addr, " - {}", iface.name);
    }
    info!(interface = %cli.interface, "Selected interface");

    let hardware_addr = interface_hardware_addr(&cli.interface)?;
    let mut client = DhcpClient::new(cli.interface.clone(), hardware_addr);
    if let Some(hostname) = local_hostname() {
        debug!(hostname = %hostname, "Announcing hostname to upstream DHCP");
        client = client.with_hostname(hostname);
    }

    let opts = BootstrapOptions::new(cli.interface.clone(), cli.addr)
        .with_root(cli.root)
        .with_gateway(cli.gw)
        .with_dns(cli.dns.into_iter().collect())
        .with_controlplane(cli.controlplane)
        .with_dhcp_timeout(Duration::from_secs(cli.dhcp_timeout));

    let config = select_mode(&opts, &client, &IpLink).await?;
    let shared = SharedState::new();
    let services = bind_listeners(&config, &shared).await?;

    let (supervisor, shutdown) = Supervisor::new(services);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, shutting down");
            shutdown.shutdown();
        }
    });

    // Listeners still running are torn down with the runtime
    supervisor.serve().await?;
    info!("Shutdown complete");
    Ok(())
}
