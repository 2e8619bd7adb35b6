//! chainboot daemon: ProxyDHCP + TFTP + HTTP netboot chainloader.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tikv_jemallocator::Jemalloc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chainboot::booter::PolicyConfig;
use chainboot::dhcp6::{ApiBootConfiguration, RandomAddressPool, StaticBootConfiguration};
use chainboot::domain::Firmware;
use chainboot::{ApiBooter, Server, ServerV6, StaticBooter};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser)]
#[command(name = "chainboot")]
#[command(about = "ProxyDHCP network boot server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot every machine into one fixed kernel and initrds
    Boot {
        /// Kernel path or HTTP URL
        kernel: String,
        /// Init ramdisk paths or HTTP URLs
        initrd: Vec<String>,
        /// Kernel command line; {{ URL "…" }} tokens become served files
        #[arg(long, default_value = "")]
        cmdline: String,
        /// Message to print on the client before booting
        #[arg(long, default_value = "")]
        message: String,
        #[command(flatten)]
        server: ServerFlags,
    },
    /// Ask an HTTP JSON policy API what each machine should boot
    Api {
        /// Policy server base URL
        url: String,
        /// Timeout for policy requests, in seconds
        #[arg(long = "api-timeout", default_value_t = 10)]
        timeout: u64,
        #[command(flatten)]
        server: ServerFlags,
    },
    /// Ask a gRPC boot policy service what each machine should boot
    Grpc {
        /// Policy configuration file (JSON)
        config: PathBuf,
        /// Partition to ask boot decisions for
        #[arg(long)]
        partition: String,
        #[command(flatten)]
        server: ServerFlags,
    },
    /// Serve a fixed DHCPv6 boot configuration
    Bootipv6 {
        #[command(flatten)]
        v6: V6Flags,
        /// Bootloader URL for UEFI HTTP-boot clients
        #[arg(long = "httpboot-url")]
        httpboot_url: String,
        /// iPXE script URL for everything else
        #[arg(long = "ipxe-url")]
        ipxe_url: String,
    },
    /// Serve DHCPv6 boot URLs from an HTTP policy API
    Ipv6api {
        #[command(flatten)]
        v6: V6Flags,
        /// Policy server base URL
        #[arg(long = "api-url")]
        api_url: String,
        /// Timeout for policy requests, in seconds
        #[arg(long = "api-timeout", default_value_t = 10)]
        timeout: u64,
    },
}

#[derive(Args)]
struct ServerFlags {
    /// IPv4 address to listen on
    #[arg(short = 'l', long = "listen-addr", default_value = "0.0.0.0")]
    listen_addr: Ipv4Addr,
    /// Port for the HTTP boot script and file endpoints
    #[arg(long = "port", default_value_t = 80)]
    http_port: u16,
    #[arg(long = "dhcp-port", default_value_t = 67, hide = true)]
    dhcp_port: u16,
    #[arg(long = "tftp-port", default_value_t = 69, hide = true)]
    tftp_port: u16,
    #[arg(long = "pxe-port", default_value_t = 4011, hide = true)]
    pxe_port: u16,
    /// Don't bind the DHCP port; watch it through a raw socket so an
    /// existing DHCP daemon can keep running (Linux, needs --interface)
    #[arg(long = "dhcp-no-bind")]
    dhcp_no_bind: bool,
    /// Network interface to serve on
    #[arg(long)]
    interface: Option<String>,
    /// iPXE binary for BIOS/UNDI clients
    #[arg(long = "ipxe-bios")]
    ipxe_bios: Option<PathBuf>,
    /// iPXE binary for clients already running a native iPXE ROM
    #[arg(long = "ipxe-ipxe")]
    ipxe_ipxe: Option<PathBuf>,
    /// iPXE binary for 32-bit EFI clients
    #[arg(long = "ipxe-efi32")]
    ipxe_efi32: Option<PathBuf>,
    /// iPXE binary for 64-bit EFI clients
    #[arg(long = "ipxe-efi64")]
    ipxe_efi64: Option<PathBuf>,
    /// iPXE binary for EFI byte-code clients
    #[arg(long = "ipxe-efibc")]
    ipxe_efibc: Option<PathBuf>,
    /// Write received DHCP packets to a pcap file
    #[arg(long = "pcap-trace")]
    pcap_trace: Option<PathBuf>,
}

#[derive(Args)]
struct V6Flags {
    /// Interface to join the DHCPv6 all-servers group on
    #[arg(long)]
    interface: String,
    /// First address of the allocation pool
    #[arg(long = "pool-start")]
    pool_start: Ipv6Addr,
    /// Number of addresses in the pool
    #[arg(long = "pool-size", default_value_t = 50)]
    pool_size: u64,
    /// Address valid lifetime, seconds
    #[arg(long = "valid-lifetime", default_value_t = 1800)]
    valid_lifetime: u32,
    /// Address preferred lifetime, seconds; T1/T2 derive from it
    #[arg(long = "preferred-lifetime", default_value_t = 1440)]
    preferred_lifetime: u32,
    /// Server preference value to advertise
    #[arg(long)]
    preference: Option<u8>,
    /// Recursive DNS servers to advertise
    #[arg(long = "dns")]
    dns_servers: Vec<Ipv6Addr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chainboot=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Boot {
            kernel,
            initrd,
            cmdline,
            message,
            server,
        } => {
            let booter = StaticBooter::new(kernel, initrd, cmdline, message)
                .context("building static boot spec")?;
            run_server(Arc::new(booter), server, None).await
        }
        Commands::Api {
            url,
            timeout,
            server,
        } => {
            let booter = ApiBooter::new(&url, Duration::from_secs(timeout))
                .context("setting up policy API client")?;
            info!("using policy API at {}", url);
            run_server(Arc::new(booter), server, None).await
        }
        Commands::Grpc {
            config, partition, ..
        } => {
            let raw = std::fs::read_to_string(&config)
                .with_context(|| format!("reading {}", config.display()))?;
            let policy: PolicyConfig =
                serde_json::from_str(&raw).context("parsing policy configuration")?;
            if policy.grpc_address.is_empty() {
                bail!("policy configuration has no gRPC address");
            }
            // The transport client is deployment-specific and not
            // linked into this binary; embedders construct a
            // GrpcBooter over their BootService implementation.
            bail!(
                "no gRPC transport is linked into this build; \
                 use chainboot::GrpcBooter with your BootService client \
                 (partition {partition})"
            );
        }
        Commands::Bootipv6 {
            v6,
            httpboot_url,
            ipxe_url,
        } => {
            let config = Arc::new(StaticBootConfiguration::new(
                &httpboot_url,
                &ipxe_url,
                v6.preference,
                v6.dns_servers.clone(),
            ));
            run_server_v6(config, v6).await
        }
        Commands::Ipv6api { v6, api_url, timeout } => {
            let config = Arc::new(
                ApiBootConfiguration::new(
                    &api_url,
                    Duration::from_secs(timeout),
                    v6.preference,
                    v6.dns_servers.clone(),
                )
                .context("setting up DHCPv6 policy API client")?,
            );
            run_server_v6(config, v6).await
        }
    }
}

async fn run_server(
    booter: Arc<dyn chainboot::Booter>,
    flags: ServerFlags,
    policy_config: Option<PolicyConfig>,
) -> Result<()> {
    let ipxe = load_ipxe(&flags)?;
    if ipxe.is_empty() {
        bail!("no iPXE binaries configured; pass at least one --ipxe-* flag");
    }

    let mut server = Server::new(booter, ipxe)
        .with_address(flags.listen_addr)
        .with_http_port(flags.http_port)
        .with_dhcp_port(flags.dhcp_port)
        .with_tftp_port(flags.tftp_port)
        .with_pxe_port(flags.pxe_port)
        .with_dhcp_no_bind(flags.dhcp_no_bind);
    if let Some(interface) = flags.interface {
        server = server.with_interface(interface);
    }
    if let Some(path) = flags.pcap_trace {
        server = server.with_pcap_trace(path);
    }
    if let Some(config) = policy_config {
        server = server.with_policy_config(config);
    }

    info!("starting chainboot server");
    server.serve().await
}

fn load_ipxe(flags: &ServerFlags) -> Result<HashMap<Firmware, Vec<u8>>> {
    let sources = [
        (Firmware::X86Pc, &flags.ipxe_bios),
        (Firmware::X86Ipxe, &flags.ipxe_ipxe),
        (Firmware::Efi32, &flags.ipxe_efi32),
        (Firmware::Efi64, &flags.ipxe_efi64),
        (Firmware::EfiBc, &flags.ipxe_efibc),
    ];

    let mut ipxe = HashMap::new();
    for (fw, path) in sources {
        if let Some(path) = path {
            let bytes = std::fs::read(path)
                .with_context(|| format!("reading iPXE binary {}", path.display()))?;
            info!("loaded {} bytes of iPXE for {}", bytes.len(), fw);
            ipxe.insert(fw, bytes);
        }
    }
    Ok(ipxe)
}

async fn run_server_v6(
    config: Arc<dyn chainboot::dhcp6::BootConfiguration>,
    flags: V6Flags,
) -> Result<()> {
    let pool = Arc::new(RandomAddressPool::new(
        flags.pool_start,
        flags.pool_size,
        flags.valid_lifetime,
    ));
    let server = ServerV6::new(
        flags.interface,
        config,
        pool,
        flags.preferred_lifetime,
    );

    let running = Arc::new(AtomicBool::new(true));
    let serve_flag = running.clone();
    let mut task = tokio::task::spawn_blocking(move || server.serve(serve_flag));

    tokio::select! {
        res = &mut task => res.context("DHCPv6 server panicked")?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            running.store(false, Ordering::SeqCst);
            Ok(())
        }
    }
}
