use async_presence::{
    system::{ArpMethod, SystemNetworkConfig},
    DetectionResult, DetectorConfigBuilder, DhcpListenService, PresenceDetector, ResultListener,
    SystemNetwork, TokioScheduler,
};
use clap::Parser;
use std::{sync::Arc, time::Duration};

/// Simple example to show presence detection of a single host
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Host name or IP address of the device to look for
    #[arg(long)]
    host: String,
    /// TCP ports to try connecting to, comma separated
    #[arg(short, long, value_delimiter = ',')]
    ports: Vec<u16>,
    /// Send ARP requests through a raw socket instead of an arping executable
    #[arg(long)]
    raw_arp: bool,
    /// Per check timeout in milliseconds
    #[arg(short, long, default_value_t = 5000)]
    timeout: u64,
    /// Keep refreshing (and listening for DHCP) for this many seconds
    #[arg(short, long)]
    watch: Option<u64>,
}

struct Print;

impl ResultListener for Print {
    fn partial_result(&self, result: &DetectionResult) {
        println!("partial: {}", result);
    }

    fn final_result(&self, result: &DetectionResult) {
        println!("final: {}", result);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();
    let config = DetectorConfigBuilder::new(&args.host)
        .with_tcp_ports(args.ports)
        .with_timeout(Duration::from_millis(args.timeout))
        .with_refresh_interval(Duration::from_secs(10))
        .build()
        .unwrap();
    let network = if args.raw_arp {
        SystemNetwork::new(SystemNetworkConfig {
            arp_method: ArpMethod::RawSocket,
            ..Default::default()
        })
    } else {
        SystemNetwork::detect().await
    };

    match args.watch {
        Some(seconds) => {
            let detector = PresenceDetector::with_dhcp_registry(
                config,
                network,
                Arc::new(Print),
                Arc::new(DhcpListenService::new()),
            );
            detector.start_automatic_refresh(&TokioScheduler).await;
            tokio::time::sleep(Duration::from_secs(seconds)).await;
            detector.stop_automatic_refresh();
        }
        None => {
            let detector = PresenceDetector::new(config, network, Arc::new(Print));
            let result = detector.value().await.unwrap();
            println!(
                "{} is {}",
                args.host,
                if result.is_reachable() { "present" } else { "absent" }
            );
        }
    }
}
