use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use clap::Parser;
use crossbeam_channel::unbounded;
use tracing::info;
use tracing_subscriber::EnvFilter;
use xpressnet_gateway::{
    config::Config,
    controller::{Controller, MockController, RealController},
    dispatcher::Dispatcher,
    net::{OverflowPolicy, SocketServer},
    transport::{SerialTransport, serial_opener},
};

#[derive(Parser, Debug)]
#[command(about = "Socket gateway for a Hornby Elite command station")]
struct Args {
    /// Address to accept client connections on.
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,
    /// Drive a hardware-free mock instead of the serial port.
    #[arg(long)]
    mock: bool,
    /// Disconnect subscribers that fall behind instead of shedding their
    /// oldest queued message.
    #[arg(long)]
    strict_subscribers: bool,
}

fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();
    let config = Config::from_env();

    if config.http_server_enable {
        // The status page is a separate collaborator; we only note the
        // operator asked for it.
        info!(port = config.http_server_port, "status page expected on the external http server");
    }

    // The one fatal failure: everything else degrades while the gateway
    // stays up.
    let mut server = SocketServer::bind(args.listen).expect("couldn't bind client listener");
    if args.strict_subscribers {
        server = server.with_overflow_policy(OverflowPolicy::Close);
    }

    let (events_tx, events_rx) = unbounded();
    let controller: Box<dyn Controller> = if args.mock {
        info!("using mock controller");
        Box::new(MockController::new(events_tx))
    } else {
        let opener = serial_opener(config.serial_device.clone(), config.serial_baud);
        let transport = SerialTransport::new(opener, config.command_delay, events_tx);
        Box::new(RealController::new(transport))
    };

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || stop.store(true, Ordering::Relaxed))
            .expect("couldn't install signal handler");
    }

    info!(listen = %args.listen, device = %config.serial_device, baud = config.serial_baud, mock = args.mock, "gateway up");
    Dispatcher::new(controller, server, events_rx, stop).run();
    info!("gateway stopped");
}
