use std::{
    io,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use async_std::task;
use futures::future::{self, Either};
use nix::sys::signal::{SigSet, Signal};
use rpcbind::server::{prelude::*, warmstart::WarmstartFile};

use clap::Parser;

/// Universal address to RPC program number mapper
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Addresses to listen on
    #[clap(short = 'H', long = "host", default_value = "0.0.0.0")]
    hosts: Vec<IpAddr>,

    /// UDP and TCP port
    #[clap(short, long, default_value_t = RPCBIND_PORT)]
    port: u16,

    /// Path of the local transport socket
    #[clap(short, long, default_value = RPCBIND_SOCKET)]
    socket: PathBuf,

    /// Allow registration from remote hosts
    #[clap(short, long)]
    insecure: bool,

    /// Log every call
    #[clap(short, long)]
    debug: bool,

    /// Log refused calls
    #[clap(short = 'l', long)]
    verbose: bool,

    /// Abort on fatal errors
    #[clap(short, long)]
    abort: bool,

    /// Keep registrations in this file across restarts
    #[clap(short, long)]
    warmstart: Option<PathBuf>,

    /// Seconds before an idle stream connection is closed
    #[clap(long, default_value_t = 30)]
    idle_timeout: u64,
}

fn main() -> io::Result<()> {
    let args = Args::parse();
    femme::with_level(if args.debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    });

    // Block termination signals before any runtime thread exists so they can be waited for
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    signals.thread_block()?;

    task::block_on(run(args, signals))
}

async fn run(args: Args, signals: SigSet) -> io::Result<()> {
    let listen_addrs = args
        .hosts
        .iter()
        .copied()
        .filter(|ip| !ip.is_unspecified())
        .collect();
    let config = ServerConfig::default()
        .debug(args.debug)
        .verbose(args.verbose)
        .insecure(args.insecure)
        .abort_on_fatal(args.abort)
        .idle_timeout(Duration::from_secs(args.idle_timeout))
        .listen_addrs(listen_addrs);

    let mut builder = RpcbindBuilder::new(config);
    if let Some(path) = &args.warmstart {
        builder = builder.persistence(WarmstartFile::new(path));
    }
    let server = builder.build();
    server.load_warmstart().await?;

    let mut listeners = vec![task::spawn(server.clone().bind_unix(args.socket.clone()))];
    for host in &args.hosts {
        let addr = SocketAddr::new(*host, args.port);
        listeners.push(task::spawn(server.clone().bind(addr)));
    }

    let serving = Box::pin(future::try_join_all(listeners));
    let stopped = Box::pin(task::spawn_blocking(move || signals.wait()));
    match future::select(serving, stopped).await {
        Either::Left((Err(err), _)) => {
            log::error!("Listener failed: {}", err);
            Err(err)
        }
        Either::Left((Ok(_), _)) => Ok(()),
        Either::Right((signal, _)) => {
            log::info!("Stopping on {:?}", signal?);
            server.save_warmstart().await?;
            let _ = std::fs::remove_file(&args.socket);
            Ok(())
        }
    }
}
