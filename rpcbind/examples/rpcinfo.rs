use std::{io, net::IpAddr};

use rpcbind::{client::prelude::*, common::rpcbind::xdr::RpcbStat};

use clap::{Parser, Subcommand};

/// Query an rpcbind server
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Server to query
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Server port
    #[clap(short, long, default_value_t = RPCBIND_PORT)]
    port: u16,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List all registrations
    Dump,
    /// Look up the TCP address of a program
    Getaddr { prog: u32, vers: u32 },
    /// Show call statistics
    Getstat,
}

fn print_stat(version: usize, stat: &RpcbStat) {
    println!("rpcbind (version {}) statistics", version + 2);
    let calls: Vec<_> = stat
        .info
        .iter()
        .enumerate()
        .filter(|(_, n)| **n != 0)
        .map(|(proc, n)| format!("{}:{}", proc, n))
        .collect();
    println!("  calls: {}", calls.join(" "));
    println!("  set: {} unset: {}", stat.setinfo, stat.unsetinfo);
    for addr in &stat.addrinfo.0 {
        println!(
            "  getaddr {} {} {}: {} ok, {} failed",
            addr.prog, addr.vers, addr.netid, addr.success, addr.failure
        );
    }
    for rmt in &stat.rmtinfo.0 {
        println!(
            "  rmtcall {} {} {} {}: {} ok, {} failed, {} indirect",
            rmt.prog, rmt.vers, rmt.proc, rmt.netid, rmt.success, rmt.failure, rmt.indirect
        );
    }
}

#[async_std::main]
async fn main() -> io::Result<()> {
    femme::with_level(log::LevelFilter::Warn);
    let args = Args::parse();

    let mut client = RpcbindClient::connect_tcp((args.host, args.port))
        .await
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

    let res = match args.command {
        Command::Dump => client.dump(RPCBVERS4).await.map(|list| {
            println!("{:>10} {:>5} {:>9} {:>24} {}", "program", "vers", "netid", "address", "owner");
            for rpcb in list {
                println!(
                    "{:>10} {:>5} {:>9} {:>24} {}",
                    rpcb.r_prog, rpcb.r_vers, rpcb.r_netid, rpcb.r_addr, rpcb.r_owner
                );
            }
        }),
        Command::Getaddr { prog, vers } => client
            .getaddr(RPCBVERS4, Rpcb::new(prog, vers, "tcp", "", ""))
            .await
            .map(|uaddr| {
                if uaddr.is_empty() {
                    println!("program {} version {} is not available", prog, vers);
                } else {
                    println!("{}", uaddr);
                }
            }),
        Command::Getstat => client.getstat().await.map(|stats| {
            for (version, stat) in stats.iter().enumerate() {
                print_stat(version, stat);
            }
        }),
    };
    res.map_err(|err| io::Error::new(io::ErrorKind::Other, err))
}
