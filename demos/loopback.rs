use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;

use balink::mem::MemPort;
use balink::{Addr, Client, LinkConfig};

#[derive(Parser, Debug)]
struct Opt {
    #[clap(short = 'e')]
    ext: bool,

    #[clap(short = 'v', default_value = "0")]
    v: usize,

    #[clap(default_value = "hello world")]
    msg: String,
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    stderrlog::new()
        .module("balink")
        .verbosity(opt.v)
        .init()
        .unwrap();
    let (a, b) = MemPort::pair();
    let config = LinkConfig {
        extended: opt.ext,
        ..LinkConfig::default()
    };
    let done = Arc::new(AtomicBool::new(false));

    let server_config = config.clone();
    let server_done = done.clone();
    let server = std::thread::spawn(move || -> Result<()> {
        let mut c = Client::new(Addr::new("M0THC-2")?, server_config, Box::new(b));
        if !c.accept(Instant::now() + Duration::from_secs(10))? {
            eprintln!("server: nobody connected");
            return Ok(());
        }
        while let Some(data) = c.read_until(server_done.clone())? {
            c.write(&data)?;
        }
        Ok(())
    });

    let mut c = Client::new(Addr::new("M0THC-1")?, config, Box::new(a));
    eprintln!("==== CONNECTING");
    c.connect(&Addr::new("M0THC-2")?)?;
    eprintln!("==== WRITING");
    c.write(opt.msg.as_bytes())?;
    if let Some(data) = c.read_until(done.clone())? {
        println!("{}", String::from_utf8_lossy(&data));
    }
    c.disconnect()?;
    server.join().unwrap()?;
    Ok(())
}
