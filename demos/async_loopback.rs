use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc;

use balink::r#async::Client;
use balink::{Addr, LinkConfig};

#[derive(Parser, Debug)]
struct Opt {
    #[clap(short = 'e')]
    ext: bool,

    #[clap(short = 'v', default_value = "0")]
    v: usize,

    #[clap(default_value = "hello world")]
    msg: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();
    stderrlog::new()
        .module("balink")
        .verbosity(opt.v)
        .init()
        .unwrap();
    let config = LinkConfig {
        extended: opt.ext,
        ..LinkConfig::default()
    };
    let (a_tx, b_rx) = mpsc::channel(16);
    let (b_tx, a_rx) = mpsc::channel(16);

    let server_config = config.clone();
    tokio::spawn(async move {
        let mut c = Client::new(
            Addr::new("M0THC-2")?,
            server_config,
            b_tx,
            b_rx,
        );
        c.accept().await?;
        loop {
            let data = c.read().await?;
            if data.is_empty() {
                return Ok::<_, anyhow::Error>(());
            }
            c.write(&data).await?;
        }
    });

    let mut client = Client::new(Addr::new("M0THC-1")?, config, a_tx, a_rx);
    client.connect(&Addr::new("M0THC-2")?).await?;
    println!("Connected");
    client.write(opt.msg.as_bytes()).await?;
    let data = client.read().await?;
    println!("{}", String::from_utf8_lossy(&data));
    client.disconnect().await?;
    println!("Disconnected");
    Ok(())
}
