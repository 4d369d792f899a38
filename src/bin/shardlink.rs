use std::path::PathBuf;

use clap::Parser;
use shardlink::{setup_local_tracing, AppError, AppResult, MainReactor, ServerConfig};
use tokio::runtime;
use tracing::info;

#[derive(Parser)]
#[command(version, about = "echo server on the shardlink reactor")]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log more (any count turns on debug output)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    /// print the effective configuration and exit
    PrintConfig,
}

fn load_config(commandline: &CommandLine) -> AppResult<ServerConfig> {
    match &commandline.conf {
        Some(path) => ServerConfig::set_up_config(PathBuf::from(path)),
        None => {
            let path = PathBuf::from("./conf.toml");
            if path.exists() {
                ServerConfig::set_up_config(path)
            } else {
                let config = ServerConfig::default();
                config.validate()?;
                Ok(config)
            }
        }
    }
}

fn main() -> AppResult<()> {
    let commandline = CommandLine::parse();
    let config = load_config(&commandline)?;

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", config);
        return Ok(());
    }

    setup_local_tracing(config.debug || commandline.verbose > 0)?;

    let rt = runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("shardlink-worker")
        .build()?;

    rt.block_on(async move {
        let framing = config.framing();
        let reactor = MainReactor::builder(config)
            .on_connect(|conn| info!("{} connected as {}", conn.peer_addr(), conn.id()))
            .on_disconnect(|conn| info!("{} disconnected", conn.id()))
            .on_request(move |ctx| match framing.encode(ctx.body()) {
                Ok(frame) => {
                    ctx.output(frame);
                }
                Err(e) => {
                    info!("echo dropped: {}", e);
                    ctx.abort();
                }
            })
            .build()?;

        let addrs = reactor.start().await?;
        info!("echo server listening on {:?}", addrs);

        tokio::signal::ctrl_c()
            .await
            .map_err(|e| AppError::DetailedIoError(format!("waiting for ctrl-c: {}", e)))?;
        reactor.shutdown();
        Ok(())
    })
}
