// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use driftmq::{
    setup_local_tracing, setup_tracing, AppResult, Broker, BrokerConfig, LocalHub,
};
use tokio::{runtime, signal};
use tracing::{error, info};

const DEFAULT_CONFIG: &str = "./conf/driftmq.toml";

#[derive(Parser)]
#[command(version, about = "driftmq broker")]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<PathBuf>,
    /// write rolling log files here and export spans over OTLP
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print the effective configuration and exit
    PrintConfig,
}

fn main() -> AppResult<()> {
    dotenv().ok();
    let commandline = CommandLine::parse();
    if std::env::var_os("RUST_LOG").is_none() {
        let level = match commandline.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", format!("driftmq={}", level));
    }

    let config_path = commandline.conf.clone().or_else(|| {
        let default = PathBuf::from(DEFAULT_CONFIG);
        default.exists().then_some(default)
    });
    let broker_config = BrokerConfig::set_up_config(config_path.as_deref())?;

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", broker_config);
        return Ok(());
    }

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let _otel_guard = match &commandline.log_dir {
        Some(log_dir) => {
            let server_id = &broker_config.general.server_id;
            Some(rt.block_on(setup_tracing(log_dir, server_id))?)
        }
        None => {
            setup_local_tracing()?;
            None
        }
    };
    rt.block_on(run(broker_config))
}

async fn run(config: BrokerConfig) -> AppResult<()> {
    // no network transport ships yet, so the broker runs in its own hub
    let hub = LocalHub::new();
    let broker = Broker::start_local(config, &hub).await?;

    if let Err(e) = signal::ctrl_c().await {
        error!("waiting for ctrl-c failed: {}", e);
    }
    info!("got shutdown signal");
    broker.shutdown().await;
    Ok(())
}
