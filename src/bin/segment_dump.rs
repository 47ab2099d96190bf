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

use std::fs;
use std::path::PathBuf;

use chrono::TimeZone;
use clap::{Parser, Subcommand};
use driftmq::{AppError, AppResult, CheckPointFile, ReadOnlyIndexFile, Record};

/// Inspects the files of a partition directory.
#[derive(Parser)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every record of a `<base>.log` segment
    Log {
        #[arg(short, long)]
        file: PathBuf,
        /// also print record values as lossy utf-8
        #[arg(long)]
        values: bool,
    },
    /// Print the entries of a `<base>.index` file
    Index {
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Print a `replication.checkpoint` file
    Checkpoint {
        #[arg(short, long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> AppResult<()> {
    let cli = Cli::parse();
    match &cli.command {
        Commands::Log { file, values } => dump_log(file, *values),
        Commands::Index { file } => dump_index(file),
        Commands::Checkpoint { file } => dump_checkpoint(file).await,
    }
}

fn dump_log(file: &PathBuf, values: bool) -> AppResult<()> {
    let buf = fs::read(file)?;
    let mut position = 0;
    let mut count = 0;
    while position < buf.len() {
        match Record::decode(&buf[position..]) {
            Ok(Some((record, size))) => {
                let time = chrono::Local
                    .timestamp_millis_opt(record.timestamp)
                    .single()
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| record.timestamp.to_string());
                let key = record
                    .key
                    .as_ref()
                    .map(|k| String::from_utf8_lossy(k).into_owned())
                    .unwrap_or_else(|| "-".to_string());
                print!(
                    "offset: {} position: {} size: {} epoch: {} time: {} key: {} headers: {}",
                    record.offset,
                    position,
                    size,
                    record.leader_epoch,
                    time,
                    key,
                    record.headers.len()
                );
                if values {
                    print!(" value: {}", String::from_utf8_lossy(&record.value));
                }
                println!();
                position += size;
                count += 1;
            }
            Ok(None) => {
                println!(
                    "torn record at position {}, {} bytes left",
                    position,
                    buf.len() - position
                );
                break;
            }
            Err(AppError::Corrupt(reason)) => {
                println!("corrupt record at position {}: {}", position, reason);
                break;
            }
            Err(e) => return Err(e),
        }
    }
    println!("{} records, {} of {} bytes valid", count, position, buf.len());
    Ok(())
}

fn dump_index(file: &PathBuf) -> AppResult<()> {
    let index = ReadOnlyIndexFile::open(file)?;
    for n in 0..index.entries() {
        let Some((relative_offset, position)) = index.entry(n) else {
            break;
        };
        // the active index is preallocated with zeroes
        if n > 0 && relative_offset == 0 && position == 0 {
            break;
        }
        println!("relative offset: {} position: {}", relative_offset, position);
    }
    Ok(())
}

async fn dump_checkpoint(file: &PathBuf) -> AppResult<()> {
    let points = CheckPointFile::new(file).read_checkpoints().await?;
    for (key, value) in points {
        println!("{}: {}", key, value);
    }
    Ok(())
}
