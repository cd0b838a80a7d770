// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable for the mesh coordinator

use anyhow::{anyhow, Context};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand, ValueEnum};
use mesh_coordinator::{run_openapi, run_server, ApiKind, Config};

#[derive(Debug, Parser)]
#[clap(name = "coordinator", about = "Mesh coordinator")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the coordinator
    Run {
        #[clap(name = "CONFIG_FILE_PATH", action)]
        config_file_path: Utf8PathBuf,
    },
    /// Print the OpenAPI document of one of the APIs and exit
    Openapi {
        #[clap(value_enum)]
        api: Api,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Api {
    Client,
    Marble,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Openapi { api } => {
            let kind = match api {
                Api::Client => ApiKind::Client,
                Api::Marble => ApiKind::Marble,
            };
            run_openapi(kind).map_err(|e| anyhow!(e))
        }
        Command::Run { config_file_path } => {
            let config = Config::from_file(&config_file_path)
                .with_context(|| format!("loading {config_file_path}"))?;
            run_server(config).await.context("running coordinator")
        }
    }
}
